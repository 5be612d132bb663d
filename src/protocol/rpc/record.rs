//! Record Marking Standard (RFC 5531 section 11) for RPC over TCP.
//!
//! A record is a sequence of fragments. Each fragment starts with a 4-byte
//! big-endian header: the low 31 bits hold the fragment length and the high
//! bit is set on the last fragment of the record.

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::protocol::rpc::MAX_RPC_RECORD_LENGTH;

const LAST_FRAGMENT_BIT: u32 = 1 << 31;
const FRAGMENT_LENGTH_MASK: u32 = LAST_FRAGMENT_BIT - 1;

/// Reads one fragment and appends it to `append_to`.
///
/// Returns `Some(true)` if this was the last fragment of the record and
/// `None` if the stream ended before the first header byte of a new record.
async fn read_fragment<S: AsyncRead + Unpin>(
    socket: &mut S,
    append_to: &mut Vec<u8>,
    first: bool,
) -> Result<Option<bool>, anyhow::Error> {
    let mut header_buf = [0_u8; 4];
    match socket.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if first && e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let fragment_header = u32::from_be_bytes(header_buf);
    let is_last = (fragment_header & LAST_FRAGMENT_BIT) > 0;
    let length = (fragment_header & FRAGMENT_LENGTH_MASK) as usize;
    trace!("Reading fragment length:{}, last:{}", length, is_last);
    if append_to.len().saturating_add(length) > MAX_RPC_RECORD_LENGTH {
        return Err(anyhow!(
            "RPC record length {} exceeds max {}",
            append_to.len().saturating_add(length),
            MAX_RPC_RECORD_LENGTH
        ));
    }
    let start_offset = append_to.len();
    append_to.resize(start_offset + length, 0);
    socket.read_exact(&mut append_to[start_offset..]).await?;
    Ok(Some(is_last))
}

/// Reads a complete record-marked RPC message from `socket`.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// records; a stream that ends in the middle of a record is an error.
pub async fn read_record<S: AsyncRead + Unpin>(
    socket: &mut S,
) -> Result<Option<Vec<u8>>, anyhow::Error> {
    let mut record = Vec::new();
    let mut first = true;
    loop {
        match read_fragment(socket, &mut record, first).await? {
            Some(true) => return Ok(Some(record)),
            Some(false) => first = false,
            None => return Ok(None),
        }
    }
}

/// Writes `buf` as one record made of as many fragments as needed.
pub async fn write_fragment<S: AsyncWrite + Unpin>(
    socket: &mut S,
    buf: &[u8],
) -> Result<(), anyhow::Error> {
    const MAX_FRAGMENT_SIZE: usize = FRAGMENT_LENGTH_MASK as usize;

    let mut offset = 0;
    loop {
        let remaining = buf.len() - offset;
        let fragment_size = std::cmp::min(remaining, MAX_FRAGMENT_SIZE);
        let is_last = offset + fragment_size >= buf.len();

        let fragment_header =
            if is_last { fragment_size as u32 | LAST_FRAGMENT_BIT } else { fragment_size as u32 };
        socket.write_all(&fragment_header.to_be_bytes()).await?;

        trace!("Writing fragment length:{}, last:{}", fragment_size, is_last);
        socket.write_all(&buf[offset..offset + fragment_size]).await?;

        offset += fragment_size;
        if is_last {
            break;
        }
    }
    socket.flush().await?;

    Ok(())
}
