use std::io::{Read, Write};

/// Every XDR item occupies a multiple of four bytes.
pub const ALIGNMENT: usize = 4;

fn padding_len(src_len: usize) -> usize {
    (ALIGNMENT - (src_len % ALIGNMENT)) % ALIGNMENT
}

/// Consumes the zero bytes that follow an opaque item of `src_len` bytes.
pub fn read_padding(src_len: usize, src: &mut impl Read) -> std::io::Result<()> {
    let pad_len = padding_len(src_len);
    if pad_len > 0 {
        let mut padding_buffer = [0_u8; ALIGNMENT];
        src.read_exact(&mut padding_buffer[..pad_len])?;
    }
    Ok(())
}

/// Writes the zero bytes that align an opaque item of `src_len` bytes.
pub fn write_padding(src_len: usize, dest: &mut impl Write) -> std::io::Result<()> {
    let pad_len = padding_len(src_len);
    if pad_len > 0 {
        dest.write_all(&[0_u8; ALIGNMENT][..pad_len])?;
    }
    Ok(())
}

pub fn invalid_data(m: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m)
}
