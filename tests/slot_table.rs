use std::sync::atomic::{AtomicUsize, Ordering};

use nfs_mamont_sessions::session::{SessionError, SlotTable, SlotVerdict};
use nfs_mamont_sessions::xdr::nfs4::nfsstat4;

#[test]
fn retry_returns_cached_reply_and_gap_is_misordered() {
    let table = SlotTable::new(4);

    assert_eq!(table.validate_sequence(0, 1), Ok(SlotVerdict::New));
    table.complete_slot_request(0, 1, true, b"reply X").expect("complete");

    match table.validate_sequence(0, 1) {
        Ok(SlotVerdict::Retry(reply)) => assert_eq!(&reply[..], b"reply X"),
        other => panic!("expected cached retry, got {other:?}"),
    }

    let err = table.validate_sequence(0, 3).expect_err("gap must be refused");
    assert_eq!(err, SessionError::SeqMisordered { slot: 0, sequence: 3 });
    assert_eq!(err.status(), nfsstat4::NFS4ERR_SEQ_MISORDERED);

    // The refused request left the slot untouched.
    assert_eq!(table.validate_sequence(0, 2), Ok(SlotVerdict::New));
}

#[test]
fn retry_while_executing_is_delayed() {
    let table = SlotTable::new(1);
    assert_eq!(table.validate_sequence(0, 1), Ok(SlotVerdict::New));

    let err = table.validate_sequence(0, 1).expect_err("original still running");
    assert_eq!(err, SessionError::Delay { slot: 0, sequence: 1 });
    assert_eq!(err.status(), nfsstat4::NFS4ERR_DELAY);

    let err = table.validate_sequence(0, 2).expect_err("slot is busy");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_SEQ_MISORDERED);
    assert_eq!(table.in_flight(), 1);
}

#[test]
fn retry_of_uncached_reply() {
    let table = SlotTable::new(1);
    table.validate_sequence(0, 1).expect("new");
    table.complete_slot_request(0, 1, false, b"not kept").expect("complete");

    let err = table.validate_sequence(0, 1).expect_err("nothing cached");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_RETRY_UNCACHED_REP);
}

#[test]
fn slot_outside_table() {
    let table = SlotTable::new(2);
    let err = table.validate_sequence(2, 1).expect_err("slot 2 does not exist");
    assert_eq!(err, SessionError::BadSlot { slot: 2, highest: 1 });
    assert_eq!(err.status(), nfsstat4::NFS4ERR_BADSLOT);
}

#[test]
fn fresh_slot_starts_at_one() {
    let table = SlotTable::new(2);
    let err = table.validate_sequence(1, 2).expect_err("first request uses 1");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_SEQ_MISORDERED);
    assert_eq!(table.validate_sequence(1, 1), Ok(SlotVerdict::New));
    assert_eq!(table.status().highest_used_slot, None);
}

#[test]
fn completion_without_request_is_refused() {
    let table = SlotTable::new(1);
    let err = table.complete_slot_request(0, 1, true, b"x").expect_err("nothing in flight");
    assert_eq!(err, SessionError::SlotNotInUse { slot: 0, sequence: 1 });
}

#[test]
fn oversized_reply_releases_slot_uncached() {
    let table = SlotTable::with_cache_limit(1, 4);
    table.validate_sequence(0, 1).expect("new");

    let err = table.complete_slot_request(0, 1, true, b"too large").expect_err("over limit");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_REP_TOO_BIG_TO_CACHE);
    assert_eq!(table.in_flight(), 0);

    let err = table.validate_sequence(0, 1).expect_err("reply was not cached");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_RETRY_UNCACHED_REP);
    assert_eq!(table.validate_sequence(0, 2), Ok(SlotVerdict::New));
}

#[test]
fn new_request_drops_previous_reply() {
    let table = SlotTable::new(1);
    table.validate_sequence(0, 1).expect("new");
    table.complete_slot_request(0, 1, true, b"first").expect("complete");
    table.validate_sequence(0, 2).expect("new");
    table.complete_slot_request(0, 2, true, b"second").expect("complete");

    match table.validate_sequence(0, 2) {
        Ok(SlotVerdict::Retry(reply)) => assert_eq!(&reply[..], b"second"),
        other => panic!("expected cached retry, got {other:?}"),
    }
    assert!(table.validate_sequence(0, 1).is_err());
}

#[test]
fn shrink_waits_for_client_acknowledgement() {
    let table = SlotTable::new(8);
    assert_eq!(table.status().highest_slot, 7);
    assert_eq!(table.status().target_highest_slot, 7);

    assert_eq!(table.set_target_highest_slot(3), 3);
    assert_eq!(table.slot_count(), 8);

    // Client still uses slot 5.
    assert!(!table.acknowledge_highest_slot(5));
    assert_eq!(table.slot_count(), 8);

    // Busy slot above the target blocks the shrink.
    table.validate_sequence(6, 1).expect("new");
    assert!(!table.acknowledge_highest_slot(3));
    table.complete_slot_request(6, 1, false, &[]).expect("complete");

    assert!(table.acknowledge_highest_slot(3));
    assert_eq!(table.slot_count(), 4);
    let status = table.status();
    assert_eq!(status.highest_slot, 3);
    assert_eq!(status.target_highest_slot, 3);
    assert_eq!(status.highest_used_slot, Some(3));

    assert!(table.validate_sequence(6, 2).is_err());
}

#[test]
fn target_is_clamped_to_table() {
    let table = SlotTable::new(4);
    assert_eq!(table.set_target_highest_slot(100), 3);
    assert!(!table.acknowledge_highest_slot(3));
    assert_eq!(SlotTable::new(0).slot_count(), 1);
}

#[test]
fn different_slots_run_concurrently() {
    const THREADS: u32 = 8;
    const ROUNDS: u32 = 500;

    let table = SlotTable::new(THREADS);
    let retries = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for slot in 0..THREADS {
            let table = &table;
            let retries = &retries;
            scope.spawn(move || {
                for sequence in 1..=ROUNDS {
                    assert_eq!(table.validate_sequence(slot, sequence), Ok(SlotVerdict::New));
                    let reply = [slot as u8, sequence as u8];
                    table.complete_slot_request(slot, sequence, true, &reply).expect("complete");
                    if let Ok(SlotVerdict::Retry(cached)) = table.validate_sequence(slot, sequence) {
                        assert_eq!(&cached[..], &reply);
                        retries.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert_eq!(retries.load(Ordering::Relaxed), (THREADS * ROUNDS) as usize);
    assert_eq!(table.in_flight(), 0);
    assert_eq!(table.status().highest_used_slot, Some(THREADS - 1));
}

#[test]
fn one_slot_admits_one_request_at_a_time() {
    let table = SlotTable::new(1);
    let admitted = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                if table.validate_sequence(0, 1) == Ok(SlotVerdict::New) {
                    admitted.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(admitted.load(Ordering::Relaxed), 1);
}
