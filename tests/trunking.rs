mod support;

use nfs_mamont_sessions::config::SessionConfig;
use nfs_mamont_sessions::session::{
    grant_direction, BoundDirection, Channel, ConnectionBinder, ConnectionCounts,
    RequestedDirection, SessionError, SessionId, SlotVerdict, Transport, UnbindReason,
};
use nfs_mamont_sessions::xdr::nfs4::{
    channel_dir_from_client4, channel_dir_from_server4, nfsstat4,
    SEQ4_STATUS_CB_PATH_DOWN_SESSION,
};

use support::{establish, manager, manager_with, sequence_args};

fn counts(fore: usize, back: usize, both: usize) -> ConnectionCounts {
    ConnectionCounts { fore, back, both, total: fore + back + both }
}

#[test]
fn direction_table() {
    assert_eq!(grant_direction(RequestedDirection::Fore), BoundDirection::Fore);
    assert_eq!(grant_direction(RequestedDirection::Back), BoundDirection::Back);
    assert_eq!(grant_direction(RequestedDirection::ForeOrBoth), BoundDirection::Both);
    assert_eq!(grant_direction(RequestedDirection::BackOrBoth), BoundDirection::Both);

    assert_eq!(
        RequestedDirection::from(channel_dir_from_client4::CDFC4_BACK_OR_BOTH),
        RequestedDirection::BackOrBoth
    );
    assert_eq!(
        channel_dir_from_server4::from(BoundDirection::Both),
        channel_dir_from_server4::CDFS4_BOTH
    );
}

#[test]
fn creator_connection_is_bound_both_ways() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);

    assert_eq!(manager.counts_for_session(&fx.session), counts(0, 0, 1));
    let binding = manager.binder().binding(fx.conn).expect("creator is bound");
    assert_eq!(binding.session, fx.session);
    assert_eq!(binding.direction, BoundDirection::Both);
}

#[test]
fn creator_without_back_channel_is_fore_only() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", false);

    assert_eq!(manager.counts_for_session(&fx.session), counts(1, 0, 0));
    let session = manager.session(&fx.session).expect("session exists");
    assert!(!session.has_back_channel());
    assert!(session.slot_table(Channel::Back).is_none());
}

#[test]
fn each_connection_counted_once() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);

    let fore = manager.open_connection(Transport::Tcp);
    let back = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(fore, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect("bind fore");
    let result = manager
        .bind_conn_to_session(back, fx.session, RequestedDirection::Back, fx.client, false)
        .expect("bind back");
    assert_eq!(result.direction, BoundDirection::Back);
    assert!(!result.use_rdma);

    assert_eq!(manager.counts_for_session(&fx.session), counts(1, 1, 1));
    assert_eq!(manager.binder().connections_for_session(&fx.session), vec![fx.conn, fore, back]);
}

#[test]
fn session_survives_loss_of_last_fore_connection() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);
    let back = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(back, fx.session, RequestedDirection::Back, fx.client, false)
        .expect("bind back");

    manager.close_connection(fx.conn);

    assert!(manager.session(&fx.session).is_some());
    assert_eq!(manager.counts_for_session(&fx.session), counts(0, 1, 0));
    assert_eq!(manager.binder().binding(fx.conn), None);
    assert_eq!(manager.binder().live_connections(), 1);

    let replacement = manager.open_connection(Transport::Tcp);
    let result = manager
        .bind_conn_to_session(replacement, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect("rebind fore");
    assert_eq!(result.session_id, fx.session);
    assert_eq!(manager.counts_for_session(&fx.session), counts(1, 1, 0));

    let seq = manager
        .sequence(replacement, Channel::Fore, &sequence_args(fx.session, 0, 1))
        .expect("fore channel restored");
    assert_eq!(seq.verdict, SlotVerdict::New);
}

#[test]
fn connection_limit_keeps_existing_bindings() {
    let manager = manager_with(SessionConfig::default().with_max_connections_per_session(16));
    let fx = establish(&manager, b"client-1", false);

    let mut bound = vec![fx.conn];
    for _ in 1..16 {
        let conn = manager.open_connection(Transport::Tcp);
        manager
            .bind_conn_to_session(conn, fx.session, RequestedDirection::Fore, fx.client, false)
            .expect("bind within limit");
        bound.push(conn);
    }

    let extra = manager.open_connection(Transport::Tcp);
    let err = manager
        .bind_conn_to_session(extra, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect_err("17th connection");
    assert_eq!(err, SessionError::ConnectionLimit { session: fx.session, limit: 16 });
    assert_eq!(err.status(), nfsstat4::NFS4ERR_RESOURCE);

    assert_eq!(manager.binder().connections_for_session(&fx.session), bound);
    assert_eq!(manager.binder().binding(extra), None);
}

#[test]
fn lowered_limit_only_affects_new_binds() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", false);
    let second = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(second, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect("bind");

    manager.set_max_connections_per_session(1);
    assert_eq!(manager.counts_for_session(&fx.session).total, 2);

    let third = manager.open_connection(Transport::Tcp);
    let err = manager
        .bind_conn_to_session(third, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect_err("over lowered limit");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_RESOURCE);
}

#[test]
fn rebinding_same_direction_is_idempotent() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);

    let result = manager
        .bind_conn_to_session(fx.conn, fx.session, RequestedDirection::ForeOrBoth, fx.client, false)
        .expect("rebind");
    assert!(result.already_bound);
    assert_eq!(result.direction, BoundDirection::Both);
    assert_eq!(manager.counts_for_session(&fx.session), counts(0, 0, 1));
}

#[test]
fn last_fore_connection_cannot_be_taken_away() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);

    let err = manager
        .bind_conn_to_session(fx.conn, fx.session, RequestedDirection::Back, fx.client, false)
        .expect_err("would leave no fore connection");
    assert_eq!(
        err,
        SessionError::LastForeConnection { session: fx.session, connection: fx.conn }
    );
    assert_eq!(err.status(), nfsstat4::NFS4ERR_INVAL);

    let err = manager.unbind_connection(fx.conn).expect_err("explicit unbind refused");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_INVAL);
    assert_eq!(manager.counts_for_session(&fx.session), counts(0, 0, 1));

    // With a second fore connection the first may become back only.
    let fore = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(fore, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect("bind fore");
    manager
        .bind_conn_to_session(fx.conn, fx.session, RequestedDirection::Back, fx.client, false)
        .expect("now allowed");
    assert_eq!(manager.counts_for_session(&fx.session), counts(1, 1, 0));
}

#[test]
fn moving_connection_between_sessions() {
    let manager = manager();
    let first = establish(&manager, b"client-1", false);
    let second = establish(&manager, b"client-1", false);
    assert_eq!(first.client, second.client);

    let spare = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(spare, first.session, RequestedDirection::Fore, first.client, false)
        .expect("bind to first");
    manager
        .bind_conn_to_session(spare, second.session, RequestedDirection::Fore, second.client, false)
        .expect("move to second");

    assert_eq!(manager.counts_for_session(&first.session), counts(1, 0, 0));
    assert_eq!(manager.counts_for_session(&second.session), counts(2, 0, 0));
}

#[test]
fn only_fore_connection_cannot_move_to_another_session() {
    let manager = manager();
    let first = establish(&manager, b"client-1", false);
    let second = establish(&manager, b"client-1", false);

    let err = manager
        .bind_conn_to_session(first.conn, second.session, RequestedDirection::Fore, first.client, false)
        .expect_err("first session would lose its only fore connection");
    assert_eq!(
        err,
        SessionError::LastForeConnection { session: first.session, connection: first.conn }
    );
    assert_eq!(manager.binder().binding(first.conn).map(|b| b.session), Some(first.session));
    assert_eq!(manager.counts_for_session(&first.session), counts(1, 0, 0));
    assert_eq!(manager.counts_for_session(&second.session), counts(1, 0, 0));
}

#[test]
fn only_fore_connection_among_back_connections() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);
    let other = establish(&manager, b"client-1", false);

    let fore = manager.open_connection(Transport::Tcp);
    let back = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(fore, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect("bind fore");
    manager
        .bind_conn_to_session(back, fx.session, RequestedDirection::Back, fx.client, false)
        .expect("bind back");
    manager
        .bind_conn_to_session(fx.conn, fx.session, RequestedDirection::Back, fx.client, false)
        .expect("creator becomes back only");
    assert_eq!(manager.counts_for_session(&fx.session), counts(1, 2, 0));

    let err = manager
        .bind_conn_to_session(fore, fx.session, RequestedDirection::Back, fx.client, false)
        .expect_err("direction change");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_INVAL);
    let err = manager
        .bind_conn_to_session(fore, other.session, RequestedDirection::Fore, fx.client, false)
        .expect_err("move away");
    assert_eq!(err, SessionError::LastForeConnection { session: fx.session, connection: fore });
    let err = manager.unbind_connection(fore).expect_err("explicit unbind");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_INVAL);

    assert_eq!(manager.counts_for_session(&fx.session), counts(1, 2, 0));
}

#[test]
fn closed_session_refuses_binds_without_touching_current_binding() {
    let binder = ConnectionBinder::new(4);
    let kept = SessionId([1; 16]);
    let closed = SessionId([2; 16]);
    binder.open_session(kept);
    binder.register(1, Transport::Tcp);

    let err = binder.bind(1, closed, RequestedDirection::Fore).expect_err("never opened");
    assert_eq!(err, SessionError::BadSession(closed));

    binder.open_session(closed);
    binder.bind(1, kept, RequestedDirection::Fore).expect("bind");
    binder.register(2, Transport::Tcp);
    binder.bind(2, kept, RequestedDirection::Fore).expect("bind");
    binder.unbind_all(&closed);

    let err = binder.bind(1, closed, RequestedDirection::Fore).expect_err("closed");
    assert_eq!(err, SessionError::BadSession(closed));
    assert_eq!(binder.binding(1).map(|b| b.session), Some(kept));
    assert_eq!(binder.counts_for_session(&kept), counts(2, 0, 0));
    assert_eq!(binder.counts_for_session(&closed), ConnectionCounts::default());
}

#[test]
fn sequence_racing_destroy_leaves_no_stale_binding() {
    let manager = manager();
    for _ in 0..100 {
        let fx = establish(&manager, b"client-1", false);
        let conn = manager.open_connection(Transport::Tcp);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let _ = manager.sequence(conn, Channel::Fore, &sequence_args(fx.session, 0, 1));
            });
            scope.spawn(|| {
                manager.destroy_session(fx.session, fx.client).expect("destroy");
            });
        });

        assert_eq!(manager.counts_for_session(&fx.session), ConnectionCounts::default());
        assert!(manager.binder().connections_for_session(&fx.session).is_empty());
        assert_ne!(manager.binder().binding(conn).map(|b| b.session), Some(fx.session));
        manager.close_connection(fx.conn);
        manager.close_connection(conn);
    }
}

#[test]
fn foreign_session_is_bad_session() {
    let manager = manager();
    let mine = establish(&manager, b"client-1", false);
    let theirs = establish(&manager, b"client-2", false);

    let conn = manager.open_connection(Transport::Tcp);
    let err = manager
        .bind_conn_to_session(conn, theirs.session, RequestedDirection::Fore, mine.client, false)
        .expect_err("not the owner");
    assert_eq!(err.status(), nfsstat4::NFS4ERR_BADSESSION);

    let err = manager
        .bind_conn_to_session(conn, SessionId([9; 16]), RequestedDirection::Fore, mine.client, true)
        .expect_err("unknown session");
    assert_eq!(err, SessionError::BadSession(SessionId([9; 16])));
}

#[test]
fn sequence_binds_unbound_connection() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", false);
    let conn = manager.open_connection(Transport::Tcp);

    manager
        .sequence(conn, Channel::Fore, &sequence_args(fx.session, 1, 1))
        .expect("sequence");
    let binding = manager.binder().binding(conn).expect("implicitly bound");
    assert_eq!(binding.session, fx.session);
    assert_eq!(binding.direction, BoundDirection::Fore);
    assert_eq!(manager.session_for_connection(conn).map(|s| s.id()), Some(fx.session));
}

#[test]
fn callback_path_down_is_reported() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);
    let fore = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(fore, fx.session, RequestedDirection::Fore, fx.client, false)
        .expect("bind fore");

    let seq = manager
        .sequence(fore, Channel::Fore, &sequence_args(fx.session, 0, 1))
        .expect("sequence");
    assert_eq!(seq.status_flags & SEQ4_STATUS_CB_PATH_DOWN_SESSION, 0);

    manager.close_connection(fx.conn);
    manager
        .complete_request(&fx.session, Channel::Fore, 0, 1, false, &[])
        .expect("complete");
    let seq = manager
        .sequence(fore, Channel::Fore, &sequence_args(fx.session, 0, 2))
        .expect("sequence");
    assert_ne!(seq.status_flags & SEQ4_STATUS_CB_PATH_DOWN_SESSION, 0);
}

#[test]
fn unbind_is_idempotent() {
    let binder = ConnectionBinder::new(4);
    let session = SessionId([1; 16]);
    binder.open_session(session);
    binder.register(1, Transport::Tcp);
    binder.bind(1, session, RequestedDirection::Fore).expect("bind");

    assert!(binder.unbind(1, UnbindReason::Explicit).is_some());
    assert!(binder.unbind(1, UnbindReason::Explicit).is_none());
    assert_eq!(binder.counts_for_session(&session), ConnectionCounts::default());
    assert_eq!(binder.live_connections(), 1);

    assert!(binder.connection_closed(1).is_none());
    assert!(binder.connection_closed(1).is_none());
    assert_eq!(binder.live_connections(), 0);
}

#[test]
fn destroyed_session_releases_connections() {
    let manager = manager();
    let fx = establish(&manager, b"client-1", true);
    let other = manager.open_connection(Transport::Tcp);
    manager
        .bind_conn_to_session(other, fx.session, RequestedDirection::BackOrBoth, fx.client, false)
        .expect("bind");

    manager.destroy_session(fx.session, fx.client).expect("destroy");
    assert_eq!(manager.binder().binding(fx.conn), None);
    assert_eq!(manager.binder().binding(other), None);
    assert_eq!(manager.counts_for_session(&fx.session), ConnectionCounts::default());
    assert_eq!(manager.binder().live_connections(), 2);
}

#[test]
fn draining_connection() {
    let manager = manager();
    let conn = manager.open_connection(Transport::Tcp);
    assert!(!manager.is_draining(conn));
    assert!(manager.mark_draining(conn));
    assert!(manager.is_draining(conn));
    assert!(!manager.mark_draining(conn + 1000));
}

#[test]
fn concurrent_binds_respect_limit() {
    let binder = ConnectionBinder::new(16);
    let session = SessionId([7; 16]);
    binder.open_session(session);

    std::thread::scope(|scope| {
        for conn in 1..=64_u64 {
            let binder = &binder;
            scope.spawn(move || {
                binder.register(conn, Transport::Tcp);
                let _ = binder.bind(conn, session, RequestedDirection::ForeOrBoth);
            });
        }
    });

    assert_eq!(binder.counts_for_session(&session), counts(0, 0, 16));
    assert_eq!(binder.connections_for_session(&session).len(), 16);
    assert_eq!(binder.live_connections(), 64);
}
