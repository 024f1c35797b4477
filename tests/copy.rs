//! COPY in both directions against a scripted backend.

mod common;

use std::sync::mpsc;
use std::time::{Duration, Instant};

use common::connected;
use pgpoll::{CopyData, Error, FormatCode, ResultStatus, TransactionStatus};

#[test]
fn copy_from_stdin() {
    let (mut conn, server) = connected(|backend| {
        assert_eq!(backend.expect_query(), "COPY t FROM STDIN");
        backend.copy_in_response(2);
        assert_eq!(backend.expect(b'd'), b"1\tone\n");
        assert_eq!(backend.expect(b'd'), b"2\ttwo\n");
        backend.expect(b'c');
        backend.command_complete("COPY 2");
        backend.ready(b'I');
    });
    conn.send_query("COPY t FROM STDIN").unwrap();
    let start = conn.get_result().unwrap().unwrap();
    assert_eq!(start.status().unwrap(), ResultStatus::CopyIn);

    assert!(conn.put_copy_data(b"1\tone\n").unwrap());
    assert!(conn.put_copy_data(b"2\ttwo\n").unwrap());
    assert!(conn.put_copy_end(None).unwrap());

    let done = conn.get_result().unwrap().unwrap();
    assert_eq!(done.status().unwrap(), ResultStatus::CommandOk);
    assert_eq!(done.cmd_tuples().unwrap(), Some(2));
    assert!(conn.get_result().unwrap().is_none());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn copy_from_stdin_aborted_by_client() {
    let (mut conn, server) = connected(|backend| {
        backend.expect_query();
        backend.copy_in_response(1);
        let reason = backend.expect(b'f');
        assert_eq!(reason, b"bad input\0");
        backend.error("57014", "COPY from stdin failed: bad input");
        backend.ready(b'I');
    });
    conn.send_query("COPY t FROM STDIN").unwrap();
    assert_eq!(conn.get_result().unwrap().unwrap().status().unwrap(), ResultStatus::CopyIn);
    assert!(conn.put_copy_end(Some("bad input")).unwrap());

    let failed = conn.get_result().unwrap().unwrap();
    assert_eq!(failed.status().unwrap(), ResultStatus::FatalError);
    assert_eq!(failed.error_field(b'C').unwrap().as_deref(), Some("57014"));
    assert!(conn.get_result().unwrap().is_none());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn server_error_during_extended_copy_in_still_syncs() {
    let (sent, error_sent) = mpsc::channel();
    let (mut conn, server) = connected(move |backend| {
        assert_eq!(backend.expect_extended(), b"PBDES");
        backend.send(b'1', &[]);
        backend.send(b'2', &[]);
        backend.send(b'n', &[]);
        backend.copy_in_response(2);
        assert_eq!(backend.expect(b'd'), b"oops\n");
        backend.error("22P04", "missing data for column \"b\"");
        sent.send(()).unwrap();
        // Everything up to the Sync is discarded.
        backend.expect(b'S');
        backend.ready(b'I');
    });
    conn.send_query_params("COPY t FROM STDIN", &[], FormatCode::Text)
        .unwrap();
    assert_eq!(conn.get_result().unwrap().unwrap().status().unwrap(), ResultStatus::CopyIn);
    assert!(conn.put_copy_data(b"oops\n").unwrap());

    error_sent.recv().unwrap();
    conn.consume_input().unwrap();
    assert_eq!(conn.get_result().unwrap().unwrap().status().unwrap(), ResultStatus::CopyIn);
    assert!(conn.put_copy_end(None).unwrap());

    assert!(conn.block(Some(Duration::from_secs(10))).unwrap());
    let failed = conn.get_result().unwrap().unwrap();
    assert_eq!(failed.status().unwrap(), ResultStatus::FatalError);
    assert_eq!(failed.error_field(b'C').unwrap().as_deref(), Some("22P04"));
    assert!(conn.get_result().unwrap().is_none());
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    drop(conn);
    server.join().unwrap();
}

/// Call `step` until it reports success, as a poll loop would.
fn retry(mut step: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !step() {
        assert!(Instant::now() < deadline, "output did not drain");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn nonblocking_copy_in_reports_full_output() {
    let (go, wait_go) = mpsc::channel();
    let (mut conn, server) = connected(move |backend| {
        backend.expect_query();
        backend.copy_in_response(1);
        wait_go.recv().unwrap();
        let mut rows = 0;
        loop {
            match backend.read_message().0 {
                b'd' => rows += 1,
                b'c' => break,
                other => panic!("unexpected message {}", other as char),
            }
        }
        backend.command_complete(&format!("COPY {rows}"));
        backend.ready(b'I');
    });
    conn.set_nonblocking(true).unwrap();
    conn.send_query("COPY t FROM STDIN").unwrap();
    assert_eq!(conn.get_result().unwrap().unwrap().status().unwrap(), ResultStatus::CopyIn);

    let chunk = vec![b'x'; 8192];
    let mut queued = 0;
    while conn.put_copy_data(&chunk).unwrap() {
        queued += 1;
        assert!(queued < 100_000, "output never filled up");
    }
    assert!(conn.has_pending_output());
    go.send(()).unwrap();

    retry(|| conn.put_copy_data(&chunk).unwrap());
    retry(|| conn.put_copy_end(None).unwrap());
    retry(|| conn.flush().unwrap());

    let done = conn.get_result().unwrap().unwrap();
    assert_eq!(done.status().unwrap(), ResultStatus::CommandOk);
    assert_eq!(done.cmd_tuples().unwrap(), Some(queued + 1));
    assert!(conn.get_result().unwrap().is_none());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn copy_to_stdout() {
    let (mut conn, server) = connected(|backend| {
        assert_eq!(backend.expect_query(), "COPY t TO STDOUT");
        backend.copy_out_response(1);
        backend.send(b'd', b"a\n");
        backend.notice("copy is slow today");
        backend.send(b'd', b"b\n");
        backend.send(b'c', &[]);
        backend.command_complete("COPY 2");
        backend.ready(b'I');
    });
    conn.send_query("COPY t TO STDOUT").unwrap();
    let start = conn.get_result().unwrap().unwrap();
    assert_eq!(start.status().unwrap(), ResultStatus::CopyOut);

    let mut rows = Vec::new();
    loop {
        match conn.get_copy_data(false).unwrap() {
            CopyData::Data(row) => rows.push(row),
            CopyData::Done => break,
            CopyData::WouldBlock => unreachable!("blocking read returned WouldBlock"),
        }
    }
    assert_eq!(rows, vec![b"a\n".to_vec(), b"b\n".to_vec()]);

    let done = conn.get_result().unwrap().unwrap();
    assert_eq!(done.cmd_status().unwrap(), "COPY 2");
    assert!(conn.get_result().unwrap().is_none());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn copy_calls_outside_copy_are_refused() {
    let (mut conn, server) = connected(|_| {});
    assert!(matches!(conn.put_copy_data(b"x"), Err(Error::InvalidUsage(_))));
    assert!(matches!(conn.put_copy_end(None), Err(Error::InvalidUsage(_))));
    assert!(matches!(conn.get_copy_data(true), Err(Error::InvalidUsage(_))));
    drop(conn);
    server.join().unwrap();
}
