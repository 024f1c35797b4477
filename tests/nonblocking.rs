//! Poll-driven use of `Conn` against a scripted backend.

mod common;

use std::sync::mpsc;
use std::time::{Duration, Instant};

use common::{BACKEND_PID, connected, poll_until_settled, start};
use pgpoll::{AsyncMessage, ConnStatus, Error, PgResult, PollStatus, ResultStatus, TransactionStatus};

/// Poll loop: consume, check busy, take results until `None`.
fn drain(conn: &mut pgpoll::Conn) -> Vec<PgResult> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut results = Vec::new();
    loop {
        conn.consume_input().unwrap();
        if conn.is_busy() {
            assert!(Instant::now() < deadline, "command did not finish");
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        match conn.get_result().unwrap() {
            Some(result) => results.push(result),
            None => return results,
        }
    }
}

#[test]
fn handshake_reports_session_state() {
    let (conn, server) = connected(|_| {});
    assert_eq!(conn.parameter_status("server_version"), Some("16.2"));
    assert_eq!(conn.server_version(), 160_002);
    assert_eq!(conn.protocol_version(), 3);
    assert_eq!(conn.backend_pid(), BACKEND_PID);
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    assert_eq!(conn.user().as_deref(), Some("alice"));
    assert_eq!(conn.db().as_deref(), Some("app"));
    assert!(!conn.connection_used_password());
    assert!(conn.socket().is_some());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn handshake_error_fails_the_poll() {
    let (mut conn, mut backend) = start();
    let server = std::thread::spawn(move || {
        backend.read_startup();
        backend.error("28000", "role \"alice\" does not exist");
        backend.drain_until_closed();
    });
    assert_eq!(poll_until_settled(&mut conn), PollStatus::Failed);
    assert_eq!(conn.status(), ConnStatus::Bad);
    assert!(conn.error_message().contains("role \"alice\" does not exist"));
    drop(conn);
    server.join().unwrap();
}

#[test]
fn multiple_statements_yield_one_result_each() {
    let (mut conn, server) = connected(|backend| {
        assert_eq!(backend.expect_query(), "SELECT 'x'; UPDATE t SET a = 1");
        backend.row_description(&["v"]);
        backend.data_row(&[Some("x")]);
        backend.command_complete("SELECT 1");
        backend.command_complete("UPDATE 3");
        backend.ready(b'I');
    });
    conn.set_nonblocking(true).unwrap();
    conn.send_query("SELECT 'x'; UPDATE t SET a = 1").unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Active);

    let results = drain(&mut conn);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status().unwrap(), ResultStatus::TuplesOk);
    assert_eq!(results[0].get_str(0, 0).unwrap(), Some("x"));
    assert_eq!(results[0].fname(0).unwrap(), "v");
    assert_eq!(results[1].status().unwrap(), ResultStatus::CommandOk);
    assert_eq!(results[1].cmd_tuples().unwrap(), Some(3));

    // Drained stays drained.
    assert!(conn.get_result().unwrap().is_none());
    assert!(conn.get_result().unwrap().is_none());
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    drop(conn);
    server.join().unwrap();
}

#[test]
fn second_command_while_busy_is_refused() {
    let (mut conn, server) = connected(|backend| {
        backend.expect_query();
        backend.single_value("n", "1");
    });
    conn.send_query("SELECT 1").unwrap();
    let err = conn.send_query("SELECT 2").unwrap_err();
    assert!(matches!(err, Error::Dispatch(_)), "{err:?}");

    let results = drain(&mut conn);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get_str(0, 0).unwrap(), Some("1"));
    drop(conn);
    server.join().unwrap();
}

#[test]
fn extended_query_error_result() {
    let (mut conn, server) = connected(|backend| {
        let types = backend.expect_extended();
        assert_eq!(types, b"PBDES");
        backend.send(b'1', &[]);
        backend.error("22P02", "invalid input syntax for type integer: \"x\"");
        backend.ready(b'I');
    });
    conn.send_query_params("SELECT $1::int", &[pgpoll::Param::text("x")], pgpoll::FormatCode::Text)
        .unwrap();
    let results = drain(&mut conn);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status().unwrap(), ResultStatus::FatalError);
    assert_eq!(results[0].error_field(b'C').unwrap().as_deref(), Some("22P02"));
    assert!(results[0].error_message().unwrap().contains("invalid input syntax"));
    drop(conn);
    server.join().unwrap();
}

#[test]
fn notifications_are_queued() {
    let (mut conn, server) = connected(|backend| {
        assert_eq!(backend.expect_query(), "LISTEN jobs");
        backend.command_complete("LISTEN");
        backend.ready(b'I');
        backend.notification(77, "jobs", "42");
    });
    conn.send_query("LISTEN jobs").unwrap();
    drain(&mut conn);

    let deadline = Instant::now() + Duration::from_secs(10);
    let notification = loop {
        conn.consume_input().unwrap();
        if let Some(n) = conn.notifies() {
            break n;
        }
        assert!(Instant::now() < deadline, "no notification arrived");
        std::thread::sleep(Duration::from_millis(1));
    };
    assert_eq!(notification.relname, "jobs");
    assert_eq!(notification.be_pid, 77);
    assert_eq!(notification.extra, "42");
    assert!(conn.notifies().is_none());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn notice_receiver_is_replaceable() {
    let (mut conn, server) = connected(|backend| {
        backend.expect_query();
        backend.notice("identifier will be truncated");
        backend.command_complete("DO");
        backend.ready(b'I');
    });
    let (tx, rx) = mpsc::channel();
    let previous = conn.set_notice_receiver(Some(Box::new(move |msg: &AsyncMessage| {
        if let AsyncMessage::Notice(notice) = msg {
            tx.send(notice.message.clone()).unwrap();
        }
    })));
    assert!(previous.is_some());

    conn.send_query("DO $$ BEGIN END $$").unwrap();
    let results = drain(&mut conn);
    assert_eq!(results[0].cmd_status().unwrap(), "DO");
    let notice = rx.try_recv().unwrap();
    assert!(notice.contains("identifier will be truncated"), "{notice}");
    drop(conn);
    server.join().unwrap();
}

#[test]
fn notice_processor_gets_text_and_can_be_removed() {
    let (mut conn, server) = connected(|backend| {
        backend.expect_query();
        backend.notice("first");
        backend.command_complete("DO");
        backend.ready(b'I');
        backend.expect_query();
        backend.notice("second");
        backend.command_complete("DO");
        backend.ready(b'I');
    });
    let (tx, rx) = mpsc::channel();
    assert!(conn.set_notice_processor(Some(Box::new(move |text: &str| {
        tx.send(text.to_string()).unwrap();
    })))
    .is_none());

    conn.send_query("DO $$ BEGIN END $$").unwrap();
    drain(&mut conn);
    let text = rx.try_recv().unwrap();
    assert!(text.starts_with("NOTICE:  first"), "{text}");

    assert!(conn.set_notice_processor(None).is_some());
    conn.send_query("DO $$ BEGIN END $$").unwrap();
    drain(&mut conn);
    assert!(rx.try_recv().is_err());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn server_hang_up_becomes_fatal_result() {
    let (mut conn, server) = connected(|backend| {
        backend.expect_query();
        backend.hang_up();
    });
    conn.send_query("SELECT pg_sleep(60)").unwrap();
    let result = conn.get_result().unwrap().unwrap();
    assert_eq!(result.status().unwrap(), ResultStatus::FatalError);
    assert!(result.error_message().unwrap().contains("server closed the connection unexpectedly"));
    assert!(conn.get_result().unwrap().is_none());
    assert_eq!(conn.status(), ConnStatus::Bad);
    assert!(matches!(conn.send_query("SELECT 1"), Err(Error::Dispatch(_))));
    drop(conn);
    server.join().unwrap();
}

#[test]
fn cancel_without_command_fails() {
    let (conn, server) = connected(|_| {});
    assert!(matches!(conn.cancel(), Err(Error::CancelFailed(_))));
    drop(conn);
    server.join().unwrap();
}

#[test]
fn supplied_stream_cannot_reset() {
    let (mut conn, server) = connected(|_| {});
    assert!(matches!(conn.reset_start(), Err(Error::Reset(_))));
    drop(conn);
    server.join().unwrap();
}

#[test]
fn closed_connection_refuses_work() {
    let (mut conn, server) = connected(|backend| {
        assert_eq!(backend.read_message().0, b'X');
    });
    conn.close();
    conn.close();
    assert!(conn.is_closed());
    assert!(matches!(conn.send_query("SELECT 1"), Err(Error::ConnectionClosed)));
    assert!(matches!(conn.consume_input(), Err(Error::ConnectionClosed)));
    server.join().unwrap();
    drop(conn);
}

#[test]
fn escaping_follows_session_settings() {
    let (conn, server) = connected(|_| {});
    assert_eq!(conn.escape_string("it's"), "it''s");
    assert_eq!(conn.escape_literal("a\\b"), " E'a\\\\b'");
    assert_eq!(conn.escape_identifier("Tab\"le").unwrap(), "\"Tab\"\"le\"");
    let empty = conn.make_empty_result(ResultStatus::CommandOk);
    assert_eq!(empty.ntuples().unwrap(), 0);
    drop(conn);
    server.join().unwrap();
}

#[derive(Clone, Default)]
struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn protocol_trace_lines() {
    let (mut conn, server) = connected(|backend| {
        backend.expect_query();
        backend.command_complete("SET");
        backend.ready(b'I');
        backend.expect_query();
        backend.command_complete("SET");
        backend.ready(b'I');
    });
    let sink = SharedSink::default();
    conn.trace(Box::new(sink.clone()));
    conn.send_query("SET x = 1").unwrap();
    drain(&mut conn);
    conn.untrace();
    conn.send_query("SET x = 2").unwrap();
    drain(&mut conn);

    let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, ["To backend> Q 14", "From backend> C 8", "From backend> Z 5"]);
    drop(conn);
    server.join().unwrap();
}

#[test]
fn error_verbosity_shapes_messages() {
    let (mut conn, server) = connected(|backend| {
        backend.expect_query();
        backend.error("42703", "column \"nope\" does not exist");
        backend.ready(b'I');
    });
    assert_eq!(conn.set_error_verbosity(pgpoll::Verbosity::Verbose), pgpoll::Verbosity::Default);
    conn.send_query("SELECT nope").unwrap();
    let results = drain(&mut conn);
    let message = results[0].error_message().unwrap();
    assert!(message.starts_with("ERROR:  42703: column \"nope\" does not exist"), "{message}");
    drop(conn);
    server.join().unwrap();
}
