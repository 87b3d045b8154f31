//! Cursor behaviour against the mock server

mod common;

use std::time::Duration;

use common::{options, MockServer};
use futures_util::StreamExt;
use photondb_driver::cursor::{CursorStatus, CursorType};
use photondb_driver::error::ErrorKind;
use photondb_driver::network::Connection;
use photondb_driver::{QueryRunner, RunOptions, RunResult, Term};
use serde_json::{json, Value};
use tokio::time::timeout;

async fn connect(server: &MockServer) -> Connection {
    Connection::connect(server.address(), options()).await.unwrap()
}

fn five_rows() -> Term {
    Term::datum(json!([1, 2, 3, 4, 5]))
}

#[tokio::test]
async fn test_batches_are_fetched_in_order() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection.get_cursor(five_rows(), RunOptions::default()).await.unwrap();

    assert_eq!(cursor.cursor_type(), Some(CursorType::Cursor));
    let mut rows = Vec::new();
    for _ in 0..5 {
        rows.push(cursor.next().await.unwrap());
    }
    assert_eq!(rows, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);

    for _ in 0..2 {
        let err = cursor.next().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CursorEnd);
    }
    assert_eq!(cursor.status(), CursorStatus::Exhausted);
    assert_eq!(cursor.try_next().await.unwrap(), None);
}

#[tokio::test]
async fn test_run_collects_sequence() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;

    match connection.run(five_rows(), RunOptions::default()).await.unwrap() {
        RunResult::Sequence { rows, .. } => assert_eq!(rows.len(), 5),
        other => panic!("expected sequence, got {:?}", other),
    }
}

#[tokio::test]
async fn test_atom_holding_array_is_iterable() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;

    let cursor = connection
        .get_cursor(Term::datum("array:3"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(cursor.cursor_type(), Some(CursorType::Atom));
    assert_eq!(cursor.to_array().await.unwrap(), vec![json!(0), json!(1), json!(2)]);

    let value = connection
        .run(Term::datum("array:3"), RunOptions::default())
        .await
        .unwrap()
        .into_value();
    assert_eq!(value, Some(json!([0, 1, 2])));

    let value = connection
        .run(Term::datum("array:0"), RunOptions::default())
        .await
        .unwrap()
        .into_value();
    assert_eq!(value, Some(json!([])));
}

#[tokio::test]
async fn test_runtime_error_is_latched() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection
        .queue(Term::error("boom"), RunOptions::default())
        .await
        .unwrap()
        .unwrap();

    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::User);
    assert!(err.message().starts_with("boom in:"), "{}", err.message());
    assert_eq!(err.query(), Some(&json!([12, ["boom"]])));
    assert_eq!(err.backtrace(), Some(&[][..]));

    let again = cursor.next().await.unwrap_err();
    assert_eq!(again.message(), err.message());
    assert_eq!(cursor.status(), CursorStatus::Errored);
}

#[tokio::test]
async fn test_each_stops_early() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection.get_cursor(five_rows(), RunOptions::default()).await.unwrap();

    let mut seen = Vec::new();
    cursor
        .each(|row| {
            seen.push(row);
            seen.len() < 3
        })
        .await
        .unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(cursor.next().await.unwrap(), json!(4));
}

#[tokio::test]
async fn test_each_async_visits_every_row() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection.get_cursor(five_rows(), RunOptions::default()).await.unwrap();

    let total = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0));
    cursor
        .each_async(|row| {
            let total = total.clone();
            async move {
                total.fetch_add(row.as_i64().unwrap_or_default(), std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
    assert_eq!(total.load(std::sync::atomic::Ordering::SeqCst), 15);
}

#[tokio::test]
async fn test_into_stream() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection.get_cursor(five_rows(), RunOptions::default()).await.unwrap();

    let rows: Vec<Value> = cursor
        .into_stream()
        .map(|row| row.unwrap())
        .collect()
        .await;
    assert_eq!(rows.len(), 5);
}

#[tokio::test]
async fn test_feed_rejects_to_array() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;

    let result = connection
        .run(Term::changes(Term::table("events")), RunOptions::default())
        .await
        .unwrap();
    let RunResult::Feed(cursor) = result else {
        panic!("expected a feed");
    };
    assert_eq!(cursor.cursor_type(), Some(CursorType::Feed));

    let err = cursor.to_array().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cursor);

    assert_eq!(cursor.next().await.unwrap(), json!({"new_val": {"n": 1}}));
    assert_eq!(cursor.next().await.unwrap(), json!({"new_val": {"n": 2}}));
}

#[tokio::test]
async fn test_listen_excludes_pull() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection
        .get_cursor(Term::changes(Term::table("events")), RunOptions::default())
        .await
        .unwrap();

    let mut rows = cursor.listen().unwrap();
    for n in 1..=3 {
        let row = timeout(Duration::from_secs(2), rows.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(row["new_val"]["n"], n);
    }

    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cursor);
    assert_eq!(cursor.listen().unwrap_err().kind(), ErrorKind::Cursor);

    drop(rows);
    assert!(common::eventually(|| cursor.is_closed(), Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_close_interrupts_feed() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection
        .get_cursor(Term::changes(Term::table("server_status")), RunOptions::default())
        .await
        .unwrap();
    assert!(cursor.includes_states());

    // Drain the snapshot; the feed then goes silent.
    while cursor.status() == CursorStatus::HasBufferedRows {
        cursor.next().await.unwrap();
    }
    let waiting = {
        let cursor = cursor.clone();
        tokio::spawn(async move { cursor.next().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cursor.close();
    cursor.close();
    let err = timeout(Duration::from_secs(2), waiting).await.unwrap().unwrap().unwrap_err();
    assert!(err.is_termination(), "{}", err);

    let err = cursor.next().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cursor);
    assert_eq!(cursor.status(), CursorStatus::Closed);
    assert_eq!(connection.num_of_queries(), 0);
}

#[tokio::test]
async fn test_connection_close_fails_cursor() {
    let server = MockServer::start().await;
    let connection = connect(&server).await;
    let cursor = connection
        .queue(Term::datum("sleep:5000"), RunOptions::default())
        .await
        .unwrap()
        .unwrap();

    let waiting = {
        let cursor = cursor.clone();
        tokio::spawn(async move { cursor.next().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    connection.close(false).await.unwrap();

    let err = timeout(Duration::from_secs(2), waiting).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}
