use std::{sync::Arc, time::Duration};

use bson::{doc, Document};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;

use crate::{
    cursor::{Cursor, StreamOptions},
    error::{Error, ErrorKind},
    options::{CursorFlags, CursorOptions},
    test::mock::MockTopology,
};

fn find_reply(cursor_id: i64, first_batch: Vec<Document>) -> Document {
    doc! {
        "ok": 1,
        "cursor": { "id": cursor_id, "ns": "db.c", "firstBatch": first_batch },
    }
}

fn get_more_reply(cursor_id: i64, batch: Vec<Document>) -> Document {
    doc! {
        "ok": 1,
        "cursor": { "id": cursor_id, "ns": "db.c", "nextBatch": batch },
    }
}

fn command_failure(code: i32, code_name: &str) -> Document {
    doc! { "ok": 0, "code": code, "codeName": code_name, "errmsg": "scripted failure" }
}

fn network_error() -> Error {
    ErrorKind::from(std::io::ErrorKind::ConnectionReset).into()
}

fn cursor(topology: &Arc<MockTopology>, options: CursorOptions) -> Cursor {
    Cursor::from_command(
        topology.clone(),
        "db",
        doc! { "find": "c" },
        options,
    )
    .unwrap()
}

#[tokio::test]
async fn drains_across_batches_until_id_zero() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![doc! { "x": 1 }, doc! { "x": 2 }]));
    // A zero id alongside a non-empty batch is still valid: drain first.
    transport.script("getMore", get_more_reply(0, vec![doc! { "x": 3 }]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    let docs = cursor.to_vec().await.unwrap();
    assert_eq!(
        docs,
        vec![doc! { "x": 1 }, doc! { "x": 2 }, doc! { "x": 3 }]
    );
    assert!(cursor.is_exhausted());
    assert_eq!(transport.commands_named("getMore").len(), 1);
    // A drained cursor needs no killCursors.
    assert_eq!(transport.commands_named("killCursors").len(), 0);
}

#[tokio::test]
async fn next_after_natural_end_reports_exhaustion() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(0, vec![doc! { "x": 1 }]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 1 }));
    assert_eq!(cursor.next().await.unwrap(), None);

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::CursorExhausted));
    // The softer probes keep reporting end-of-stream instead.
    assert!(!cursor.has_next().await.unwrap());
    assert_eq!(cursor.try_next().await.unwrap(), None);
}

#[tokio::test]
async fn try_next_stops_at_an_empty_batch() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script("getMore", get_more_reply(7, vec![]));
    transport.script("getMore", get_more_reply(7, vec![doc! { "x": 1 }]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert_eq!(cursor.try_next().await.unwrap(), None);
    // The cursor is still live; the next call picks up where it left off.
    assert_eq!(cursor.try_next().await.unwrap(), Some(doc! { "x": 1 }));
}

#[tokio::test]
async fn has_next_peeks_without_consuming() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script("getMore", get_more_reply(7, vec![doc! { "x": 1 }]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert!(cursor.has_next().await.unwrap());
    let get_mores = transport.commands_named("getMore").len();
    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 1 }));
    // The peeked document was served from the buffer.
    assert_eq!(transport.commands_named("getMore").len(), get_mores);
}

#[tokio::test]
async fn mutators_fail_once_initialized() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(0, vec![]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    cursor.set_batch_size(10).unwrap();
    cursor.set_max_time(Duration::from_secs(1)).unwrap();

    assert_eq!(cursor.next().await.unwrap(), None);

    for result in [
        cursor.set_batch_size(10),
        cursor.set_max_time(Duration::from_secs(1)),
        cursor.add_cursor_flag(CursorFlags::NO_CURSOR_TIMEOUT),
        cursor.map(Ok),
    ] {
        let error = result.unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::CursorInUse { .. }));
    }
}

#[tokio::test]
async fn tailable_cursors_reject_batch_size_changes() {
    let topology = MockTopology::new();
    let mut cursor = cursor(&topology, CursorOptions::default());
    cursor.add_cursor_flag(CursorFlags::TAILABLE).unwrap();

    let error = cursor.set_batch_size(10).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::TailableCursor { .. }));

    let error = cursor.to_vec().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::TailableCursor { .. }));
}

#[tokio::test]
async fn rewind_resets_to_preinitialized_state() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(0, vec![doc! { "x": 1 }]));
    transport.script("find", find_reply(0, vec![doc! { "x": 2 }]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert_eq!(cursor.to_vec().await.unwrap(), vec![doc! { "x": 1 }]);

    cursor.rewind();
    assert!(!cursor.is_closed());
    // Mutation is legal again before the re-run.
    cursor.set_batch_size(3).unwrap();
    assert_eq!(cursor.to_vec().await.unwrap(), vec![doc! { "x": 2 }]);
    assert_eq!(transport.commands_named("find").len(), 2);
}

#[tokio::test]
async fn close_kills_the_live_server_cursor_once() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![doc! { "x": 1 }, doc! { "x": 2 }]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 1 }));

    cursor.close().await;
    cursor.close().await;
    assert!(cursor.is_killed());

    let kills = transport.commands_named("killCursors");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].body.get_array("cursors").unwrap(), &vec![7_i64.into()]);

    // Buffered documents survive the close but ordinary iteration ends.
    assert_eq!(cursor.next().await.unwrap(), None);
    assert_eq!(cursor.take_buffered(), vec![doc! { "x": 2 }]);
}

#[tokio::test]
async fn response_without_cursor_is_a_single_document() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("explain", doc! { "ok": 1, "queryPlanner": { "winningPlan": "COLLSCAN" } });

    let mut cursor = Cursor::from_command(
        topology.clone(),
        "db",
        doc! { "explain": { "find": "c" } },
        CursorOptions::default(),
    )
    .unwrap();

    let only = cursor.next().await.unwrap().unwrap();
    assert_eq!(
        only.get_document("queryPlanner").unwrap(),
        &doc! { "winningPlan": "COLLSCAN" }
    );
    assert_eq!(cursor.next().await.unwrap(), None);
    assert_eq!(transport.commands_named("getMore").len(), 0);
}

#[tokio::test]
async fn transforms_compose_in_application_order() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(0, vec![doc! {}]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    cursor
        .map(|mut doc| {
            doc.insert("first", 1);
            Ok(doc)
        })
        .unwrap();
    cursor
        .map(|mut doc| {
            let earlier = doc.get_i32("first").unwrap();
            doc.insert("second", earlier + 1);
            Ok(doc)
        })
        .unwrap();

    assert_eq!(
        cursor.next().await.unwrap(),
        Some(doc! { "first": 1, "second": 2 })
    );
}

#[tokio::test]
async fn stream_yields_documents_and_ends() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![doc! { "x": 1 }]));
    transport.script("getMore", get_more_reply(0, vec![doc! { "x": 2 }]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    let docs: Vec<_> = cursor.stream().collect().await;
    let docs: Vec<Document> = docs.into_iter().collect::<crate::error::Result<_>>().unwrap();
    assert_eq!(docs, vec![doc! { "x": 1 }, doc! { "x": 2 }]);
}

#[tokio::test]
async fn stream_transform_layers_on_cursor_transform() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(0, vec![doc! {}]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    cursor
        .map(|mut doc| {
            doc.insert("cursor_level", true);
            Ok(doc)
        })
        .unwrap();

    let options = StreamOptions::with_transform(|mut doc| {
        let seen_cursor_level = doc.get_bool("cursor_level").unwrap_or(false);
        doc.insert("stream_level", seen_cursor_level);
        Ok(doc)
    });
    let docs: Vec<_> = cursor.stream_with(options).collect().await;
    assert_eq!(
        docs.into_iter().next().unwrap().unwrap(),
        doc! { "cursor_level": true, "stream_level": true }
    );
}

#[tokio::test]
async fn stream_suppresses_server_interruptions() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![doc! { "x": 1 }]));
    transport.script("getMore", command_failure(11601, "Interrupted"));

    let mut cursor = cursor(&topology, CursorOptions::default());
    let items: Vec<_> = cursor.stream().collect().await;
    // The interruption is the kill/getMore race; the stream just ends.
    assert_eq!(items.len(), 1);
    assert!(items[0].is_ok());
    assert!(cursor.is_closed());
}

#[tokio::test]
async fn stream_ends_silently_on_shutdown() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script_error("getMore", ErrorKind::Shutdown.into());

    let mut cursor = cursor(&topology, CursorOptions::default());
    let items: Vec<_> = cursor.stream().collect().await;
    assert!(items.is_empty());
    assert!(cursor.is_closed());
}

#[tokio::test]
async fn stream_propagates_other_errors() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script("getMore", command_failure(2, "BadValue"));

    let mut cursor = cursor(&topology, CursorOptions::default());
    let items: Vec<_> = cursor.stream().collect().await;
    assert_eq!(items.len(), 1);
    let error = items[0].as_ref().unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Command(ref c) if c.code == 2));
}

#[tokio::test]
async fn get_more_error_tears_the_cursor_down() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script_error("getMore", network_error());

    let mut cursor = cursor(&topology, CursorOptions::default());
    let error = cursor.next().await.unwrap_err();
    assert!(error.is_network_error());
    assert!(cursor.is_closed());

    // The dead server cursor still gets a best-effort kill.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.commands_named("killCursors").len(), 1);
}

#[tokio::test]
async fn load_balanced_network_errors_skip_kill_cursors() {
    let topology = MockTopology::load_balanced();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script_error("getMore", network_error());

    let mut cursor = cursor(&topology, CursorOptions::default());
    let error = cursor.next().await.unwrap_err();
    assert!(error.is_network_error());
    assert!(cursor.is_closed());

    // The pinned connection is suspect; no kill may travel through it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.commands_named("killCursors").len(), 0);
}

#[tokio::test]
async fn get_more_batch_size_defaults_when_unset() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script("getMore", get_more_reply(0, vec![]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert_eq!(cursor.next().await.unwrap(), None);

    let get_more = &transport.commands_named("getMore")[0];
    assert_eq!(get_more.body.get_i64("batchSize"), Ok(1000));
}

#[tokio::test]
async fn get_more_batch_size_honors_the_option() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script("getMore", get_more_reply(0, vec![]));

    let options = CursorOptions::builder().batch_size(5_u32).build();
    let mut cursor = cursor(&topology, options);
    assert_eq!(cursor.next().await.unwrap(), None);

    let get_more = &transport.commands_named("getMore")[0];
    assert_eq!(get_more.body.get_i64("batchSize"), Ok(5));
}

#[tokio::test]
async fn implicit_session_spans_the_cursor_lifetime() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script("getMore", get_more_reply(0, vec![]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert_eq!(cursor.next().await.unwrap(), None);

    let commands = transport.commands();
    let lsids: Vec<_> = commands
        .iter()
        .filter(|c| c.name != "killCursors")
        .map(|c| c.body.get_document("lsid").unwrap().clone())
        .collect();
    assert_eq!(lsids.len(), 2);
    assert_eq!(lsids[0], lsids[1]);
}

#[tokio::test]
async fn sessions_are_skipped_when_unsupported() {
    let topology = MockTopology::new();
    topology.set_session_support(false);
    let transport = topology.transport().clone();
    transport.script("find", find_reply(0, vec![]));

    let mut cursor = cursor(&topology, CursorOptions::default());
    assert_eq!(cursor.next().await.unwrap(), None);

    let find = &transport.commands_named("find")[0];
    assert!(!find.body.contains_key("lsid"));
}

#[tokio::test]
async fn get_more_comment_requires_a_recent_server() {
    for (wire_version, expect_comment) in [(8, false), (13, true)] {
        let topology = MockTopology::with_wire_version(wire_version);
        let transport = topology.transport().clone();
        transport.script("find", find_reply(7, vec![]));
        transport.script("getMore", get_more_reply(0, vec![]));

        let options = CursorOptions::builder().comment(bson::Bson::String("audit".into())).build();
        let mut cursor = cursor(&topology, options);
        assert_eq!(cursor.next().await.unwrap(), None);

        let get_more = &transport.commands_named("getMore")[0];
        assert_eq!(get_more.body.contains_key("comment"), expect_comment);
    }
}

#[tokio::test]
async fn await_data_cursors_bound_get_more_waits() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("find", find_reply(7, vec![]));
    transport.script("getMore", get_more_reply(7, vec![doc! { "x": 1 }]));

    let options = CursorOptions::builder()
        .flags(CursorFlags::TAILABLE | CursorFlags::AWAIT_DATA)
        .max_await_time(Duration::from_millis(250))
        .build();
    let mut cursor = cursor(&topology, options);
    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 1 }));

    let get_more = &transport.commands_named("getMore")[0];
    assert_eq!(get_more.body.get_i64("maxTimeMS"), Ok(250));
}

#[tokio::test]
async fn for_each_stops_when_asked() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script(
        "find",
        find_reply(0, vec![doc! { "x": 1 }, doc! { "x": 2 }, doc! { "x": 3 }]),
    );

    let mut cursor = cursor(&topology, CursorOptions::default());
    let mut seen = Vec::new();
    cursor
        .for_each(|doc| {
            seen.push(doc);
            seen.len() < 2
        })
        .await
        .unwrap();
    assert_eq!(seen.len(), 2);
}
