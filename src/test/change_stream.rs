use std::sync::{Arc, Mutex};

use bson::{doc, Bson, Document, Timestamp};
use futures_util::StreamExt;
use pretty_assertions::assert_eq;

use crate::{
    change_stream::{event::OperationType, ChangeStreamTarget},
    error::{Error, ErrorKind},
    event::{EventHandler, StreamEvent},
    namespace::Namespace,
    operation::Command,
    options::ChangeStreamOptions,
    test::mock::MockTopology,
    ChangeStream,
};

fn target() -> ChangeStreamTarget {
    ChangeStreamTarget::Collection(Namespace::new("db", "c"))
}

fn token_doc(value: i32) -> Document {
    doc! { "_data": value }
}

fn insert_event(token: i32) -> Document {
    doc! {
        "_id": token_doc(token),
        "operationType": "insert",
        "ns": { "db": "db", "coll": "c" },
        "documentKey": { "_id": 1 },
        "fullDocument": { "x": 1 },
    }
}

fn update_event(token: i32) -> Document {
    doc! {
        "_id": token_doc(token),
        "operationType": "update",
        "ns": { "db": "db", "coll": "c" },
        "documentKey": { "_id": 5 },
        "updateDescription": { "updatedFields": { "a": 2 }, "removedFields": [] },
    }
}

fn aggregate_reply(cursor_id: i64, first_batch: Vec<Document>) -> Document {
    doc! {
        "ok": 1,
        "cursor": { "id": cursor_id, "ns": "db.c", "firstBatch": first_batch },
        "operationTime": Timestamp { time: 100, increment: 1 },
    }
}

fn get_more_reply(cursor_id: i64, batch: Vec<Document>) -> Document {
    doc! {
        "ok": 1,
        "cursor": { "id": cursor_id, "ns": "db.c", "nextBatch": batch },
    }
}

fn get_more_reply_with_token(cursor_id: i64, batch: Vec<Document>, token: Document) -> Document {
    doc! {
        "ok": 1,
        "cursor": {
            "id": cursor_id,
            "ns": "db.c",
            "nextBatch": batch,
            "postBatchResumeToken": token,
        },
    }
}

fn command_failure(code: i32, code_name: &str) -> Document {
    doc! { "ok": 0, "code": code, "codeName": code_name, "errmsg": "scripted failure" }
}

fn network_error() -> Error {
    ErrorKind::from(std::io::ErrorKind::ConnectionReset).into()
}

fn change_stream_stage(command: &Command) -> Document {
    command
        .body
        .get_array("pipeline")
        .unwrap()
        .first()
        .and_then(Bson::as_document)
        .unwrap()
        .get_document("$changeStream")
        .unwrap()
        .clone()
}

fn anchors(stage: &Document) -> (bool, bool, bool) {
    (
        stage.contains_key("resumeAfter"),
        stage.contains_key("startAfter"),
        stage.contains_key("startAtOperationTime"),
    )
}

fn collector() -> (EventHandler<StreamEvent>, Arc<Mutex<Vec<StreamEvent>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    (
        EventHandler::callback(move |event| sink.lock().unwrap().push(event)),
        collected,
    )
}

fn event_names(events: &[StreamEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match event {
            StreamEvent::Init(_) => "init",
            StreamEvent::More(_) => "more",
            StreamEvent::Response(_) => "response",
            StreamEvent::Change(_) => "change",
            StreamEvent::ResumeTokenChanged(_) => "resumeTokenChanged",
            StreamEvent::End => "end",
            StreamEvent::Close => "close",
            StreamEvent::Error(_) => "error",
        })
        .collect()
}

#[tokio::test]
async fn happy_path_delivers_change_and_caches_token() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script("getMore", get_more_reply(42, vec![insert_event(1)]));

    let (handler, events) = collector();
    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.on_event(handler);

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.operation_type, OperationType::Insert);
    assert_eq!(
        event.full_document,
        Some(doc! { "x": 1 }),
    );
    assert_eq!(
        stream.resume_token().unwrap().as_bson(),
        &Bson::Document(token_doc(1))
    );

    // The initial stage pins no starting position.
    let aggregates = transport.commands_named("aggregate");
    assert_eq!(aggregates.len(), 1);
    assert_eq!(anchors(&change_stream_stage(&aggregates[0])), (false, false, false));

    let events = events.lock().unwrap();
    let names = event_names(&events);
    assert!(names.contains(&"init"));
    let token_at = names.iter().position(|n| *n == "resumeTokenChanged").unwrap();
    let change_at = names.iter().position(|n| *n == "change").unwrap();
    assert!(token_at < change_at);
}

#[tokio::test]
async fn empty_batch_promotes_post_batch_token() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script(
        "getMore",
        get_more_reply_with_token(42, vec![], token_doc(7)),
    );

    let (handler, events) = collector();
    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.on_event(handler);

    assert!(stream.try_next().await.unwrap().is_none());
    assert_eq!(
        stream.resume_token().unwrap().as_bson(),
        &Bson::Document(token_doc(7))
    );

    let events = events.lock().unwrap();
    let names = event_names(&events);
    assert!(names.contains(&"resumeTokenChanged"));
    assert!(!names.contains(&"change"));
}

#[tokio::test]
async fn post_batch_token_supersedes_document_token_on_drained_batch() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script(
        "getMore",
        get_more_reply_with_token(42, vec![insert_event(1)], token_doc(2)),
    );

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.next().await.unwrap().unwrap();

    // The consumed document emptied the batch, so the post-batch token is
    // the newest acknowledged position.
    assert_eq!(
        stream.resume_token().unwrap().as_bson(),
        &Bson::Document(token_doc(2))
    );
}

#[tokio::test]
async fn network_error_resumes_with_resume_after() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script("getMore", get_more_reply(42, vec![insert_event(1)]));
    transport.script_error("getMore", network_error());
    transport.script("aggregate", aggregate_reply(43, vec![update_event(2)]));

    let (handler, events) = collector();
    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.on_event(handler);

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.operation_type, OperationType::Insert);

    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.operation_type, OperationType::Update);
    assert_eq!(
        second.update_description.as_ref().unwrap().updated_fields,
        doc! { "a": 2 }
    );
    assert_eq!(
        stream.resume_token().unwrap().as_bson(),
        &Bson::Document(token_doc(2))
    );

    // The reconstruction resumed after the delivered event, with exactly
    // one anchor.
    let aggregates = transport.commands_named("aggregate");
    assert_eq!(aggregates.len(), 2);
    let stage = change_stream_stage(&aggregates[1]);
    assert_eq!(anchors(&stage), (true, false, false));
    assert_eq!(stage.get_document("resumeAfter").unwrap(), &token_doc(1));

    // The failure stayed internal.
    let events = events.lock().unwrap();
    assert!(!event_names(&events).contains(&"error"));
}

#[tokio::test]
async fn emitter_mode_resumes_transparently() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![insert_event(1)]));
    transport.script_error("getMore", network_error());
    transport.script("aggregate", aggregate_reply(43, vec![insert_event(2)]));

    let (handler, events) = collector();
    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.on_event(handler);

    let mut items = stream.stream().unwrap();
    let first = items.next().await.unwrap().unwrap();
    let second = items.next().await.unwrap().unwrap();
    assert_eq!(
        (first.operation_type, second.operation_type),
        (OperationType::Insert, OperationType::Insert)
    );

    assert_eq!(transport.commands_named("aggregate").len(), 2);
    let events = events.lock().unwrap();
    assert!(!event_names(&events).contains(&"error"));
}

#[tokio::test]
async fn non_resumable_server_error_surfaces_and_closes() {
    let topology = MockTopology::with_wire_version(8);
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script("getMore", command_failure(18, "AuthenticationFailed"));

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();

    let error = stream.next().await.unwrap_err();
    match *error.kind {
        ErrorKind::Command(ref failure) => assert_eq!(failure.code, 18),
        ref other => panic!("expected command error, got {:?}", other),
    }
    assert!(stream.is_closed());
    assert_eq!(transport.commands_named("aggregate").len(), 1);

    // Terminal means terminal: further iteration reports the closed stream.
    let error = stream.next().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ChangeStreamClosed));
}

#[tokio::test]
async fn change_without_id_is_fatal() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script(
        "getMore",
        get_more_reply(42, vec![doc! { "operationType": "insert" }]),
    );

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();

    let error = stream.next().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::MissingResumeToken));
    assert!(stream.is_closed());
}

#[tokio::test]
async fn iterator_then_stream_is_a_mode_conflict() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script("getMore", get_more_reply(42, vec![]));

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    assert!(stream.try_next().await.unwrap().is_none());

    let error = stream.stream().unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ModeConflict { .. }));
}

#[tokio::test]
async fn stream_then_iterator_is_a_mode_conflict() {
    let topology = MockTopology::new();
    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();

    {
        let _events = stream.stream().unwrap();
    }
    let error = stream.next().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ModeConflict { .. }));
}

#[tokio::test]
async fn start_after_is_kept_until_the_first_delivery() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script_error("getMore", network_error());
    transport.script("aggregate", aggregate_reply(43, vec![insert_event(9)]));

    let options = ChangeStreamOptions::builder()
        .start_after(crate::change_stream::event::ResumeToken::from_bson(
            Bson::Document(token_doc(5)),
        ))
        .build();
    let mut stream = ChangeStream::new(
        topology.clone(),
        target(),
        vec![],
        Some(options),
    )
    .unwrap();

    stream.next().await.unwrap().unwrap();

    let aggregates = transport.commands_named("aggregate");
    assert_eq!(aggregates.len(), 2);
    // Nothing was delivered before the failure, so the original startAfter
    // semantics survive the reconstruction.
    let stage = change_stream_stage(&aggregates[1]);
    assert_eq!(anchors(&stage), (false, true, false));
    assert_eq!(stage.get_document("startAfter").unwrap(), &token_doc(5));
}

#[tokio::test]
async fn resume_falls_back_to_operation_time() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script_error("getMore", network_error());
    transport.script("aggregate", aggregate_reply(43, vec![insert_event(1)]));

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.next().await.unwrap().unwrap();

    // No token was ever cached, so the initial response's operationTime is
    // the restart anchor.
    let aggregates = transport.commands_named("aggregate");
    let stage = change_stream_stage(&aggregates[1]);
    assert_eq!(anchors(&stage), (false, false, true));
    assert_eq!(
        stage.get("startAtOperationTime"),
        Some(&Bson::Timestamp(Timestamp {
            time: 100,
            increment: 1
        }))
    );
}

#[tokio::test]
async fn operation_time_is_not_sent_to_servers_that_predate_it() {
    let topology = MockTopology::with_wire_version(6);
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script_error("getMore", network_error());
    transport.script("aggregate", aggregate_reply(43, vec![insert_event(1)]));

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.next().await.unwrap().unwrap();

    let aggregates = transport.commands_named("aggregate");
    let stage = change_stream_stage(&aggregates[1]);
    assert_eq!(anchors(&stage), (false, false, false));
}

#[tokio::test]
async fn cluster_scope_watches_all_changes() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script("getMore", get_more_reply(42, vec![]));

    let mut stream = ChangeStream::new(
        topology.clone(),
        ChangeStreamTarget::Cluster,
        vec![],
        None,
    )
    .unwrap();
    assert!(stream.try_next().await.unwrap().is_none());

    let aggregate = &transport.commands_named("aggregate")[0];
    assert_eq!(aggregate.target_db, "admin");
    assert_eq!(aggregate.body.get("aggregate"), Some(&Bson::Int32(1)));
    let stage = change_stream_stage(aggregate);
    assert_eq!(stage.get_bool("allChangesForCluster"), Ok(true));
}

#[tokio::test]
async fn user_pipeline_stages_follow_the_change_stream_stage() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script("getMore", get_more_reply(42, vec![]));

    let pipeline = vec![doc! { "$match": { "operationType": "insert" } }];
    let mut stream = ChangeStream::new(
        topology.clone(),
        target(),
        pipeline.clone(),
        None,
    )
    .unwrap();
    assert!(stream.try_next().await.unwrap().is_none());

    let aggregate = &transport.commands_named("aggregate")[0];
    let sent: Vec<Document> = aggregate
        .body
        .get_array("pipeline")
        .unwrap()
        .iter()
        .map(|s| s.as_document().unwrap().clone())
        .collect();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].contains_key("$changeStream"));
    assert_eq!(sent[1], pipeline[0]);
}

#[tokio::test]
async fn stream_options_flow_into_both_commands() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script("getMore", get_more_reply(42, vec![]));

    let options = ChangeStreamOptions::builder()
        .batch_size(10_u32)
        .max_await_time(std::time::Duration::from_millis(300))
        .comment(Bson::String("audit".to_string()))
        .build();
    let mut stream = ChangeStream::new(
        topology.clone(),
        target(),
        vec![],
        Some(options),
    )
    .unwrap();
    assert!(stream.try_next().await.unwrap().is_none());

    let aggregate = &transport.commands_named("aggregate")[0];
    let cursor_opts = aggregate.body.get_document("cursor").unwrap();
    assert_eq!(cursor_opts.get_i64("batchSize"), Ok(10));
    assert_eq!(aggregate.body.get_str("comment"), Ok("audit"));
    // None of the non-wire options leak into the stage itself.
    let stage = change_stream_stage(aggregate);
    assert!(stage.is_empty());

    let get_more = &transport.commands_named("getMore")[0];
    assert_eq!(get_more.body.get_i64("batchSize"), Ok(10));
    assert_eq!(get_more.body.get_i64("maxTimeMS"), Ok(300));
    assert_eq!(get_more.body.get_str("comment"), Ok("audit"));
}

#[tokio::test]
async fn close_is_idempotent_and_emits_one_close_event() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![insert_event(1)]));

    let (handler, events) = collector();
    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.on_event(handler);

    stream.next().await.unwrap().unwrap();
    stream.close().await;
    stream.close().await;

    assert!(stream.is_closed());
    assert_eq!(transport.commands_named("killCursors").len(), 1);
    let events = events.lock().unwrap();
    let closes = event_names(&events)
        .iter()
        .filter(|n| **n == "close")
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn server_ending_the_stream_emits_end_then_close() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script(
        "getMore",
        doc! {
            "ok": 1,
            "cursor": { "id": 0_i64, "ns": "db.c", "nextBatch": [insert_event(3)] },
        },
    );

    let (handler, events) = collector();
    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();
    stream.on_event(handler);

    // The final batch still delivers before the stream ends.
    assert!(stream.next().await.unwrap().is_some());
    assert!(stream.next().await.unwrap().is_none());
    assert!(stream.is_closed());

    let events = events.lock().unwrap();
    let names = event_names(&events);
    let change_at = names.iter().rposition(|n| *n == "change").unwrap();
    let end_at = names.iter().position(|n| *n == "end").unwrap();
    let close_at = names.iter().position(|n| *n == "close").unwrap();
    assert!(change_at < end_at && end_at < close_at);
}

#[tokio::test(start_paused = true)]
async fn resume_gives_up_when_the_topology_stays_disconnected() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![]));
    transport.script_error("getMore", network_error());

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();

    topology.set_connected(false);
    let error = stream.next().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ServerSelection { .. }));
    assert!(stream.is_closed());
    // Only the original aggregation was ever issued.
    assert_eq!(transport.commands_named("aggregate").len(), 1);
}

#[tokio::test]
async fn consecutive_resumable_failures_resume_repeatedly() {
    let topology = MockTopology::new();
    let transport = topology.transport().clone();
    transport.script("aggregate", aggregate_reply(42, vec![insert_event(1)]));
    transport.script_error("getMore", network_error());
    transport.script("aggregate", aggregate_reply(43, vec![]));
    transport.script_error("getMore", network_error());
    transport.script("aggregate", aggregate_reply(44, vec![insert_event(2)]));

    let mut stream =
        ChangeStream::new(topology.clone(), target(), vec![], None).unwrap();

    stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(
        second.id.as_bson(),
        &Bson::Document(token_doc(2))
    );
    assert_eq!(transport.commands_named("aggregate").len(), 3);
}
