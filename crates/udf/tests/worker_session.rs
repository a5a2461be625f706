//! Full worker sessions over an in-process duplex pipe.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::io::DuplexStream;

use strom_core::{BatchPoint, BeginBatch, BufferedBatch, Dimensions, FieldValue, Message, Point};
use strom_udf::proto::{self, request, response};
use strom_udf::{FrameReader, Hooks, UdfConfig, UdfServer};

/// A worker that answers control RPCs and echoes data frames back.
async fn echo_worker(host_side: DuplexStream) {
    let (read, mut write) = tokio::io::split(host_side);
    let mut frames = FrameReader::new(read);
    while let Ok(Some(req)) = frames.read_frame::<proto::Request>().await {
        let reply = match req.msg {
            Some(request::Msg::Info(_)) => Some(response::Msg::Info(proto::InfoResponse {
                wants: proto::EdgeType::Stream as i32,
                provides: proto::EdgeType::Stream as i32,
                options: Default::default(),
            })),
            Some(request::Msg::Init(_)) => Some(response::Msg::Init(proto::InitResponse {
                success: true,
                error: String::new(),
            })),
            Some(request::Msg::Keepalive(k)) => {
                Some(response::Msg::Keepalive(proto::KeepaliveResponse { time: k.time }))
            }
            Some(request::Msg::Snapshot(_)) => {
                Some(response::Msg::Snapshot(proto::SnapshotResponse {
                    snapshot: vec![0x2a],
                }))
            }
            Some(request::Msg::Restore(r)) => {
                let success = r.snapshot == vec![0x2a];
                Some(response::Msg::Restore(proto::RestoreResponse {
                    success,
                    error: if success { String::new() } else { "bad blob".into() },
                }))
            }
            Some(request::Msg::Begin(b)) => Some(response::Msg::Begin(b)),
            Some(request::Msg::Point(p)) => Some(response::Msg::Point(p)),
            Some(request::Msg::End(e)) => Some(response::Msg::End(e)),
            None => None,
        };
        if let Some(msg) = reply {
            strom_udf::write_frame(&mut write, &proto::Response::of(msg))
                .await
                .unwrap();
        }
    }
}

fn start_server(config: UdfConfig, hooks: Hooks) -> (UdfServer, tokio::task::JoinHandle<()>) {
    let (host, worker) = tokio::io::duplex(4096);
    let worker_task = tokio::spawn(echo_worker(worker));
    let (read, write) = tokio::io::split(host);
    (UdfServer::start(config, read, write, hooks), worker_task)
}

#[tokio::test]
async fn init_then_point_echoes_back() {
    let (server, _worker) = start_server(UdfConfig::new("t", "n"), Hooks::none());
    let mut output = server.take_output().unwrap();

    server.init(&BTreeMap::new()).await.unwrap();

    let point = Point::new(
        "cpu",
        "db",
        "rp",
        Utc.timestamp_nanos(1_000_000_007),
        [("value".to_string(), FieldValue::Float(42.0))].into(),
        [("host".to_string(), "a".to_string())].into(),
        Dimensions::new(false, vec!["host".into()]),
    );
    server.send_point(&point).await.unwrap();

    match output.recv().await.unwrap() {
        Message::Point(got) => assert_eq!(got, point),
        other => panic!("unexpected {:?}", other.kind()),
    }

    server.close_input().await;
    assert!(output.recv().await.is_none(), "output closes after the worker exits");
}

#[tokio::test]
async fn info_reports_worker_shape() {
    let (server, _worker) = start_server(UdfConfig::new("t", "n"), Hooks::none());
    let info = server.info().await.unwrap();
    assert_eq!(info.wants, proto::EdgeType::Stream as i32);
    assert_eq!(info.provides, proto::EdgeType::Stream as i32);
}

#[tokio::test]
async fn snapshot_restore_cycle() {
    let (server, _worker) = start_server(UdfConfig::new("t", "n"), Hooks::none());
    server.init(&BTreeMap::new()).await.unwrap();

    let blob = server.snapshot().await.unwrap();
    assert_eq!(blob, vec![0x2a]);
    server.restore(blob).await.unwrap();

    // A second cycle behaves identically: no state leaks between them.
    let blob = server.snapshot().await.unwrap();
    assert_eq!(blob, vec![0x2a]);
    server.restore(blob).await.unwrap();
}

#[tokio::test]
async fn batch_reassembles_as_buffered_batch() {
    let (server, _worker) = start_server(UdfConfig::new("t", "n"), Hooks::none());
    let mut output = server.take_output().unwrap();
    server.init(&BTreeMap::new()).await.unwrap();

    let t = Utc.timestamp_nanos(1_433_116_800_000_000_000);
    let batch = BufferedBatch::new(
        BeginBatch::new("test", Default::default(), false, t, 1),
        vec![BatchPoint::new(
            t,
            [
                ("f1".to_string(), FieldValue::Float(1.0)),
                ("f2".to_string(), FieldValue::Float(2.0)),
                ("f3".to_string(), FieldValue::Int(1)),
                ("f4".to_string(), FieldValue::Str("str".into())),
            ]
            .into(),
            Default::default(),
        )],
    );
    server.send_batch(&batch).await.unwrap();

    match output.recv().await.unwrap() {
        Message::BufferedBatch(got) => {
            assert_eq!(got.begin.name, "test");
            assert_eq!(got.begin.tmax, t);
            assert_eq!(got.len(), 1);
            assert_eq!(got.points[0].fields, batch.points[0].fields);
        }
        other => panic!("unexpected {:?}", other.kind()),
    }
}

#[tokio::test]
async fn missed_keepalive_invokes_abort_and_no_data_escapes() {
    // A worker that reads everything and never answers.
    let (host, worker) = tokio::io::duplex(4096);
    let _mute = tokio::spawn(async move {
        let (read, _write) = tokio::io::split(worker);
        let mut frames = FrameReader::new(read);
        while let Ok(Some(_)) = frames.read_frame::<proto::Request>().await {}
    });

    let aborted = Arc::new(AtomicBool::new(false));
    let hooks = Hooks {
        on_abort: {
            let aborted = Arc::clone(&aborted);
            Box::new(move || aborted.store(true, Ordering::SeqCst))
        },
        on_kill: Box::new(|| {}),
        terminated: None,
    };

    let (read, write) = tokio::io::split(host);
    let server = UdfServer::start(
        UdfConfig::new("t", "n").with_keepalive(Duration::from_millis(100)),
        read,
        write,
        hooks,
    );
    let mut output = server.take_output().unwrap();

    tokio::time::timeout(Duration::from_millis(200), async {
        while !aborted.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("abort hook should fire within 2x keepalive");

    assert!(output.recv().await.is_none(), "no data escapes an aborted server");
    assert!(server.first_error().is_some());
}

#[tokio::test]
async fn worker_error_response_aborts_with_message() {
    let (host, worker) = tokio::io::duplex(4096);
    let _failing = tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(worker);
        let mut frames = FrameReader::new(read);
        // Whatever arrives, reply with an error.
        if let Ok(Some(_)) = frames.read_frame::<proto::Request>().await {
            strom_udf::write_frame(
                &mut write,
                &proto::Response::of(response::Msg::Error(proto::ErrorResponse {
                    error: "worker exploded".into(),
                })),
            )
            .await
            .unwrap();
        }
    });

    let (read, write) = tokio::io::split(host);
    let server = UdfServer::start(UdfConfig::new("t", "n"), read, write, Hooks::none());
    let err = server.init(&BTreeMap::new()).await.unwrap_err();
    assert!(err.to_string().contains("worker exploded"), "{err}");
}
