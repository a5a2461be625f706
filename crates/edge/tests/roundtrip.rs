//! Edge round-trip behavior: what goes in comes out unchanged.

use std::sync::Arc;

use chrono::Utc;
use strom_edge::{ChannelEdge, Edge};

use strom_core::{
    BatchPoint, BeginBatch, BufferedBatch, Dimensions, EdgeType, FieldValue, Message, Point, Tags,
};

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn stream_edge_roundtrips_a_point() {
    let edge = ChannelEdge::new(EdgeType::Stream, 1000);

    let point = Point::new(
        "cpu",
        "db",
        "rp",
        Utc::now(),
        [("v".to_string(), FieldValue::Int(42))].into(),
        tags(&[("t1", "v1"), ("t2", "v2")]),
        Dimensions::new(false, vec!["t1".into(), "t2".into()]),
    );

    edge.collect(Message::Point(point.clone())).await.unwrap();
    match edge.emit().await.unwrap() {
        Message::Point(got) => assert_eq!(got, point),
        other => panic!("unexpected {:?}", other.kind()),
    }
}

#[tokio::test]
async fn batch_edge_roundtrips_a_buffered_batch() {
    let edge = ChannelEdge::new(EdgeType::Batch, 1000);

    let t = Utc::now();
    let batch = BufferedBatch::new(
        BeginBatch::new("cpu", tags(&[("t1", "v1")]), false, t, 0),
        vec![
            BatchPoint::new(
                t,
                [("v".to_string(), FieldValue::Float(1.0))].into(),
                tags(&[("t1", "v1"), ("t2", "v2")]),
            ),
            BatchPoint::new(
                t,
                [("v".to_string(), FieldValue::Float(2.0))].into(),
                tags(&[("t1", "v1"), ("t2", "v3")]),
            ),
        ],
    );

    edge.collect(Message::BufferedBatch(batch.clone()))
        .await
        .unwrap();
    match edge.emit().await.unwrap() {
        Message::BufferedBatch(got) => {
            assert_eq!(got.len(), batch.len());
            assert_eq!(got, batch);
        }
        other => panic!("unexpected {:?}", other.kind()),
    }
}

#[tokio::test]
async fn close_loses_no_messages() {
    let edge = Arc::new(ChannelEdge::new(EdgeType::Stream, 100));

    let n = 50;
    for i in 0..n {
        let p = Point::new(
            "m",
            "",
            "",
            Utc::now(),
            [("i".to_string(), FieldValue::Int(i))].into(),
            Tags::new(),
            Dimensions::none(),
        );
        edge.collect(Message::Point(p)).await.unwrap();
    }
    edge.close().unwrap();

    let mut got = Vec::new();
    while let Some(Message::Point(p)) = edge.emit().await {
        got.push(p.field("i").unwrap().as_int().unwrap());
    }
    assert_eq!(got, (0..n).collect::<Vec<_>>());
}

#[tokio::test]
async fn concurrent_emitters_split_the_stream() {
    let edge = Arc::new(ChannelEdge::new(EdgeType::Stream, 100));

    let n = 40;
    for i in 0..n {
        let p = Point::new(
            "m",
            "",
            "",
            Utc::now(),
            [("i".to_string(), FieldValue::Int(i))].into(),
            Tags::new(),
            Dimensions::none(),
        );
        edge.collect(Message::Point(p)).await.unwrap();
    }
    edge.close().unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let edge = Arc::clone(&edge);
        handles.push(tokio::spawn(async move {
            let mut count = 0;
            while edge.emit().await.is_some() {
                count += 1;
            }
            count
        }));
    }
    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    assert_eq!(total, n, "every message is emitted exactly once");
}
