use super::http::parse_announce_body;
use super::*;
use crate::bencode::{encode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

#[test]
fn test_compact_peer_parsing() {
    let data = [192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2];
    let peers = parse_compact_peers(&data);
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0], "192.168.1.1:6881".parse().unwrap());
    assert_eq!(peers[1], "10.0.0.2:6882".parse().unwrap());

    // Trailing partial entries are ignored.
    assert_eq!(parse_compact_peers(&data[..10]).len(), 1);
}

#[test]
fn test_compact_peer6_parsing() {
    let mut data = vec![0u8; 18];
    data[15] = 1; // ::1
    data[16] = 0x1A;
    data[17] = 0xE1;
    let peers = parse_compact_peers6(&data);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0], "[::1]:6881".parse().unwrap());
}

#[test]
fn test_announce_body_compact() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"interval"), Value::Int(1800));
    dict.insert(Bytes::from_static(b"min interval"), Value::Int(60));
    dict.insert(Bytes::from_static(b"complete"), Value::Int(5));
    dict.insert(Bytes::from_static(b"incomplete"), Value::Int(10));
    dict.insert(
        Bytes::from_static(b"peers"),
        Value::Bytes(Bytes::from_static(&[127, 0, 0, 1, 0x1A, 0xE1])),
    );
    let body = encode(&Value::Dict(dict));

    let response = parse_announce_body(&body).unwrap();
    assert_eq!(response.interval, 1800);
    assert_eq!(response.min_interval, Some(60));
    assert_eq!(response.complete, Some(5));
    assert_eq!(response.incomplete, Some(10));
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
}

#[test]
fn test_announce_body_failure_reason() {
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"failure reason"),
        Value::str("torrent not registered"),
    );
    let body = encode(&Value::Dict(dict));

    match parse_announce_body(&body) {
        Err(TrackerError::Failure(reason)) => assert_eq!(reason, "torrent not registered"),
        other => panic!("expected failure, got {:?}", other.is_ok()),
    }
}

#[test]
fn test_announce_body_dictionary_peers() {
    let mut peer = BTreeMap::new();
    peer.insert(Bytes::from_static(b"ip"), Value::str("10.1.2.3"));
    peer.insert(Bytes::from_static(b"port"), Value::Int(6999));

    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"interval"), Value::Int(900));
    dict.insert(
        Bytes::from_static(b"peers"),
        Value::List(vec![Value::Dict(peer)]),
    );
    let body = encode(&Value::Dict(dict));

    let response = parse_announce_body(&body).unwrap();
    assert_eq!(response.peers, vec!["10.1.2.3:6999".parse().unwrap()]);
}

#[test]
fn test_event_wire_values() {
    assert_eq!(TrackerEvent::Started.as_query(), "started");
    assert_eq!(TrackerEvent::None.as_query(), "");
    assert_eq!(TrackerEvent::None.as_udp(), 0);
    assert_eq!(TrackerEvent::Completed.as_udp(), 1);
    assert_eq!(TrackerEvent::Started.as_udp(), 2);
    assert_eq!(TrackerEvent::Stopped.as_udp(), 3);
}

#[tokio::test]
async fn test_udp_tracker_against_scripted_server() {
    use tokio::net::UdpSocket;

    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];

        // Connect exchange.
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[..8], 0x41727101980u64.to_be_bytes().as_slice());
        let tid = &buf[12..16].to_vec();
        let mut reply = Vec::new();
        reply.extend_from_slice(&0u32.to_be_bytes());
        reply.extend_from_slice(tid);
        reply.extend_from_slice(&0xDEADBEEFu64.to_be_bytes());
        server.send_to(&reply, from).await.unwrap();

        // Announce exchange.
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 98);
        assert_eq!(&buf[..8], 0xDEADBEEFu64.to_be_bytes().as_slice());
        let tid = buf[12..16].to_vec();
        let mut reply = Vec::new();
        reply.extend_from_slice(&1u32.to_be_bytes());
        reply.extend_from_slice(&tid);
        reply.extend_from_slice(&1800u32.to_be_bytes()); // interval
        reply.extend_from_slice(&3u32.to_be_bytes()); // leechers
        reply.extend_from_slice(&7u32.to_be_bytes()); // seeders
        reply.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        server.send_to(&reply, from).await.unwrap();
    });

    let url = format!("udp://{}", server_addr);
    let mut tracker = UdpTracker::connect(&url).await.unwrap();
    let response = tracker
        .announce(
            &[1u8; 20],
            &[2u8; 20],
            6881,
            AnnounceStats {
                uploaded: 0,
                downloaded: 0,
                left: 1000,
            },
            TrackerEvent::Started,
        )
        .await
        .unwrap();

    assert_eq!(response.interval, 1800);
    assert_eq!(response.complete, Some(7));
    assert_eq!(response.incomplete, Some(3));
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

    server_task.await.unwrap();
}
