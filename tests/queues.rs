use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::Instant;

use stableflow::envelope::{TickEnvelope, TickStamp};
use stableflow::queues::framing::{read_frame, ACK};
use stableflow::queues::{far_deadline, EdgeQueue, LinkClient, LinkServer, Reconnect};

fn numbered(idx: u64) -> TickEnvelope {
    let mut env = TickEnvelope::new();
    env.emit(json!(idx));
    env.ts = Some(TickStamp::at(idx, 0.0));
    env
}

fn value_of(env: &TickEnvelope) -> u64 {
    env.list[0].as_u64().expect("numbered payload")
}

#[tokio::test]
async fn link_preserves_per_edge_fifo() {
    let server = LinkServer::bind("127.0.0.1:0", 8).await.unwrap();
    let endpoint = server.local_addr().to_string();
    let client = Arc::new(LinkClient::new(endpoint, 8, Reconnect::Never));

    let producer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            for idx in 0..50u64 {
                client.push(numbered(idx), far_deadline()).await.unwrap();
            }
        })
    };

    let mut observed = Vec::new();
    while observed.len() < 50 {
        let deadline = Instant::now() + Duration::from_secs(5);
        match server.pop_deadline(deadline).await.unwrap() {
            Some(env) => observed.push(value_of(&env)),
            None => panic!("consumer starved at {} envelopes", observed.len()),
        }
    }
    producer.await.unwrap();
    let expected: Vec<u64> = (0..50).collect();
    assert_eq!(observed, expected);
}

#[tokio::test]
async fn consumer_sees_closed_only_after_draining() {
    let server = LinkServer::bind("127.0.0.1:0", 8).await.unwrap();
    let endpoint = server.local_addr().to_string();
    let client = Arc::new(LinkClient::new(endpoint, 8, Reconnect::Never));

    for idx in 0..3u64 {
        client.push(numbered(idx), far_deadline()).await.unwrap();
    }
    // Drain needs the consumer's credits flowing back.
    let drainer = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.drain(Instant::now() + Duration::from_secs(5)).await })
    };
    let mut observed = Vec::new();
    loop {
        let deadline = Instant::now() + Duration::from_secs(5);
        match server.pop_deadline(deadline).await {
            Ok(Some(env)) => observed.push(value_of(&env)),
            Ok(None) => panic!("consumer starved"),
            Err(err) => {
                assert_eq!(err, stableflow::queues::QueueError::Closed);
                break;
            }
        }
    }
    drainer.await.unwrap().unwrap();
    assert_eq!(observed, vec![0, 1, 2]);
}

/// Inter-host reconnect: the transport is torn down after ten envelopes; the
/// client redials within its backoff budget and the remaining ten arrive in
/// order, with nothing acknowledged before the teardown delivered twice.
#[tokio::test]
async fn client_reconnects_and_resends_only_unacked() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let client = Arc::new(LinkClient::new(endpoint, 4, Reconnect::backoff_default()));

    let consumer = tokio::spawn(async move {
        let mut received = Vec::new();
        // First session: consume and acknowledge ten envelopes, then drop
        // the connection without a close marker.
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        for _ in 0..10 {
            let frame = read_frame(&mut reader).await.unwrap().unwrap();
            received.push(value_of(&TickEnvelope::from_wire(&frame).unwrap()));
            writer.write_u8(ACK).await.unwrap();
            writer.flush().await.unwrap();
        }
        drop(reader);
        drop(writer);

        // Second session: the client redialed; consume until the close
        // marker.
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    received.push(value_of(&TickEnvelope::from_wire(&frame).unwrap()));
                    writer.write_u8(ACK).await.unwrap();
                    writer.flush().await.unwrap();
                }
                Ok(None) | Err(_) => break,
            }
        }
        received
    });

    for idx in 0..20u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        client.push(numbered(idx), deadline).await.unwrap();
    }
    client
        .drain(Instant::now() + Duration::from_secs(10))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(15), consumer)
        .await
        .expect("consumer finished")
        .unwrap();
    let expected: Vec<u64> = (0..20).collect();
    assert_eq!(received, expected);
}
