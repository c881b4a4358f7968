//! Loopback client/server round-trip and shutdown behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use netsys_core::client::MessagingClient;
use netsys_core::server::MessagingServer;

async fn echo_server() -> (Arc<MessagingServer>, u16) {
    let server = MessagingServer::new("echo-server");
    server.set_receive_callback(|session, data| {
        session.send_packet(data.to_vec());
    });
    server.start_server(0).await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port)
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn assert_round_trips(payload: Vec<u8>) {
    let (server, port) = echo_server().await;

    let client = MessagingClient::new("round-trip");
    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    client.set_receive_callback(move |data| {
        received2.lock().extend_from_slice(data);
    });

    client.start_client("127.0.0.1", port).await.unwrap();
    client.send_packet(payload.clone()).await.unwrap();

    let expected_len = payload.len();
    let received3 = received.clone();
    assert!(
        wait_for(
            move || received3.lock().len() >= expected_len,
            Duration::from_secs(5)
        )
        .await,
        "payload of {expected_len} bytes did not round-trip"
    );
    assert_eq!(*received.lock(), payload);

    client.stop_client().await.unwrap();
    server.stop_server().await.unwrap();
}

#[tokio::test]
async fn single_byte_round_trips() {
    assert_round_trips(vec![0x42]).await;
}

#[tokio::test]
async fn sixty_four_kib_round_trips() {
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    assert_round_trips(payload).await;
}

#[tokio::test]
async fn all_byte_values_round_trip() {
    let payload: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    assert_round_trips(payload).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_each_see_their_own_echo_once() {
    const CLIENTS: usize = 8;
    let (server, port) = echo_server().await;

    let mut handles = Vec::new();
    for index in 0..CLIENTS {
        handles.push(tokio::spawn(async move {
            let client = MessagingClient::new(format!("client-{index}"));
            let payload = format!("payload from client {index}").into_bytes();
            let received = Arc::new(Mutex::new(Vec::new()));

            let received2 = received.clone();
            client.set_receive_callback(move |data| {
                received2.lock().extend_from_slice(data);
            });

            client.start_client("127.0.0.1", port).await.unwrap();
            client.send_packet(payload.clone()).await.unwrap();

            let expected_len = payload.len();
            let received3 = received.clone();
            assert!(
                wait_for(
                    move || received3.lock().len() >= expected_len,
                    Duration::from_secs(5)
                )
                .await
            );
            assert_eq!(*received.lock(), payload);

            client.stop_client().await.unwrap();
            payload
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    server.stop_server().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopping_the_server_disconnects_every_client_once() {
    const CLIENTS: usize = 5;
    let (server, port) = echo_server().await;

    let mut clients = Vec::new();
    let disconnect_counts: Vec<Arc<AtomicUsize>> =
        (0..CLIENTS).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    for (index, count) in disconnect_counts.iter().enumerate() {
        let client = MessagingClient::new(format!("k-client-{index}"));
        let count = count.clone();
        client.set_disconnected_callback(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        client.start_client("127.0.0.1", port).await.unwrap();
        clients.push(client);
    }

    assert!(
        wait_for(|| server.session_count() == CLIENTS, Duration::from_secs(5)).await,
        "server did not register all sessions"
    );

    tokio::time::timeout(Duration::from_secs(5), server.stop_server())
        .await
        .expect("server stop should terminate in bounded time")
        .unwrap();
    assert_eq!(server.session_count(), 0);

    for count in &disconnect_counts {
        let count = count.clone();
        assert!(
            wait_for(
                move || count.load(Ordering::SeqCst) == 1,
                Duration::from_secs(5)
            )
            .await,
            "client did not observe exactly one disconnect"
        );
    }

    for client in &clients {
        assert!(wait_for(|| !client.is_running(), Duration::from_secs(5)).await);
    }
}
