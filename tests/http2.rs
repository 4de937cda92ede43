use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tokio::net::TcpListener;

use tether::{ConnectionPool, StreamId};

/// A plaintext HTTP/2 server built on the same codec the client drives.
async fn h2_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let accepts = Arc::new(AtomicUsize::new(0));

    let accept_count = accepts.clone();
    tokio::spawn(async move {
        loop {
            let socket = match listener.accept().await {
                Ok((socket, _)) => socket,
                Err(_) => return,
            };
            accept_count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut conn = h2::server::handshake(socket).await.expect("h2 handshake");
                while let Some(request) = conn.accept().await {
                    let (request, mut respond) = request.expect("h2 accept");
                    tokio::spawn(async move {
                        let path = request.uri().path().to_owned();
                        let response = http::Response::builder()
                            .status(200)
                            .body(())
                            .expect("response");
                        let mut send = respond.send_response(response, false).expect("send");
                        send.send_data(Bytes::from(format!("hello {path}")), true)
                            .expect("data");
                    });
                }
            });
        }
    });

    (addr, accepts)
}

fn h2_pool() -> ConnectionPool {
    // HTTP/2 over plaintext needs prior knowledge: h2 on, h1 off.
    ConnectionPool::builder()
        .max_connections(1)
        .http1(false)
        .http2(true)
        .build()
}

#[tokio::test]
async fn prior_knowledge_roundtrip() {
    let (addr, accepts) = h2_server().await;
    let pool = h2_pool();

    let mut response = pool
        .request("GET", format!("http://{addr}/one"))
        .stream()
        .await
        .expect("request");
    assert_eq!(response.status, 200);
    assert_eq!(&response.read().await.expect("body")[..], b"hello /one");
    assert_eq!(
        &response.extensions.get::<tether::HttpVersion>().unwrap().0[..],
        b"HTTP/2"
    );
    assert!(response.extensions.get::<StreamId>().is_some());
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    let info = pool.connection_info();
    assert!(info[0].contains("HTTP/2"), "{info:?}");
}

#[tokio::test]
async fn concurrent_requests_multiplex_on_one_connection() {
    let (addr, accepts) = h2_server().await;
    let pool = h2_pool();

    let first = pool.request("GET", format!("http://{addr}/a")).send();
    let second = pool.request("GET", format!("http://{addr}/b")).send();
    let (first, second) = tokio::join!(first, second);

    let first = first.expect("first");
    let second = second.expect("second");
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);

    let first_id = first.extensions.get::<StreamId>().expect("stream id").0;
    let second_id = second.extensions.get::<StreamId>().expect("stream id").0;
    assert_ne!(first_id, second_id);
    assert_eq!(first_id % 2, 1, "client streams are odd-numbered");
    assert_eq!(second_id % 2, 1);

    // One connection multiplexed both; the pool never queued.
    assert_eq!(accepts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_requests_reuse_the_stream_space() {
    let (addr, accepts) = h2_server().await;
    let pool = h2_pool();

    for n in 0..3 {
        let response = pool
            .request("GET", format!("http://{addr}/seq{n}"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status, 200);
    }
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    let info = pool.connection_info();
    assert!(info[0].contains("Request Count: 3"), "{info:?}");
    assert!(info[0].contains("IDLE"), "{info:?}");
}
