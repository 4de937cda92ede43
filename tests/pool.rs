mod support;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tether::{ConnectionPool, Timeouts};

const OK_HELLO: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

#[tokio::test]
async fn keepalive_reuses_one_connection() {
    let server = support::scripted(&[OK_HELLO, OK_HELLO]).await;
    let pool = ConnectionPool::builder().max_connections(1).build();

    for _ in 0..2 {
        let response = pool
            .request("GET", server.url("/"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status, 200);
    }

    assert_eq!(server.accepts(), 1, "both requests share one dial");
    let info = pool.connection_info();
    assert_eq!(info.len(), 1);
    assert!(
        info[0].starts_with(&format!("http://{}", server.addr())),
        "{info:?}"
    );
    assert!(info[0].contains("IDLE"), "{info:?}");
    assert!(info[0].contains("Request Count: 2"), "{info:?}");
}

#[tokio::test]
async fn saturated_pool_wakes_waiters_in_fifo_order() {
    let server = support::scripted(&[OK_HELLO, OK_HELLO, OK_HELLO]).await;
    let pool = ConnectionPool::builder().max_connections(1).build();
    let order = Arc::new(Mutex::new(Vec::new()));

    // A occupies the only slot with an unread body.
    let a = pool
        .request("GET", server.url("/a"))
        .stream()
        .await
        .expect("request a");

    let spawn_waiter = |name: &'static str| {
        let pool = pool.clone();
        let url = server.url("/");
        let order = order.clone();
        tokio::spawn(async move {
            let response = pool.request("GET", url).send().await.expect(name);
            assert_eq!(response.status, 200);
            order.lock().unwrap().push(name);
        })
    };

    let b = spawn_waiter("b");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let c = spawn_waiter("c");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(order.lock().unwrap().is_empty(), "b and c are queued");

    a.close();
    b.await.unwrap();
    c.await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["b", "c"]);
}

#[tokio::test]
async fn pool_timeout_while_saturated() {
    let server = support::scripted(&[OK_HELLO, OK_HELLO]).await;
    let pool = ConnectionPool::builder().max_connections(1).build();

    let open = pool
        .request("GET", server.url("/"))
        .stream()
        .await
        .expect("request");

    let err = pool
        .request("GET", server.url("/"))
        .timeouts(Timeouts {
            pool: Some(Duration::from_millis(100)),
            ..Default::default()
        })
        .send()
        .await
        .expect_err("pool is saturated");
    assert!(err.is_pool_timeout());

    open.close();
}

#[tokio::test]
async fn lru_idle_connection_is_evicted_at_capacity() {
    let first = support::scripted(&[OK_HELLO]).await;
    let second = support::scripted(&[OK_HELLO]).await;
    let pool = ConnectionPool::builder().max_connections(1).build();

    pool.request("GET", first.url("/"))
        .send()
        .await
        .expect("first origin");
    pool.request("GET", second.url("/"))
        .send()
        .await
        .expect("second origin");

    assert_eq!(first.accepts(), 1);
    assert_eq!(second.accepts(), 1);

    let info = pool.connection_info();
    assert_eq!(info.len(), 1, "pool stays at capacity: {info:?}");
    assert!(
        info[0].starts_with(&format!("http://{}", second.addr())),
        "{info:?}"
    );
}

#[tokio::test]
async fn keepalive_expiry_forces_redial() {
    let server = support::scripted(&[OK_HELLO, OK_HELLO]).await;
    let pool = ConnectionPool::builder()
        .max_connections(1)
        .keepalive_expiry(Duration::from_millis(50))
        .build();

    pool.request("GET", server.url("/"))
        .send()
        .await
        .expect("first");
    tokio::time::sleep(Duration::from_millis(120)).await;
    pool.request("GET", server.url("/"))
        .send()
        .await
        .expect("second");

    assert_eq!(server.accepts(), 2, "expired connection was not reused");
}

#[tokio::test]
async fn max_keepalive_cap_drops_oldest_idle() {
    let first = support::scripted(&[OK_HELLO]).await;
    let second = support::scripted(&[OK_HELLO]).await;
    let pool = ConnectionPool::builder()
        .max_connections(2)
        .max_keepalive_connections(1)
        .build();

    pool.request("GET", first.url("/"))
        .send()
        .await
        .expect("first origin");
    pool.request("GET", second.url("/"))
        .send()
        .await
        .expect("second origin");

    // The sweep runs on the next pool entry.
    let err = pool
        .request("GET", "http://127.0.0.1:1/")
        .timeouts(Timeouts {
            connect: Some(Duration::from_millis(200)),
            ..Default::default()
        })
        .send()
        .await
        .expect_err("nothing listens on port 1");
    assert!(err.is_connect() || err.is_connect_timeout());

    let info = pool.connection_info();
    assert!(
        info.iter().filter(|line| line.contains("IDLE")).count() <= 1,
        "{info:?}"
    );
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
    let pool = ConnectionPool::new();
    let err = pool
        .request("GET", "ftp://example.com/")
        .send()
        .await
        .expect_err("ftp is not transportable");
    assert!(err.is_unsupported_protocol());
}

#[tokio::test]
async fn closed_pool_refuses_requests() {
    let server = support::scripted(&[OK_HELLO]).await;
    let pool = ConnectionPool::new();

    pool.request("GET", server.url("/"))
        .send()
        .await
        .expect("request before close");

    pool.close();
    let err = pool
        .request("GET", server.url("/"))
        .send()
        .await
        .expect_err("pool is closed");
    assert!(err.is_closed());
    assert!(pool.connection_info().is_empty());
}

#[tokio::test]
async fn connect_refused_surfaces_connect_error() {
    let pool = ConnectionPool::new();
    let err = pool
        .request("GET", "http://127.0.0.1:1/")
        .timeouts(Timeouts {
            connect: Some(Duration::from_secs(2)),
            ..Default::default()
        })
        .send()
        .await
        .expect_err("nothing listens on port 1");
    assert!(err.is_connect() || err.is_connect_timeout(), "{err:?}");
}
