use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use redis_pool::{cmd, ConnectionAddr, ErrorKind, MaxConnections, Pool, PoolConfig, RetryConfig, Value};

mod support;
use support::{wait_for, MockServer};

const TICK: Duration = Duration::from_millis(200);
const LONG: Duration = Duration::from_secs(2);

fn quick_retry() -> RetryConfig {
    RetryConfig {
        timeout: Duration::from_secs(2),
        initial_delay: Duration::from_millis(10),
        factor: 2.0,
        max_attempts: 2,
    }
}

fn pool_for(server: &MockServer, max: MaxConnections) -> Pool {
    let config = PoolConfig::from_url(&server.url())
        .unwrap()
        .set_max_connections(max)
        .set_min_connections(0)
        .set_retry(quick_retry());
    Pool::new(config).unwrap()
}

#[tokio::test]
async fn send_leases_and_reuses_one_connection() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Strict(4));

    assert_eq!(
        pool.send(cmd("PING")).await.unwrap(),
        Value::SimpleString("PONG".to_string())
    );
    let mut echo = cmd("ECHO");
    echo.arg("hi");
    assert_eq!(pool.send(echo).await.unwrap(), Value::bulk("hi"));

    // the second send found the first connection idle again
    assert_eq!(server.accepted_connections(), 1);
}

#[tokio::test]
async fn lease_connection_pins_one_physical_connection() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Strict(4));

    let ids = pool
        .lease_connection(|conn| async move {
            let first = conn.send(&cmd("PING")).await?;
            let second = conn.send(&cmd("PING")).await?;
            assert_eq!(first, second);
            Ok(conn.id())
        })
        .await
        .unwrap();

    // the closure's connection went back exactly once and is reused
    let leased = pool.lease().await.unwrap();
    assert_eq!(leased.id(), ids);
    assert_eq!(server.accepted_connections(), 1);
}

#[tokio::test]
async fn strict_pool_queues_leases_and_serves_them_fifo() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Strict(2));

    let first = pool.lease().await.unwrap();
    let second = pool.lease().await.unwrap();
    let first_id = first.id();
    assert_eq!(server.accepted_connections(), 2);

    // at capacity: the third lease waits
    let waiter_pool = pool.clone();
    let third = tokio::spawn(async move { waiter_pool.lease().await });
    sleep(TICK).await;
    assert!(!third.is_finished());
    assert_eq!(server.accepted_connections(), 2);

    // returning one connection serves the waiter with that connection
    drop(first);
    let third = timeout(LONG, third).await.unwrap().unwrap().unwrap();
    assert_eq!(third.id(), first_id);
    assert_eq!(
        third.send(&cmd("PING")).await.unwrap(),
        Value::SimpleString("PONG".to_string())
    );
    assert_eq!(server.accepted_connections(), 2);
    drop(second);
}

#[tokio::test]
async fn leaky_pool_overflows_and_discards_surplus_idle() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Leaky(1));

    // leases never wait in leaky mode, even beyond the cap
    let first = timeout(LONG, pool.lease()).await.unwrap().unwrap();
    let second = timeout(LONG, pool.lease()).await.unwrap().unwrap();
    assert_eq!(server.accepted_connections(), 2);

    // only one idle connection is preserved; the surplus one closes
    drop(first);
    drop(second);
    assert!(wait_for(|| server.active_connections() == 1, LONG).await);
}

#[tokio::test]
async fn connections_rotate_over_all_targets() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let config = PoolConfig::new(vec![
        ConnectionAddr::Tcp("127.0.0.1".to_string(), server_a.addr.port()),
        ConnectionAddr::Tcp("127.0.0.1".to_string(), server_b.addr.port()),
    ])
    .set_min_connections(0)
    .set_retry(quick_retry());
    let pool = Pool::new(config).unwrap();

    let first = pool.lease().await.unwrap();
    let second = pool.lease().await.unwrap();
    assert_eq!(server_a.accepted_connections(), 1);
    assert_eq!(server_b.accepted_connections(), 1);
    drop(first);
    drop(second);
}

#[tokio::test]
async fn update_addresses_redirects_new_connections() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let pool = pool_for(&server_a, MaxConnections::Strict(4));

    let held = pool.lease().await.unwrap();
    assert_eq!(server_a.accepted_connections(), 1);

    pool.update_connection_addresses(vec![ConnectionAddr::Tcp(
        "127.0.0.1".to_string(),
        server_b.addr.port(),
    )]);
    let redirected = pool.lease().await.unwrap();
    assert_eq!(server_b.accepted_connections(), 1);
    drop(redirected);
    drop(held);
}

#[tokio::test]
async fn activate_maintains_minimum_idle_connections() {
    let server = MockServer::start().await;
    let config = PoolConfig::from_url(&server.url())
        .unwrap()
        .set_min_connections(2)
        .set_retry(quick_retry());
    let pool = Pool::new(config).unwrap();

    // nothing happens before activation
    sleep(TICK).await;
    assert_eq!(server.accepted_connections(), 0);

    pool.activate();
    assert!(wait_for(|| server.accepted_connections() == 2, LONG).await);
    // activate is idempotent
    pool.activate();
    sleep(TICK).await;
    assert_eq!(server.accepted_connections(), 2);
}

#[tokio::test]
async fn factory_runs_auth_and_select_before_handout() {
    let server = MockServer::start().await;
    let config = PoolConfig::from_url(&server.url())
        .unwrap()
        .set_password("sekrit")
        .set_database(2)
        .set_min_connections(0)
        .set_retry(quick_retry());
    let pool = Pool::new(config).unwrap();

    assert_eq!(
        pool.send(cmd("PING")).await.unwrap(),
        Value::SimpleString("PONG".to_string())
    );
    assert_eq!(
        server.seen_commands(),
        vec![b"AUTH".to_vec(), b"SELECT".to_vec(), b"PING".to_vec()]
    );
}

#[tokio::test]
async fn lease_fails_when_no_target_accepts() {
    // a bound-then-dropped listener gives a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = PoolConfig::new(vec![ConnectionAddr::Tcp(
        "127.0.0.1".to_string(),
        addr.port(),
    )])
    .set_min_connections(0)
    .set_retry(RetryConfig {
        timeout: Duration::from_millis(500),
        initial_delay: Duration::from_millis(10),
        factor: 2.0,
        max_attempts: 2,
    });
    let pool = Pool::new(config).unwrap();

    let err = pool.lease().await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::AcquireTimeout | ErrorKind::Io
    ));
}

#[tokio::test]
async fn empty_target_list_is_rejected() {
    let err = Pool::new(PoolConfig::new(vec![])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoConnectionTargets);
}

#[tokio::test]
async fn close_refuses_leases_and_waits_for_returns() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Strict(4));

    let held = pool.lease().await.unwrap();

    let closing_pool = pool.clone();
    let closing = tokio::spawn(async move { closing_pool.close().await });
    sleep(TICK).await;
    // close waits for the leased connection to come back
    assert!(!closing.is_finished());

    let err = pool.lease().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);

    drop(held);
    timeout(LONG, closing).await.unwrap().unwrap().unwrap();
    assert!(wait_for(|| server.active_connections() == 0, LONG).await);

    // closing again resolves immediately
    timeout(TICK, pool.close()).await.unwrap().unwrap();
}

#[tokio::test]
async fn unexpected_closure_purges_idle_and_fires_callback() {
    let server = MockServer::start().await;
    let closed_flag = Arc::new(AtomicBool::new(false));
    let flag = closed_flag.clone();
    let config = PoolConfig::from_url(&server.url())
        .unwrap()
        .set_min_connections(0)
        .set_retry(quick_retry())
        .set_on_unexpected_closure(move || flag.store(true, Ordering::SeqCst));
    let pool = Pool::new(config).unwrap();

    pool.send(cmd("PING")).await.unwrap();
    assert_eq!(server.accepted_connections(), 1);

    server.sever_connections();
    assert!(wait_for(|| closed_flag.load(Ordering::SeqCst), LONG).await);

    // the dead idle connection is not handed out again
    pool.send(cmd("PING")).await.unwrap();
    assert_eq!(server.accepted_connections(), 2);
}

#[tokio::test]
async fn pubsub_pins_a_connection_and_routes_messages() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Strict(4));

    let (messages, mut received) = tokio::sync::mpsc::unbounded_channel();
    let (unsubs, mut unsub_received) = tokio::sync::mpsc::unbounded_channel();
    let on_unsubscribe = {
        let unsubs = unsubs.clone();
        move |name: &str, count: usize| {
            let _ = unsubs.send((name.to_string(), count));
        }
    };
    pool.subscribe_with_handlers(
        &["news"],
        Arc::new(move |msg| {
            let _ = messages.send((
                msg.get_channel_name().to_string(),
                msg.get_payload_bytes().to_vec(),
            ));
        }),
        None,
        Some(Arc::new(on_unsubscribe)),
    )
    .await
    .unwrap();

    // the mock publishes one message right after the confirmation
    let (channel, payload) = timeout(LONG, received.recv()).await.unwrap().unwrap();
    assert_eq!(channel, "news");
    assert_eq!(payload, b"hello");

    // the pinned connection is reserved: a lease gets a different one, and
    // that one does not allow subscriptions
    let leased = pool.lease().await.unwrap();
    assert!(!leased.allow_subscriptions());
    assert_eq!(server.accepted_connections(), 2);
    let err = leased.send(cmd("SUBSCRIBE").arg("other")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubscriptionsDisabled);
    drop(leased);

    // dropping the last subscription unpins and returns the connection
    pool.unsubscribe(&["news"]).await.unwrap();
    let (name, remaining) = timeout(LONG, unsub_received.recv()).await.unwrap().unwrap();
    assert_eq!(name, "news");
    assert_eq!(remaining, 0);

    // the former pubsub connection is back in general rotation
    let reused = pool.lease().await.unwrap();
    assert!(!reused.allow_subscriptions());
    drop(reused);
    assert!(wait_for(|| server.accepted_connections() == 2, TICK).await);
}

#[tokio::test]
async fn subscriptions_share_the_pinned_connection() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Strict(4));

    pool.subscribe(&["a"], |_| {}).await.unwrap();
    pool.psubscribe(&["b.*"], |_| {}).await.unwrap();
    // channel and pattern subscriptions ride the same pinned connection
    assert_eq!(server.accepted_connections(), 1);

    // unsubscribing only the channel leaves the pattern pinned
    pool.unsubscribe(&["a"]).await.unwrap();
    let leased = pool.lease().await.unwrap();
    assert_eq!(server.accepted_connections(), 2);
    drop(leased);

    // empty list means all: this drops the remaining pattern and unpins
    pool.punsubscribe(&[]).await.unwrap();
    assert!(wait_for(
        || {
            let commands = server.seen_commands();
            commands.iter().any(|c| c == b"PUNSUBSCRIBE")
        },
        LONG
    )
    .await);
}

#[tokio::test]
async fn unsubscribe_without_subscriptions_is_a_noop() {
    let server = MockServer::start().await;
    let pool = pool_for(&server, MaxConnections::Strict(4));

    timeout(TICK, pool.unsubscribe(&["nothing"]))
        .await
        .unwrap()
        .unwrap();
    // no connection was created for it
    assert_eq!(server.accepted_connections(), 0);
}
