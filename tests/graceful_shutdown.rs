//! Shutdown ordering: drain connections first, then close the audit log.

use std::time::Duration;

use mitm_audit::correlation::CLIENT_DISCONNECTED;

mod common;
use common::{field, read_records, transaction_dirs};

#[tokio::test]
async fn in_flight_transaction_completes_and_is_recorded() {
    let storage = tempfile::tempdir().unwrap();
    let (origin, _seen) = common::start_origin(|_| async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        (200, "slow".to_string())
    })
    .await;
    let proxy = common::start_proxy(&common::test_config(storage.path())).await;
    let client = common::proxied_client(proxy.local_addr());

    let request = tokio::spawn({
        let client = client.clone();
        async move {
            let res = client
                .get(format!("http://{origin}/"))
                .header("X-Debug", "1")
                .header("X-Trace-ID", "draining")
                .send()
                .await
                .unwrap();
            (res.status(), res.text().await.unwrap())
        }
    });

    // Wait until the proxy holds the connection.
    tokio::time::timeout(Duration::from_secs(2), async {
        while proxy.active_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should reach the proxy");

    let handle = proxy.shutdown_handle();
    let stopping = tokio::spawn(proxy.stop());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.is_shutting_down());
    assert!(!stopping.is_finished(), "shutdown must wait for the in-flight request");

    let (status, body) = request.await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "slow");

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), stopping)
        .await
        .expect("shutdown should finish once drained")
        .unwrap()
        .unwrap();

    let records = read_records(storage.path());
    assert_eq!(records.len(), 2);
    assert_eq!(field(&records[1], "Type"), Some("response"));
    assert_eq!(field(&records[1], "Trace"), Some("draining"));
}

#[tokio::test]
async fn no_new_connections_after_shutdown_begins() {
    let storage = tempfile::tempdir().unwrap();
    let proxy = common::start_proxy(&common::test_config(storage.path())).await;
    let addr = proxy.local_addr();

    proxy.stop().await.unwrap();

    // The listener is gone once the server task has finished.
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn idle_proxy_stops_immediately() {
    let storage = tempfile::tempdir().unwrap();
    let proxy = common::start_proxy(&common::test_config(storage.path())).await;
    assert_eq!(proxy.active_connections(), 0);

    tokio::time::timeout(Duration::from_secs(2), proxy.stop())
        .await
        .expect("idle shutdown should not block")
        .unwrap();
    assert!(storage.path().join("log").exists());
}

#[tokio::test]
async fn response_artifact_is_complete_when_stop_returns() {
    let (origin, _seen) = common::start_fixed_origin("world").await;

    for round in 0..20 {
        let storage = tempfile::tempdir().unwrap();
        let proxy = common::start_proxy(&common::test_config(storage.path())).await;
        let client = common::proxied_client(proxy.local_addr());

        let res = client
            .get(format!("http://{origin}/"))
            .header("X-Debug", "1")
            .header("X-Trace-ID", "flush")
            .send()
            .await
            .unwrap();
        assert_eq!(res.text().await.unwrap(), "world");
        drop(client);

        proxy.stop().await.unwrap();

        let dirs = transaction_dirs(storage.path());
        assert_eq!(dirs.len(), 1, "round {round}");
        let captured = std::fs::read_to_string(dirs[0].join("res")).unwrap();
        assert_eq!(captured, "world", "round {round}");
    }
}

#[tokio::test]
async fn client_disconnect_still_finalizes_transaction() {
    let storage = tempfile::tempdir().unwrap();
    let (origin, _seen) = common::start_origin(|_| async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        (200, "too late".to_string())
    })
    .await;
    let proxy = common::start_proxy(&common::test_config(storage.path())).await;
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{}", proxy.local_addr())).unwrap())
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();

    let err = client
        .get(format!("http://{origin}/"))
        .header("X-Debug", "1")
        .header("X-Trace-ID", "impatient")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), async {
        while proxy.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("proxy should notice the disconnect");
    proxy.stop().await.unwrap();

    let records = read_records(storage.path());
    assert_eq!(records.len(), 2);
    assert_eq!(field(&records[0], "Type"), Some("request"));
    assert_eq!(field(&records[1], "Type"), Some("response"));
    assert_eq!(field(&records[1], "Transaction"), field(&records[0], "Transaction"));
    assert_eq!(field(&records[1], "Error"), Some(CLIENT_DISCONNECTED));
}
