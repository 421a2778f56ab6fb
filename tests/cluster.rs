mod support;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use fleet_rpc::{CallError, ClusterClient, Monitors, RpcServer, ServiceDescriptor};

use support::{local_server_config, spawn_server, spawn_server_with, test_client_config, wait_until};

/// A service that reports which backend answered.
fn whoami_service(index: i64) -> ServiceDescriptor {
    ServiceDescriptor::new("Fleet").method("whoami()", move |_args| async move { Ok(json!(index)) })
}

async fn spawn_fleet(size: i64) -> (Vec<RpcServer>, Vec<String>) {
    let mut servers = Vec::new();
    let mut hosts = Vec::new();
    for index in 0..size {
        let (server, _addr, host) =
            spawn_server_with(local_server_config(), whoami_service(index)).await;
        servers.push(server);
        hosts.push(host);
    }
    (servers, hosts)
}

#[tokio::test]
async fn round_robin_visits_every_host_equally() {
    let (_servers, hosts) = spawn_fleet(3).await;
    let cluster = ClusterClient::connect(hosts, test_client_config()).await.expect("connect");

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for _ in 0..9 {
        let value = cluster
            .execute("Fleet", "whoami()", vec![], Duration::from_secs(2))
            .await
            .expect("call");
        *counts.entry(value.as_i64().expect("index")).or_default() += 1;
    }
    assert_eq!(counts.len(), 3, "some host was never selected: {counts:?}");
    for (host, count) in counts {
        assert_eq!(count, 3, "host {host} selected {count} times");
    }
}

#[tokio::test]
async fn too_busy_host_is_retried_on_a_peer() {
    // One backend rejects everything (zero workers), the other is healthy.
    let (_busy, _addr, busy_host) =
        spawn_server(local_server_config().with_max_workers(0)).await;
    let (_ok, _addr2, ok_host) = spawn_server(local_server_config()).await;

    let cluster = ClusterClient::connect(vec![busy_host, ok_host], test_client_config())
        .await
        .expect("connect");
    for _ in 0..10 {
        let value = cluster
            .execute("Arithmetic", "add(i64,i64)", vec![json!(2), json!(3)], Duration::from_secs(2))
            .await
            .expect("retried call");
        assert_eq!(value, json!(5));
    }
}

#[tokio::test]
async fn dead_host_falls_back_to_a_random_peer() {
    let (servers, hosts) = spawn_fleet(3).await;
    let cluster = ClusterClient::connect(hosts, test_client_config()).await.expect("connect");

    servers[1].shutdown();
    assert!(
        wait_until(Duration::from_secs(2), || cluster.list().get(1).is_none()).await,
        "slot 1 still holds a client"
    );

    // Every call keeps succeeding on the surviving backends.
    for _ in 0..12 {
        let value = cluster
            .execute("Fleet", "whoami()", vec![], Duration::from_secs(2))
            .await
            .expect("fallback call");
        assert_ne!(value, json!(1), "dead backend answered");
    }
}

#[tokio::test]
async fn rescued_host_gets_a_recovery_timestamp() {
    let (servers, hosts) = spawn_fleet(3).await;
    let cluster =
        ClusterClient::connect(hosts.clone(), test_client_config()).await.expect("connect");
    assert_eq!(cluster.list().rescue_time_millis(1), 0);

    servers[1].shutdown();
    assert!(wait_until(Duration::from_secs(2), || cluster.list().get(1).is_none()).await);

    // Restart a backend on the same port; the rescue task reconnects.
    let (_revived, _addr, _host) =
        spawn_server_with(fleet_rpc::ServerConfig::on(hosts[1].clone()), whoami_service(1)).await;
    assert!(
        wait_until(Duration::from_secs(3), || cluster.list().rescue_time_millis(1) != 0).await,
        "slot 1 was never rescued"
    );
    assert!(wait_until(Duration::from_secs(2), || cluster.list().get(1).is_some()).await);
    assert!(cluster.list().since_rescue(1).expect("rescued") < Duration::from_secs(60));
}

#[tokio::test]
async fn empty_cluster_fails_with_illegal_state() {
    let (server, _addr, host) = spawn_server(local_server_config()).await;
    let cluster = ClusterClient::connect(vec![host], test_client_config()).await.expect("connect");

    server.shutdown();
    assert!(wait_until(Duration::from_secs(2), || cluster.list().get(0).is_none()).await);

    let err = cluster
        .execute("Arithmetic", "ping()", vec![], Duration::from_secs(1))
        .await
        .expect_err("no healthy client");
    assert!(matches!(err, CallError::IllegalState(_)), "got {err:?}");
    assert!(Monitors::get(&cluster.list().monitors().cluster_unavailable) >= 1);
}

#[tokio::test]
async fn list_rejects_an_unreachable_fleet() {
    // Nothing listens on these ports; initialization must fail outright.
    let err = ClusterClient::connect(
        vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()],
        test_client_config(),
    )
    .await
    .expect_err("unreachable fleet");
    assert!(err.to_string().contains("no reachable host"), "got {err:#}");
}

#[tokio::test]
async fn void_results_survive_the_cluster_path() {
    let (_servers, hosts) = {
        let (s, _a, h) = spawn_server(local_server_config()).await;
        (vec![s], vec![h])
    };
    let cluster = ClusterClient::connect(hosts, test_client_config()).await.expect("connect");
    let value = cluster
        .execute("Arithmetic", "ping()", vec![], Duration::from_secs(2))
        .await
        .expect("ping");
    assert_eq!(value, Value::Null);
}
