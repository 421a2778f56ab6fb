#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;

use fleet_rpc::{ClientConfig, InvokeError, RpcServer, ServerConfig, ServiceDescriptor};

/// The demo service used across the integration suites.
pub fn arithmetic_service() -> ServiceDescriptor {
    ServiceDescriptor::new("Arithmetic")
        .method("add(i64,i64)", |args| async move {
            let a = args[0]
                .as_i64()
                .ok_or_else(|| InvokeError::IllegalArgument("first addend must be an integer".to_string()))?;
            let b = args[1]
                .as_i64()
                .ok_or_else(|| InvokeError::IllegalArgument("second addend must be an integer".to_string()))?;
            Ok(Value::from(a + b))
        })
        .method("ping()", |_args| async move { Ok(Value::Null) })
        .method("echo(json)", |mut args| async move { Ok(args.remove(0)) })
        .method("sleep(u64)", |args| async move {
            let millis = args[0].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(Value::Null)
        })
        .method("fail(String)", |args| async move {
            Err(InvokeError::Failed(args[0].as_str().unwrap_or("failure").to_string()))
        })
}

/// Binds the arithmetic service on an ephemeral local port and drives the
/// accept loop in the background.
pub async fn spawn_server(config: ServerConfig) -> (RpcServer, SocketAddr, String) {
    spawn_server_with(config, arithmetic_service()).await
}

pub async fn spawn_server_with(
    config: ServerConfig,
    service: ServiceDescriptor,
) -> (RpcServer, SocketAddr, String) {
    let server = RpcServer::bind(config).await.expect("bind server");
    server.register(service);
    let addr = server.local_addr();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    (server, addr, format!("127.0.0.1:{}", addr.port()))
}

pub fn local_server_config() -> ServerConfig {
    ServerConfig::on("127.0.0.1:0")
}

/// Client config tightened for tests: fast rescue sweeps and a slow
/// threshold high enough to keep the slow stream quiet.
pub fn test_client_config() -> ClientConfig {
    let mut config = ClientConfig::default()
        .with_default_timeout(Duration::from_secs(2))
        .with_rescue_interval(Duration::from_millis(100));
    config.slow_threshold = Duration::from_secs(1);
    config
}

/// Polls `probe` until it returns true or the deadline passes.
pub async fn wait_until<F: FnMut() -> bool>(deadline: Duration, mut probe: F) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    probe()
}
