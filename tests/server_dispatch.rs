mod support;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use fleet_rpc::protocol::message::RequestMessage;
use fleet_rpc::protocol::packet::{read_packet, Packet, MAGIC_REQUEST, MAGIC_RESPONSE};
use fleet_rpc::protocol::transcode::{JsonTranscoder, Transcoder, DEFAULT_COMPRESS_THRESHOLD};
use fleet_rpc::{CallError, DirectClient, Monitors, RpcFault};

use support::{local_server_config, spawn_server, test_client_config, wait_until};

#[tokio::test]
async fn basic_call_returns_the_sum() {
    let (_server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let result = client
        .execute("Arithmetic", "add(i64,i64)", vec![json!(2), json!(3)], Duration::from_secs(2))
        .await
        .expect("call");
    assert_eq!(result, json!(5));
}

#[tokio::test]
async fn wire_format_matches_the_protocol() {
    let (_server, addr, _host) = spawn_server(local_server_config()).await;
    let transcoder = JsonTranscoder::new(DEFAULT_COMPRESS_THRESHOLD, Monitors::new());

    let message = RequestMessage {
        target: "Arithmetic".to_string(),
        method: "add(i64,i64)".to_string(),
        args: vec![json!(2), json!(3)],
    };
    let encoded = message.encode(&transcoder).expect("encode");
    let request = Packet::call_request(7, encoded.serializer, encoded.compression, encoded.bytes);
    assert_eq!(request.magic, MAGIC_REQUEST);
    assert!(!request.body.is_empty());

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut buf = Vec::new();
    request.encode_into(&mut buf);
    stream.write_all(&buf).await.expect("write");

    let reply = timeout(Duration::from_secs(2), read_packet(&mut stream, 1 << 26))
        .await
        .expect("read deadline")
        .expect("decode")
        .expect("packet");
    assert_eq!(reply.magic, MAGIC_RESPONSE);
    assert_eq!(reply.packet_id, 7);
    assert_eq!(reply.status, 0);
    let value = transcoder
        .decode(&reply.body, reply.serializer, reply.compression)
        .expect("decode body");
    assert_eq!(value, json!(5));
}

#[tokio::test]
async fn concurrent_callers_get_their_own_responses() {
    let (_server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let mut tasks = Vec::new();
    for i in 0..16i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .execute(
                    "Arithmetic",
                    "add(i64,i64)",
                    vec![json!(i), json!(i)],
                    Duration::from_secs(2),
                )
                .await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let value = task.await.expect("join").expect("call");
        assert_eq!(value, json!(2 * i as i64), "cross-talk on caller {i}");
    }
}

#[tokio::test]
async fn timed_out_call_leaves_the_channel_usable() {
    let (_server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let err = client
        .execute("Arithmetic", "sleep(u64)", vec![json!(200)], Duration::from_millis(50))
        .await
        .expect_err("should time out");
    assert!(matches!(err, CallError::Timeout(_)), "got {err:?}");

    // The server finishes the sleeping call and its late response is
    // discarded; the next call must correlate cleanly.
    let value = client
        .execute("Arithmetic", "add(i64,i64)", vec![json!(20), json!(22)], Duration::from_secs(2))
        .await
        .expect("follow-up call");
    assert_eq!(value, json!(42));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn saturated_worker_pool_answers_too_busy() {
    let (server, _addr, host) = spawn_server(local_server_config().with_max_workers(1)).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .execute("Arithmetic", "sleep(u64)", vec![json!(300)], Duration::from_secs(2))
                .await
        })
    };
    // Give the slow call time to occupy the only worker.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client
        .execute("Arithmetic", "ping()", vec![], Duration::from_secs(2))
        .await
        .expect_err("should be rejected");
    assert!(matches!(err, CallError::TooBusy), "got {err:?}");
    slow.await.expect("join").expect("slow call");
    assert_eq!(Monitors::get(&server.monitors().rejected_dispatches), 1);
}

#[tokio::test]
async fn unknown_service_and_method_are_reported() {
    let (_server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let err = client
        .execute("Geometry", "area()", vec![], Duration::from_secs(2))
        .await
        .expect_err("unknown service");
    assert!(matches!(err, CallError::Rpc(RpcFault::ClassNotFound(_))), "got {err:?}");

    let err = client
        .execute("Arithmetic", "subtract(i64,i64)", vec![json!(1), json!(2)], Duration::from_secs(2))
        .await
        .expect_err("unknown method");
    assert!(matches!(err, CallError::Rpc(RpcFault::NoSuchMethod(_))), "got {err:?}");
}

#[tokio::test]
async fn invocation_failure_carries_the_message() {
    let (_server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let err = client
        .execute("Arithmetic", "fail(String)", vec![json!("the disk is gone")], Duration::from_secs(2))
        .await
        .expect_err("invocation failure");
    match err {
        CallError::Rpc(RpcFault::Invocation(message)) => {
            assert_eq!(message, "the disk is gone");
        }
        other => panic!("expected invocation fault, got {other:?}"),
    }
}

#[tokio::test]
async fn argument_arity_is_validated_locally() {
    let (server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let before = Monitors::get(&server.monitors().executed_calls);
    let err = client
        .execute("Arithmetic", "add(i64,i64)", vec![json!(1)], Duration::from_secs(2))
        .await
        .expect_err("bad arity");
    assert!(matches!(err, CallError::Rpc(RpcFault::IllegalArgument(_))), "got {err:?}");
    // The call failed before any wire work.
    assert_eq!(Monitors::get(&server.monitors().executed_calls), before);
}

#[tokio::test]
async fn null_and_many_arguments_round_trip() {
    let (_server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let value = client
        .execute("Arithmetic", "ping()", vec![], Duration::from_secs(2))
        .await
        .expect("no arguments");
    assert_eq!(value, Value::Null);

    let value = client
        .execute("Arithmetic", "echo(json)", vec![Value::Null], Duration::from_secs(2))
        .await
        .expect("null argument");
    assert_eq!(value, Value::Null);

    let wide: Vec<Value> = (0..16).map(Value::from).collect();
    let value = client
        .execute("Arithmetic", "echo(json)", vec![json!(wide)], Duration::from_secs(2))
        .await
        .expect("wide argument");
    assert_eq!(value, json!((0..16).collect::<Vec<i64>>()));
}

#[tokio::test]
async fn closing_the_client_wakes_every_pending_call() {
    let (_server, _addr, host) = spawn_server(local_server_config()).await;
    let client = DirectClient::connect(&host, test_client_config()).await.expect("connect");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .execute("Arithmetic", "sleep(u64)", vec![json!(5000)], Duration::from_secs(10))
                .await
        }));
    }
    assert!(wait_until(Duration::from_secs(1), || client.pending_calls() == 8).await);

    client.close();
    for task in tasks {
        let result = timeout(Duration::from_secs(1), task)
            .await
            .expect("pending call must wake promptly")
            .expect("join");
        assert!(matches!(result, Err(CallError::IllegalState(_))), "got {result:?}");
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn offline_drains_in_flight_calls_and_rejects_new_ones() {
    let (server, _addr, host) = spawn_server(local_server_config()).await;
    let mut config = test_client_config();
    config.channel.offline_grace = Duration::from_millis(400);
    let client = DirectClient::connect(&host, config).await.expect("connect");

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .execute("Arithmetic", "sleep(u64)", vec![json!(200)], Duration::from_secs(2))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.offline();
    assert!(
        wait_until(Duration::from_secs(1), || client.is_offline()).await,
        "client never observed the offline announcement"
    );

    // New calls are rejected during the grace window...
    let err = client
        .execute("Arithmetic", "ping()", vec![], Duration::from_secs(1))
        .await
        .expect_err("new call during drain");
    assert!(matches!(err, CallError::IllegalState(_)), "got {err:?}");

    // ...while the in-flight call completes normally.
    let value = in_flight.await.expect("join").expect("in-flight call");
    assert_eq!(value, Value::Null);

    // The channel closes once the grace period elapses.
    assert!(
        wait_until(Duration::from_secs(2), || client.pending_calls() == 0 && !client.is_active())
            .await
    );
}
