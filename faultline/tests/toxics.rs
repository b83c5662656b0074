#![expect(clippy::unwrap_used, reason = "Test code can panic on errors")]

use std::sync::Arc;
use std::time::Duration;

use faultline::toxic::ToxicInput;
use faultline::{ErrorKind, Proxy, ProxyCollection, ProxyConfig, Toxic};
use proptest::prelude::*;
use test_utils::{
    connect, patterned_payload, payload, read_assert_payload, read_to_eof, spawn_echo_server, spawn_oneshot_server,
    write_payload,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::time::{Instant, timeout};

fn config(name: &str, upstream: &str) -> ProxyConfig {
    ProxyConfig {
        name: name.to_owned(),
        listen: "127.0.0.1:0".to_owned(),
        upstream: upstream.to_owned(),
        enabled: true,
    }
}

async fn echo_proxy(collection: &ProxyCollection, name: &str) -> Arc<Proxy> {
    let (upstream, _server) = spawn_echo_server().await.unwrap();
    collection.add(config(name, &upstream.to_string())).await.unwrap()
}

async fn add_toxic(proxy: &Proxy, raw: serde_json::Value) -> Toxic {
    let input: ToxicInput = serde_json::from_value(raw).unwrap();
    proxy.toxics().add(Toxic::from_input(input).unwrap()).await.unwrap()
}

#[tokio::test]
async fn latency_delays_the_response() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "latency", "stream": "downstream",
            "attributes": { "latency_ms": 500, "jitter_ms": 0 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let started = Instant::now();
    client.write_all(b"x").await.unwrap();

    let mut reply = [0u8; 1];
    timeout(Duration::from_millis(1500), client.read_exact(&mut reply))
        .await
        .expect("reply within the upper bound")
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(495), "replied after {elapsed:?}");
    assert_eq!(&reply, b"x");
}

#[tokio::test]
async fn latency_update_applies_to_live_connections() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({
            "name": "slow", "type": "latency", "stream": "downstream",
            "attributes": { "latency_ms": 600 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let mut reply = [0u8; 1];

    let started = Instant::now();
    client.write_all(b"a").await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(550));

    let patch: faultline::toxic::ToxicPatch =
        serde_json::from_value(serde_json::json!({ "attributes": { "latency_ms": 10 } })).unwrap();
    proxy.toxics().update("slow", patch).await.unwrap();

    let started = Instant::now();
    client.write_all(b"b").await.unwrap();
    timeout(Duration::from_millis(400), client.read_exact(&mut reply))
        .await
        .expect("updated latency must apply to the live connection")
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn jitter_larger_than_latency_never_reorders_or_corrupts() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "latency", "stream": "downstream",
            "attributes": { "latency_ms": 10, "jitter_ms": 300 },
        }),
    )
    .await;

    let payload = patterned_payload(8 * 1024);
    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let (mut reader, mut writer) = client.split();

    let write = async {
        write_payload(&mut writer, &payload).await.unwrap();
        writer.shutdown().await.unwrap();
    };
    let read = async {
        timeout(Duration::from_secs(5), read_assert_payload(&mut reader, &payload))
            .await
            .expect("delayed payload must still arrive")
            .unwrap();
    };
    tokio::join!(write, read);
}

#[tokio::test]
async fn zero_toxicity_never_applies() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "latency", "stream": "downstream", "toxicity": 0.0,
            "attributes": { "latency_ms": 5000 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    client.write_all(b"fast").await.unwrap();
    let mut reply = [0u8; 4];
    timeout(Duration::from_millis(500), client.read_exact(&mut reply))
        .await
        .expect("toxicity 0 must never delay")
        .unwrap();
    assert_eq!(&reply, b"fast");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bandwidth_added_under_traffic_throttles_the_rest() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;

    let payload = patterned_payload(64 * 1024);
    let (head, rest) = payload.split_at(10 * 1024);

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let (mut reader, mut writer) = client.split();

    // First 10 KiB flow unthrottled.
    write_payload(&mut writer, head).await.unwrap();
    read_assert_payload(&mut reader, head).await.unwrap();

    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "bandwidth", "stream": "upstream",
            "attributes": { "rate_kbps": 100 },
        }),
    )
    .await;

    // The remaining ~54 KiB are capped at 100 KB/s, so they need >500 ms,
    // and every byte still arrives in order.
    let started = Instant::now();
    let write = async {
        write_payload(&mut writer, rest).await.unwrap();
        writer.shutdown().await.unwrap();
    };
    let read = async {
        timeout(Duration::from_secs(10), read_assert_payload(&mut reader, rest))
            .await
            .expect("throttled payload must still arrive")
            .unwrap();
    };
    tokio::join!(write, read);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400), "finished after {elapsed:?}");
}

#[tokio::test]
async fn bandwidth_zero_pauses_until_removed() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({
            "name": "pause", "type": "bandwidth", "stream": "downstream",
            "attributes": { "rate_kbps": 0 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut reply = [0u8; 4];
    let stalled = timeout(Duration::from_millis(300), client.read_exact(&mut reply)).await;
    assert!(stalled.is_err(), "no bytes may flow while the pause toxic is present");

    proxy.toxics().remove("pause").await.unwrap();

    timeout(Duration::from_secs(1), client.read_exact(&mut reply))
        .await
        .expect("buffered bytes must resume after removal")
        .unwrap();
    assert_eq!(&reply, b"ping");
}

#[tokio::test]
async fn limit_data_truncates_and_half_closes() {
    let collection = ProxyCollection::new(7);
    let (upstream, _server) = spawn_oneshot_server(b"ABCDEFGHIJ".to_vec()).await.unwrap();
    let proxy = collection.add(config("a", &upstream.to_string())).await.unwrap();
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "limit_data", "stream": "downstream",
            "attributes": { "bytes": 5 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let received = timeout(Duration::from_secs(1), read_to_eof(&mut client))
        .await
        .expect("truncated stream must end in EOF")
        .unwrap();
    assert_eq!(received, b"ABCDE");

    // The client-to-upstream direction stays usable after the truncation.
    client.write_all(b"still-open").await.unwrap();
}

#[tokio::test]
async fn limit_data_zero_closes_immediately() {
    let collection = ProxyCollection::new(7);
    let (upstream, _server) = spawn_oneshot_server(b"DATA".to_vec()).await.unwrap();
    let proxy = collection.add(config("a", &upstream.to_string())).await.unwrap();
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "limit_data", "stream": "downstream",
            "attributes": { "bytes": 0 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let received = timeout(Duration::from_secs(1), read_to_eof(&mut client))
        .await
        .expect("zero budget must close right away")
        .unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn timeout_zero_stalls_forever() {
    let collection = ProxyCollection::new(7);
    let (upstream, _server) = spawn_oneshot_server(b"DATA".to_vec()).await.unwrap();
    let proxy = collection.add(config("a", &upstream.to_string())).await.unwrap();
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "timeout", "stream": "downstream",
            "attributes": { "timeout_ms": 0 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let mut buffer = [0u8; 16];
    let stalled = timeout(Duration::from_millis(500), client.read(&mut buffer)).await;
    assert!(stalled.is_err(), "the connection must sit idle, neither data nor EOF");
}

#[tokio::test]
async fn timeout_closes_after_the_deadline() {
    let collection = ProxyCollection::new(7);
    let (upstream, _server) = spawn_oneshot_server(b"DATA".to_vec()).await.unwrap();
    let proxy = collection.add(config("a", &upstream.to_string())).await.unwrap();
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "timeout", "stream": "downstream",
            "attributes": { "timeout_ms": 200 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let started = Instant::now();
    let received = timeout(Duration::from_secs(2), read_to_eof(&mut client))
        .await
        .expect("stream must close once the timeout fires")
        .unwrap();
    assert!(received.is_empty(), "the timeout toxic never forwards data");
    assert!(started.elapsed() >= Duration::from_millis(180));
}

#[tokio::test]
async fn slow_close_delays_the_fin() {
    let collection = ProxyCollection::new(7);
    let (upstream, _server) = spawn_oneshot_server(b"DATA".to_vec()).await.unwrap();
    let proxy = collection.add(config("a", &upstream.to_string())).await.unwrap();
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "slow_close", "stream": "downstream",
            "attributes": { "delay_ms": 400 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let started = Instant::now();
    let received = timeout(Duration::from_secs(2), read_to_eof(&mut client))
        .await
        .expect("stream must close eventually")
        .unwrap();
    assert_eq!(received, b"DATA", "data itself flows untouched");
    assert!(started.elapsed() >= Duration::from_millis(350), "the close is what lags");
}

#[tokio::test]
async fn reset_peer_aborts_instead_of_closing() {
    let collection = ProxyCollection::new(7);
    let (upstream, _server) = spawn_oneshot_server(b"DATA".to_vec()).await.unwrap();
    let proxy = collection.add(config("a", &upstream.to_string())).await.unwrap();
    add_toxic(
        &proxy,
        serde_json::json!({
            "type": "reset_peer", "stream": "downstream",
            "attributes": { "timeout_ms": 0 },
        }),
    )
    .await;

    let mut client = connect(&proxy.listen_addr()).await.unwrap();
    let outcome = timeout(Duration::from_secs(1), read_to_eof(&mut client))
        .await
        .expect("the abort must arrive promptly");
    assert!(outcome.is_err(), "expected a connection reset, got {outcome:?}");
}

#[tokio::test]
async fn duplicate_toxic_name_is_rejected() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({
            "name": "t", "type": "latency", "attributes": { "latency_ms": 10 },
        }),
    )
    .await;

    let input: ToxicInput = serde_json::from_value(serde_json::json!({
        "name": "t", "type": "latency", "attributes": { "latency_ms": 99 },
    }))
    .unwrap();
    let error = proxy.toxics().add(Toxic::from_input(input).unwrap()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ToxicAlreadyExists);

    let names: Vec<String> = proxy.toxics().list().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["t".to_owned()], "the chain still contains exactly one `t`");
}

#[tokio::test]
async fn toxic_round_trip_add_list_remove() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({
            "name": "t", "type": "slicer",
            "attributes": { "average_size": 64 },
        }),
    )
    .await;

    assert!(proxy.toxics().list().await.iter().any(|t| t.name == "t"));
    proxy.toxics().remove("t").await.unwrap();
    assert!(!proxy.toxics().list().await.iter().any(|t| t.name == "t"));
    assert_eq!(proxy.toxics().remove("t").await.unwrap_err().kind(), ErrorKind::ToxicNotFound);
}

#[tokio::test]
async fn reset_state_reenables_proxies_and_clears_toxics() {
    let collection = ProxyCollection::new(7);
    let proxy = echo_proxy(&collection, "a").await;
    add_toxic(
        &proxy,
        serde_json::json!({ "type": "latency", "attributes": { "latency_ms": 100 } }),
    )
    .await;
    proxy.stop().await;
    assert!(!proxy.is_enabled());

    collection.reset_state().await.unwrap();

    assert!(proxy.is_enabled());
    assert!(proxy.toxics().list().await.is_empty());
}

#[test]
fn slicer_preserves_the_byte_stream() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let collection = ProxyCollection::new(7);
    let (proxy_addr, _server) = rt.block_on(async {
        let (upstream, server) = spawn_echo_server().await.unwrap();
        let proxy = collection.add(config("a", &upstream.to_string())).await.unwrap();
        add_toxic(
            &proxy,
            serde_json::json!({
                "type": "slicer", "stream": "upstream",
                "attributes": { "average_size": 1300, "size_variation": 1200 },
            }),
        )
        .await;
        (proxy.listen_addr(), server)
    });

    proptest!(ProptestConfig::with_cases(8), |(payload in payload().no_shrink())| {
        rt.block_on(async {
            let mut client = connect(&proxy_addr).await.unwrap();
            let (mut reader, mut writer) = client.split();

            let write = async {
                write_payload(&mut writer, &payload.0).await.unwrap();
                writer.shutdown().await.unwrap();
            };
            let read = async {
                timeout(Duration::from_secs(10), read_assert_payload(&mut reader, &payload.0))
                    .await
                    .expect("sliced payload must arrive in full")
                    .unwrap();
            };
            tokio::join!(write, read);
        });
    });
}
