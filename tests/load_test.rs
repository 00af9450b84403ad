//! Load testing for the relay.

use std::time::{Duration, Instant};

mod common;

#[tokio::test]
async fn test_concurrent_clients_are_all_served() {
    // 1. Setup Mock Backend
    let backend = common::start_mock_backend(r#"{"result":0.5,"error":null,"id":1}"#).await;

    // 2. Start Relay
    let mut config = common::relay_config(backend);
    config.listener.max_connections = 64;
    config.listener.backlog = 128;
    let relay = common::start_relay(config, common::template("/", Some(r#"{"id":1}"#))).await;

    // 3. Run Load Test
    let concurrency = 20;
    let requests_per_task = 25;
    let total_requests = concurrency * requests_per_task;

    let client = common::client();
    let start = Instant::now();
    let mut tasks = Vec::with_capacity(concurrency);

    for task in 0..concurrency {
        let client = client.clone();
        let url = relay.url("/");
        tasks.push(tokio::spawn(async move {
            let mut ok = 0;
            for i in 0..requests_per_task {
                let call = format!(r#"{{"method":"getbalance","id":"{}-{}"}}"#, task, i);
                match client.post(&url).body(call).send().await {
                    Ok(res) if res.status() == 200 => {
                        if res.text().await.map(|t| t.contains("\"result\"")).unwrap_or(false) {
                            ok += 1;
                        }
                    }
                    _ => {}
                }
            }
            ok
        }));
    }

    let mut successes = 0;
    for task in tasks {
        successes += task.await.unwrap();
    }
    let elapsed = start.elapsed();

    println!(
        "Load test: {} requests in {:?} ({:.0} req/s)",
        total_requests,
        elapsed,
        total_requests as f64 / elapsed.as_secs_f64()
    );
    assert_eq!(successes, total_requests, "Every concurrent call should be relayed");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_backend_does_not_serialize_clients() {
    let backend = common::start_slow_backend(Duration::from_millis(300)).await;
    let relay = common::start_relay(common::relay_config(backend), common::template("/", None)).await;

    let client = common::client();
    let start = Instant::now();
    let calls: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            let url = relay.url("/");
            tokio::spawn(async move { client.post(url).body("{}").send().await.map(|r| r.status()) })
        })
        .collect();

    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), 200);
    }
    // Ten serial calls would take at least 3s.
    assert!(start.elapsed() < Duration::from_secs(2), "Calls should run concurrently");

    relay.stop().await.unwrap();
}
