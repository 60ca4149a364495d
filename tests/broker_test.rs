use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use courier::broker::{BrokerConfig, BrokerError, CorrelationBroker};
use courier::events::{Event, EventBus};
use courier::transport::memory::MemoryLog;
use courier::transport::{LogTransport, OffsetReset};
use courier::wire::{Reply, Request};
use courier::worker::{ReplyWorker, WorkerConfig};

const READY: Duration = Duration::from_secs(2);

fn fast_config() -> BrokerConfig {
    BrokerConfig {
        poll_interval: Duration::from_millis(20),
        resubscribe_backoff: Duration::from_millis(20),
        ..BrokerConfig::default()
    }
}

async fn broker_on(log: &MemoryLog) -> CorrelationBroker {
    let broker = CorrelationBroker::start(
        Arc::new(log.clone()),
        fast_config(),
        Arc::new(EventBus::default()),
    )
    .await
    .unwrap();
    assert!(broker.wait_ready(READY).await);
    broker
}

async fn wait_for_in_flight(broker: &CorrelationBroker, n: usize) {
    let deadline = Instant::now() + READY;
    while broker.in_flight() != n {
        assert!(Instant::now() < deadline, "in_flight never reached {n}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn call_returns_worker_result() {
    let log = MemoryLog::new(3);
    let worker = ReplyWorker::new(
        Arc::new(log.clone()),
        WorkerConfig::default(),
        Arc::new(EventBus::default()),
    )
    .spawn();
    let broker = broker_on(&log).await;

    let reply = broker.call("2+3*4", Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply.outcome(), Ok("14"));
    assert_eq!(broker.in_flight(), 0);

    worker.stop().await;
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_reply() {
    let log = MemoryLog::new(3);
    let broker = broker_on(&log).await;

    // A replier that answers a batch in reverse arrival order, echoing the
    // payload so each caller can check it got its own answer.
    let replier_log = log.clone();
    let replier = tokio::spawn(async move {
        let mut sub = replier_log
            .subscribe("math-requests", None, OffsetReset::Earliest)
            .await
            .unwrap();
        let mut requests = Vec::new();
        while requests.len() < 20 {
            for record in sub.poll(Duration::from_millis(200)).await.unwrap() {
                requests.push(Request::from_record(&record, "math-replies"));
            }
        }
        for request in requests.into_iter().rev() {
            let reply = Reply::success(&request.correlation_id, &request.payload, &request.payload);
            replier_log
                .append(reply.to_record(&request.reply_to))
                .await
                .unwrap();
        }
    });

    let calls = (0..20).map(|i| {
        let broker = &broker;
        async move {
            let payload = format!("{i}+0");
            let reply = broker.call(&payload, Duration::from_secs(5)).await.unwrap();
            (payload, reply)
        }
    });
    let results = join_all(calls).await;

    let mut seen = HashMap::new();
    for (payload, reply) in results {
        assert_eq!(reply.outcome(), Ok(payload.as_str()));
        assert!(seen.insert(reply.correlation_id.clone(), payload).is_none());
    }
    assert_eq!(seen.len(), 20);
    assert_eq!(broker.in_flight(), 0);
    replier.await.unwrap();
}

#[tokio::test]
async fn unanswered_call_times_out_and_late_reply_is_ignored() {
    let log = MemoryLog::new(1);
    let broker = broker_on(&log).await;

    let started = Instant::now();
    let err = broker
        .call_with_id("late-1", "1+1", Duration::from_millis(200))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    match err {
        BrokerError::Timeout {
            correlation_id,
            timeout,
        } => {
            assert_eq!(correlation_id, "late-1");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(waited >= Duration::from_millis(200), "{waited:?}");
    assert!(waited < Duration::from_secs(2), "{waited:?}");
    assert_eq!(broker.in_flight(), 0);

    log.append(Reply::success("late-1", "1+1", "2").to_record("math-replies"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.in_flight(), 0);

    // The id is free again.
    let err = broker
        .call_with_id("late-1", "1+1", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Timeout { .. }));
}

#[tokio::test]
async fn duplicate_live_id_is_rejected() {
    let log = MemoryLog::new(1);
    let broker = Arc::new(broker_on(&log).await);

    let first = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            broker
                .call_with_id("dup", "1", Duration::from_millis(500))
                .await
        })
    };
    wait_for_in_flight(&broker, 1).await;

    let err = broker
        .call_with_id("dup", "2", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DuplicateCorrelationId(id) if id == "dup"));

    // The first waiter is untouched and still times out on its own.
    assert!(matches!(
        first.await.unwrap(),
        Err(BrokerError::Timeout { .. })
    ));
}

#[tokio::test]
async fn append_failure_leaves_no_waiter() {
    let log = MemoryLog::new(1);
    let broker = broker_on(&log).await;

    log.fail_appends(true);
    let err = broker.call("1+1", Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)), "{err:?}");
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn listener_loss_fails_waiters_and_recovers() {
    let log = MemoryLog::new(1);
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let broker = Arc::new(
        CorrelationBroker::start(Arc::new(log.clone()), fast_config(), Arc::clone(&events))
            .await
            .unwrap(),
    );
    assert!(broker.wait_ready(READY).await);

    let pending = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.call("1+1", Duration::from_secs(10)).await })
    };
    wait_for_in_flight(&broker, 1).await;

    let started = Instant::now();
    log.sever_subscriptions();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::ListenerLost(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(broker.in_flight(), 0);

    let lost = tokio::time::timeout(READY, async {
        loop {
            if let Event::ListenerLost { failed_waiters, .. } = rx.recv().await.unwrap() {
                return failed_waiters;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(lost, 1);

    // Resubscribed: a worker started now gets answers through.
    let worker = ReplyWorker::new(
        Arc::new(log.clone()),
        WorkerConfig::default(),
        Arc::clone(&events),
    )
    .spawn();
    assert!(broker.wait_ready(READY).await);
    let reply = broker.call("6/3", Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply.outcome(), Ok("2"));
    worker.stop().await;
}

#[tokio::test]
async fn shutdown_fails_pending_and_refuses_new_calls() {
    let log = MemoryLog::new(1);
    let broker = Arc::new(broker_on(&log).await);

    let pending = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.call("1", Duration::from_secs(10)).await })
    };
    wait_for_in_flight(&broker, 1).await;

    broker.shutdown().await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(BrokerError::ShutDown)
    ));
    assert!(matches!(
        broker.call("1", Duration::from_secs(1)).await,
        Err(BrokerError::ShutDown)
    ));
    assert!(!broker.is_ready());
}

#[tokio::test]
async fn fire_and_forget_appends_keyed_request() {
    let log = MemoryLog::new(1);
    let broker = broker_on(&log).await;

    let id = broker.fire_and_forget("7*6");
    broker.flush().await;

    let mut sub = log
        .subscribe("math-requests", None, OffsetReset::Earliest)
        .await
        .unwrap();
    let records = sub.poll(Duration::from_millis(200)).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key.as_deref(), Some(id.as_str()));
    assert_eq!(records[0].value, r#"{"expression":"7*6"}"#);
    assert_eq!(records[0].header("reply_topic"), Some("math-replies"));
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn fire_and_forget_failure_does_not_surface() {
    let log = MemoryLog::new(1);
    let broker = broker_on(&log).await;

    log.fail_appends(true);
    let id = broker.fire_and_forget("1+1");
    broker.flush().await;
    assert!(!id.is_empty());
}
