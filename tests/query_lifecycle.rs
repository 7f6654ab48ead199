//! End-to-end behavior of the query side: deduplication, invalidation,
//! cancellation with revert, structural sharing, gc, and batched
//! notifications. These tests never touch the process-wide focus/online
//! managers, so they run concurrently without coordination.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use queryvisor::{
    CancelOptions, DehydrateOptions, DehydratedState, FetchStatus, GcTime, PlaceholderData,
    QueryCacheEvent, QueryClient, QueryFilters, QueryObserver, QueryObserverOptions, QueryOptions,
    RefetchType, RetryPolicy, dehydrate, hydrate, notify_manager,
};

fn counted_options(
    key: Vec<Value>,
    calls: Arc<AtomicUsize>,
    value: Value,
    delay: Duration,
) -> QueryOptions {
    QueryOptions::new(key)
        .with_gc_time(GcTime::Never)
        .with_query_fn(move |_ctx| {
            let calls = Arc::clone(&calls);
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                Ok(value)
            }
        })
}

#[tokio::test(start_paused = true)]
async fn deduplicates_concurrent_observers() {
    let client = QueryClient::new();

    let events = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&events);
    let _cache_sub = client.query_cache().subscribe(move |event| {
        let tag = match event {
            QueryCacheEvent::Added(_) => "added".to_string(),
            QueryCacheEvent::ObserverAdded { .. } => "observerAdded".to_string(),
            QueryCacheEvent::Updated { action, .. } => format!("updated:{action:?}"),
            _ => return,
        };
        sink.lock().unwrap().push(tag);
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(
        vec![json!("u"), json!(1)],
        Arc::clone(&calls),
        json!({"id": 1}),
        Duration::from_millis(50),
    );
    let obs1 = QueryObserver::new(&client, QueryObserverOptions::new(options.clone()));
    let obs2 = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let _s1 = obs1.subscribe(|_| {});
    let _s2 = obs2.subscribe(|_| {});

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1, "one fetch for two observers");
    let r1 = obs1.get_current_result();
    let r2 = obs2.get_current_result();
    assert!(r1.is_success());
    assert!(r2.is_success());
    let d1 = r1.data().expect("obs1 data");
    let d2 = r2.data().expect("obs2 data");
    assert!(Arc::ptr_eq(d1, d2), "both observers share one payload");

    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "added",
            "observerAdded",
            "updated:fetch",
            "observerAdded",
            "updated:success",
        ],
    );
}

#[tokio::test(start_paused = true)]
async fn invalidate_refetches_active_queries_only() {
    let client = QueryClient::new();

    let a_calls = Arc::new(AtomicUsize::new(0));
    let b_calls = Arc::new(AtomicUsize::new(0));
    let c_calls = Arc::new(AtomicUsize::new(0));

    let a = counted_options(vec![json!("a")], Arc::clone(&a_calls), json!(1), Duration::ZERO);
    let b = counted_options(vec![json!("b")], Arc::clone(&b_calls), json!(2), Duration::ZERO);
    let c = counted_options(vec![json!("c")], Arc::clone(&c_calls), json!(3), Duration::ZERO);

    let obs_a = QueryObserver::new(&client, QueryObserverOptions::new(a));
    let obs_b = QueryObserver::new(&client, QueryObserverOptions::new(b));
    let _sa = obs_a.subscribe(|_| {});
    let _sb = obs_b.subscribe(|_| {});
    client.prefetch_query(c.clone()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(c_calls.load(Ordering::SeqCst), 1);

    client
        .invalidate_queries(QueryFilters::default(), RefetchType::Active)
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(a_calls.load(Ordering::SeqCst), 2, "active query refetched");
    assert_eq!(b_calls.load(Ordering::SeqCst), 2, "active query refetched");
    assert_eq!(c_calls.load(Ordering::SeqCst), 1, "inactive query untouched");

    let c_state = client.get_query_state(&vec![json!("c")]).expect("c cached");
    assert!(c_state.is_invalidated, "inactive query marked stale");

    // Observing the stale entry now triggers a fetch.
    let obs_c = QueryObserver::new(&client, QueryObserverOptions::new(c));
    let _sc = obs_c.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(c_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_with_revert_restores_snapshot() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = QueryOptions::new(vec![json!("n")])
        .with_gc_time(GcTime::Never)
        .with_query_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(json!(1))
                } else {
                    futures::future::pending().await
                }
            }
        });

    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;

    let first = observer.get_current_result();
    assert!(first.is_success());
    assert_eq!(first.data().map(|d| (**d).clone()), Some(json!(1)));
    let original_updated_at = first.data_updated_at;

    // Start a refetch that never resolves.
    drop(observer.refetch());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(observer.get_current_result().is_refetching());

    client
        .cancel_queries(&QueryFilters::default(), CancelOptions::revert())
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = observer.get_current_result();
    assert_eq!(result.data().map(|d| (**d).clone()), Some(json!(1)));
    assert_eq!(result.data_updated_at, original_updated_at);
    assert_eq!(result.fetch_status, FetchStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn structural_sharing_preserves_identity() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(
        vec![json!("list")],
        Arc::clone(&calls),
        json!({"items": [1, 2, 3]}),
        Duration::ZERO,
    );

    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;

    let d1 = observer.get_current_result().data().cloned().expect("data");
    observer.refetch().await.expect("refetch");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let d2 = observer.get_current_result().data().cloned().expect("data");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(Arc::ptr_eq(&d1, &d2), "deep-equal payload keeps identity");
}

#[tokio::test(start_paused = true)]
async fn gc_removes_observerless_query_after_gc_time() {
    let client = QueryClient::new();
    let key = vec![json!("g")];
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(key.clone(), calls, json!("kept"), Duration::ZERO)
        .with_gc_time(GcTime::After(Duration::from_millis(100)));

    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client.get_query_data(&key).is_some());

    sub.unsubscribe();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(client.get_query_data(&key).is_none(), "collected after gc");
}

#[tokio::test(start_paused = true)]
async fn re_observing_cancels_gc() {
    let client = QueryClient::new();
    let key = vec![json!("g2")];
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(key.clone(), calls, json!("kept"), Duration::ZERO)
        .with_gc_time(GcTime::After(Duration::from_millis(100)));

    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;

    sub.unsubscribe();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _sub2 = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(client.get_query_data(&key).is_some(), "gc was cancelled");
}

#[tokio::test(start_paused = true)]
async fn gc_time_zero_collects_immediately() {
    let client = QueryClient::new();
    let key = vec![json!("ephemeral")];
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(key.clone(), calls, json!(1), Duration::ZERO)
        .with_gc_time(GcTime::After(Duration::ZERO));

    client.prefetch_query(options).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client.get_query_data(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn batched_writes_notify_once_with_last_value() {
    let client = QueryClient::new();
    let key = vec![json!("counter")];
    client.set_query_data(key.clone(), json!(0));

    let options = QueryOptions::new(key.clone())
        .with_gc_time(GcTime::Never)
        .with_stale_time(Duration::MAX);
    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));

    let notifications = Arc::new(std::sync::Mutex::new(Vec::<Value>::new()));
    let sink = Arc::clone(&notifications);
    let _sub = observer.subscribe(move |result| {
        let value = result.data().map(|d| (**d).clone()).unwrap_or(Value::Null);
        sink.lock().unwrap().push(value);
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    notifications.lock().unwrap().clear();

    notify_manager().batch(|| {
        for i in 1..=10 {
            client.set_query_data(key.clone(), json!(i));
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let seen = notifications.lock().unwrap().clone();
    assert_eq!(seen.len(), 1, "one notification per flush");
    assert_eq!(seen[0], json!(10), "carries the last value");
}

#[tokio::test(start_paused = true)]
async fn infinite_stale_time_never_refetches_on_mount() {
    let client = QueryClient::new();
    let key = vec![json!("pinned")];
    client.set_query_data(key.clone(), json!("fresh"));

    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(key, Arc::clone(&calls), json!("new"), Duration::ZERO)
        .with_stale_time(Duration::MAX);
    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!observer.get_current_result().is_stale);
}

#[tokio::test(start_paused = true)]
async fn retry_boundaries() {
    let client = QueryClient::new();

    // retry off: a single attempt, the failure surfaces.
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let failing = QueryOptions::new(vec![json!("fails")])
        .with_gc_time(GcTime::Never)
        .with_query_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("down"))
            }
        });
    let result = client.fetch_query(failing).await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1, "retry off never retries");

    // transient failures resolve once under a retry policy.
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let flaky = QueryOptions::new(vec![json!("flaky")])
        .with_gc_time(GcTime::Never)
        .with_retry(RetryPolicy::Always)
        .with_query_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(json!("up"))
                }
            }
        });
    let result = client.fetch_query(flaky).await.expect("resolves");
    assert_eq!(*result, json!("up"));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn error_keeps_previous_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = QueryOptions::new(vec![json!("sometimes")])
        .with_gc_time(GcTime::Never)
        .with_retry(RetryPolicy::Never)
        .with_query_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(json!("cached"))
                } else {
                    Err(anyhow::anyhow!("down"))
                }
            }
        });

    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(observer.get_current_result().is_success());

    let _ = observer.refetch().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = observer.get_current_result();
    assert!(result.is_error());
    assert!(result.error.is_some());
    assert_eq!(
        result.data().map(|d| (**d).clone()),
        Some(json!("cached")),
        "stale data survives the error",
    );
}

#[tokio::test(start_paused = true)]
async fn select_derives_and_memoizes() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(
        vec![json!("wrapped")],
        calls,
        json!({"items": [1, 2, 3]}),
        Duration::ZERO,
    );
    let observer = QueryObserver::new(
        &client,
        QueryObserverOptions::new(options).with_select(|value| Ok(value["items"].clone())),
    );
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;

    let d1 = observer.get_current_result().data().cloned().expect("data");
    assert_eq!(*d1, json!([1, 2, 3]));

    observer.refetch().await.expect("refetch");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let d2 = observer.get_current_result().data().cloned().expect("data");
    assert!(Arc::ptr_eq(&d1, &d2), "selector output memoized");
}

#[tokio::test(start_paused = true)]
async fn placeholder_data_shows_while_pending() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(
        vec![json!("slow")],
        calls,
        json!("real"),
        Duration::from_millis(50),
    );
    let observer = QueryObserver::new(
        &client,
        QueryObserverOptions::new(options)
            .with_placeholder_data(PlaceholderData::Value(Arc::new(json!("loading")))),
    );
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;

    let early = observer.get_current_result();
    assert!(early.is_success());
    assert!(early.is_placeholder_data);
    assert!(early.is_fetching());
    assert_eq!(early.data().map(|d| (**d).clone()), Some(json!("loading")));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let late = observer.get_current_result();
    assert!(!late.is_placeholder_data);
    assert_eq!(late.data().map(|d| (**d).clone()), Some(json!("real")));
}

#[tokio::test(start_paused = true)]
async fn keep_previous_data_across_key_change() {
    let client = QueryClient::new();
    let make = |id: u64, delay: Duration| {
        QueryOptions::new(vec![json!("item"), json!(id)])
            .with_gc_time(GcTime::Never)
            .with_query_fn(move |_ctx| async move {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                Ok(json!({"id": id}))
            })
    };

    let observer = QueryObserver::new(
        &client,
        QueryObserverOptions::new(make(1, Duration::ZERO))
            .with_placeholder_data(PlaceholderData::KeepPrevious),
    );
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        observer.get_current_result().data().map(|d| (**d).clone()),
        Some(json!({"id": 1})),
    );

    observer.set_options(
        QueryObserverOptions::new(make(2, Duration::from_millis(50)))
            .with_placeholder_data(PlaceholderData::KeepPrevious),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    let transitional = observer.get_current_result();
    assert!(transitional.is_placeholder_data, "previous data exposed");
    assert_eq!(
        transitional.data().map(|d| (**d).clone()),
        Some(json!({"id": 1})),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = observer.get_current_result();
    assert!(!settled.is_placeholder_data);
    assert_eq!(settled.data().map(|d| (**d).clone()), Some(json!({"id": 2})));
}

#[tokio::test(start_paused = true)]
async fn dehydrate_hydrate_round_trip() {
    let client = QueryClient::new();
    client.set_query_data(vec![json!("user"), json!(1)], json!({"name": "ada"}));
    client.set_query_data(vec![json!("user"), json!(2)], json!({"name": "grace"}));

    let snapshot = dehydrate(&client, &DehydrateOptions::default());
    assert_eq!(snapshot.queries.len(), 2);

    let encoded = serde_json::to_string(&snapshot).expect("serialize");
    let decoded: DehydratedState = serde_json::from_str(&encoded).expect("deserialize");

    let restored = QueryClient::new();
    hydrate(&restored, &decoded);

    for (id, name) in [(1, "ada"), (2, "grace")] {
        let key = vec![json!("user"), json!(id)];
        let original = client.get_query_state(&key).expect("original state");
        let rebuilt = restored.get_query_state(&key).expect("rebuilt state");
        assert_eq!(
            rebuilt.data.as_deref(),
            Some(&json!({"name": name})),
            "payload survives the round trip",
        );
        assert_eq!(rebuilt.data_updated_at, original.data_updated_at);
    }

    // Fresh hydrated data does not fetch when observed.
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(
        vec![json!("user"), json!(1)],
        Arc::clone(&calls),
        json!({"name": "other"}),
        Duration::ZERO,
    )
    .with_stale_time(Duration::MAX);
    let observer = QueryObserver::new(&restored, QueryObserverOptions::new(options));
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        observer.get_current_result().data().map(|d| (**d).clone()),
        Some(json!({"name": "ada"})),
    );
}
