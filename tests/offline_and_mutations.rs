//! Offline pausing, focus/reconnect reactivity, and mutation behavior
//! (scope serialization, lifecycle callbacks, retries, resumption).
//!
//! These tests toggle the process-wide focus/online managers, so they take a
//! shared lock and restore the defaults before releasing it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use serde_json::{Value, json};

use queryvisor::{
    FetchStatus, GcTime, MutateCallbacks, MutationObserver, MutationOptions, NetworkMode,
    QueryClient, QueryObserver, QueryObserverOptions, QueryOptions, Refetch, RetryPolicy,
    focus_manager, online_manager,
};

fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let guard = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    // Known starting point regardless of what the previous test left.
    online_manager().set_online(true);
    focus_manager().set_focused(None);
    guard
}

fn counted_options(
    key: Vec<Value>,
    calls: Arc<AtomicUsize>,
    value: Value,
) -> QueryOptions {
    QueryOptions::new(key)
        .with_gc_time(GcTime::Never)
        .with_query_fn(move |_ctx| {
            let calls = Arc::clone(&calls);
            let value = value.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
}

#[tokio::test(start_paused = true)]
async fn offline_query_pauses_until_reconnect() {
    let _env = env_lock();
    online_manager().set_online(false);

    let client = QueryClient::new();
    client.mount();

    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(
        vec![json!("offline")],
        Arc::clone(&calls),
        json!({"ok": true}),
    )
    .with_network_mode(NetworkMode::Online);

    let observer = QueryObserver::new(&client, QueryObserverOptions::new(options));
    let _sub = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(20)).await;

    let paused = observer.get_current_result();
    assert!(paused.is_pending());
    assert_eq!(paused.fetch_status, FetchStatus::Paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "nothing ran while offline");

    online_manager().set_online(true);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let settled = observer.get_current_result();
    assert!(settled.is_success());
    assert_eq!(settled.fetch_status, FetchStatus::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.unmount();
    online_manager().set_online(true);
}

#[tokio::test(start_paused = true)]
async fn network_mode_always_ignores_offline() {
    let _env = env_lock();
    online_manager().set_online(false);

    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counted_options(vec![json!("always")], Arc::clone(&calls), json!(7))
        .with_network_mode(NetworkMode::Always);

    let result = client.fetch_query(options).await.expect("fetches offline");
    assert_eq!(*result, json!(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    online_manager().set_online(true);
}

#[tokio::test(start_paused = true)]
async fn focus_refetches_stale_queries_per_policy() {
    let _env = env_lock();
    focus_manager().set_focused(Some(true));

    let client = QueryClient::new();
    client.mount();

    let eager_calls = Arc::new(AtomicUsize::new(0));
    let eager = QueryObserver::new(
        &client,
        QueryObserverOptions::new(counted_options(
            vec![json!("eager")],
            Arc::clone(&eager_calls),
            json!(1),
        ))
        .with_refetch_on_window_focus(Refetch::IfStale),
    );
    let _se = eager.subscribe(|_| {});

    let quiet_calls = Arc::new(AtomicUsize::new(0));
    let quiet = QueryObserver::new(
        &client,
        QueryObserverOptions::new(counted_options(
            vec![json!("quiet")],
            Arc::clone(&quiet_calls),
            json!(2),
        ))
        .with_refetch_on_window_focus(Refetch::Never),
    );
    let _sq = quiet.subscribe(|_| {});

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(eager_calls.load(Ordering::SeqCst), 1);
    assert_eq!(quiet_calls.load(Ordering::SeqCst), 1);

    focus_manager().set_focused(Some(false));
    focus_manager().set_focused(Some(true));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(eager_calls.load(Ordering::SeqCst), 2, "stale query refetched");
    assert_eq!(quiet_calls.load(Ordering::SeqCst), 1, "opted-out query untouched");

    client.unmount();
    focus_manager().set_focused(None);
}

#[tokio::test(start_paused = true)]
async fn scoped_mutations_run_serially_in_enqueue_order() {
    let _env = env_lock();

    let client = QueryClient::new();
    let completions = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let scoped_active = Arc::new(AtomicUsize::new(0));
    let max_scoped_active = Arc::new(AtomicUsize::new(0));

    let scoped = |id: &'static str| {
        let completions = Arc::clone(&completions);
        let active = Arc::clone(&scoped_active);
        let max_active = Arc::clone(&max_scoped_active);
        MutationOptions::new()
            .with_scope("x")
            .with_mutation_fn(move |_vars| {
                let completions = Arc::clone(&completions);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    completions.lock().unwrap().push(id);
                    Ok(json!(id))
                }
            })
    };
    let unscoped = {
        let completions = Arc::clone(&completions);
        MutationOptions::new().with_mutation_fn(move |_vars| {
            let completions = Arc::clone(&completions);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                completions.lock().unwrap().push("free");
                Ok(json!("free"))
            }
        })
    };

    let m1 = MutationObserver::new(&client, scoped("m1"));
    let m2 = MutationObserver::new(&client, scoped("m2"));
    let m3 = MutationObserver::new(&client, scoped("m3"));
    let mf = MutationObserver::new(&client, unscoped);

    let h1 = tokio::spawn(m1.mutate(json!(1), None));
    let h2 = tokio::spawn(m2.mutate(json!(2), None));
    let h3 = tokio::spawn(m3.mutate(json!(3), None));
    let hf = tokio::spawn(mf.mutate(json!(0), None));

    for handle in [h1, h2, h3, hf] {
        handle.await.expect("join").expect("mutation");
    }

    assert_eq!(max_scoped_active.load(Ordering::SeqCst), 1, "scope serialized");
    let order = completions.lock().unwrap().clone();
    let scoped_order: Vec<_> = order.iter().filter(|id| id.starts_with('m')).copied().collect();
    assert_eq!(scoped_order, ["m1", "m2", "m3"], "enqueue order preserved");
    let free_pos = order.iter().position(|id| *id == "free").expect("ran");
    let m2_pos = order.iter().position(|id| *id == "m2").expect("ran");
    assert!(free_pos < m2_pos, "unscoped mutation ran concurrently");
}

#[tokio::test(start_paused = true)]
async fn offline_mutation_pauses_and_resumes() {
    let _env = env_lock();
    online_manager().set_online(false);

    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = MutationOptions::new()
        .with_network_mode(NetworkMode::Online)
        .with_mutation_fn(move |vars| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok((*vars).clone())
            }
        });

    let observer = MutationObserver::new(&client, options);
    let handle = tokio::spawn(observer.mutate(json!({"save": 1}), None));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let paused = observer.get_current_result();
    assert!(paused.is_pending());
    assert!(paused.is_paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.is_mutating(), 1);

    online_manager().set_online(true);
    client.resume_paused_mutations().await;
    let result = handle.await.expect("join").expect("mutation");
    assert_eq!(*result, json!({"save": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(observer.get_current_result().is_success());

    online_manager().set_online(true);
}

#[tokio::test(start_paused = true)]
async fn mutation_callbacks_layer_in_order() {
    let _env = env_lock();

    let client = QueryClient::new();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let options = {
        let log = Arc::clone(&log);
        let success_log = Arc::clone(&log);
        let settled_log = Arc::clone(&log);
        MutationOptions::new()
            .with_mutation_fn(|vars| async move { Ok(json!({"echo": *vars})) })
            .with_on_mutate(move |_vars| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("mutate".into());
                    Ok(Some(json!({"optimistic": true})))
                }
            })
            .with_on_success(move |_data, _vars, context| {
                let log = Arc::clone(&success_log);
                let context = context.clone();
                async move {
                    let ctx = context.as_deref().cloned().unwrap_or(Value::Null);
                    log.lock().unwrap().push(format!("success:{ctx}"));
                    Ok(())
                }
            })
            .with_on_settled(move |_data, _error, _vars, _context| {
                let log = Arc::clone(&settled_log);
                async move {
                    log.lock().unwrap().push("settled".into());
                    Ok(())
                }
            })
    };

    let observer = MutationObserver::new(&client, options);
    let call_site_log = Arc::clone(&log);
    let callbacks = MutateCallbacks {
        on_success: Some(Arc::new(move |_data, _vars, _context| {
            call_site_log.lock().unwrap().push("call-site".into());
        })),
        ..MutateCallbacks::default()
    };

    let _listener = observer.subscribe(|_| {});
    let data = observer
        .mutate(json!(41), Some(callbacks))
        .await
        .expect("mutation");
    assert_eq!(*data, json!({"echo": 41}));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let seen = log.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "mutate".to_string(),
            format!("success:{}", json!({"optimistic": true})),
            "settled".to_string(),
            "call-site".to_string(),
        ],
    );

    let result = observer.get_current_result();
    assert!(result.is_success());
    assert_eq!(
        result.context.as_deref().cloned(),
        Some(json!({"optimistic": true})),
    );
}

#[tokio::test(start_paused = true)]
async fn mutation_retries_preserve_failure_count() {
    let _env = env_lock();

    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let options = MutationOptions::new()
        .with_retry(RetryPolicy::Count(3))
        .with_mutation_fn(move |_vars| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(json!("done"))
                }
            }
        });

    let observer = MutationObserver::new(&client, options);
    let data = observer.mutate(json!(1), None).await.expect("mutation");
    assert_eq!(*data, json!("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let result = observer.get_current_result();
    assert!(result.is_success());
    assert_eq!(result.failure_count, 2, "failures recorded along the way");
}

#[tokio::test(start_paused = true)]
async fn failed_mutation_runs_error_callbacks() {
    let _env = env_lock();

    let client = QueryClient::new();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let options = {
        let error_log = Arc::clone(&log);
        let settled_log = Arc::clone(&log);
        MutationOptions::new()
            .with_mutation_fn(|_vars| async move {
                Err::<Value, _>(anyhow::anyhow!("rejected"))
            })
            .with_on_error(move |error, _vars, _context| {
                let log = Arc::clone(&error_log);
                let message = error.to_string();
                async move {
                    log.lock().unwrap().push(format!("error:{message}"));
                    Ok(())
                }
            })
            .with_on_settled(move |_data, _error, _vars, _context| {
                let log = Arc::clone(&settled_log);
                async move {
                    log.lock().unwrap().push("settled".into());
                    Ok(())
                }
            })
    };

    let observer = MutationObserver::new(&client, options);
    let result = observer.mutate(json!(1), None).await;
    assert!(result.is_err());

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen, vec!["error:rejected".to_string(), "settled".to_string()]);

    let state = observer.get_current_result();
    assert!(state.is_error());
    assert_eq!(state.failure_count, 1);
}
