use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use leasevisor::store::{self, MemoryStore, Store, layout};
use leasevisor::tasks::{TaskDef, TaskInstance};
use leasevisor::{
    BackoffSource, Bus, Catalog, Event, EventKind, JobContext, JobFn, Status, TaskError, TaskMaster,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

async fn seed(store: &dyn Store, path: &str, inst: TaskInstance) {
    let def = TaskDef {
        code: inst.taskdef.clone(),
        ..TaskDef::default()
    };
    store::save(store, &layout::taskdef_key(&inst.taskdef), &def).await.unwrap();
    store::save(store, &layout::task_key(path), &inst).await.unwrap();
}

fn data(v: Value) -> leasevisor::tasks::VarMap {
    v.as_object().cloned().unwrap_or_default()
}

/// Collects `n` BackoffScheduled events as (delay_ms, source).
async fn backoffs(rx: &mut broadcast::Receiver<Event>, n: usize) -> Vec<(u32, BackoffSource)> {
    let mut out = Vec::new();
    while out.len() < n {
        let ev = rx.recv().await.unwrap();
        if ev.kind == EventKind::BackoffScheduled {
            out.push((ev.delay_ms.unwrap(), ev.backoff_source.unwrap()));
        }
    }
    out
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_and_resets_after_success() {
    let store = MemoryStore::shared();
    seed(
        store.as_ref(),
        "flaky",
        TaskInstance::new("flaky").with_data(data(json!({"retry": 1, "max-retry": 10, "restart": 1}))),
    )
    .await;

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut catalog = Catalog::new();
    catalog.register("flaky", "fails except on the sixth call", move || {
        let counter = Arc::clone(&counter);
        JobFn::arc(move |_ctx: JobContext| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 6 {
                    Ok::<_, TaskError>("fine".to_string())
                } else {
                    Err(TaskError::fail(format!("call {n}")))
                }
            }
        })
    });

    let bus = Bus::new(1024);
    let mut rx = bus.subscribe();
    let token = CancellationToken::new();
    let master = TaskMaster::new("flaky", store, Arc::new(catalog), bus);
    let h = tokio::spawn(master.run(token.clone()));

    let seen = backoffs(&mut rx, 7).await;
    token.cancel();
    assert_eq!(h.await.unwrap(), Err(TaskError::Canceled));

    use BackoffSource::{Failure, Success};
    assert_eq!(
        seen,
        vec![
            (1000, Failure),
            (1500, Failure),
            (2000, Failure),
            (2500, Failure),
            (3000, Failure),
            (1000, Success),
            (1000, Failure),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_saturates_at_max_retry() {
    let store = MemoryStore::shared();
    seed(
        store.as_ref(),
        "broken",
        TaskInstance::new("test/error").with_data(data(json!({"retry": 1, "max-retry": 10}))),
    )
    .await;

    let bus = Bus::new(1024);
    let mut rx = bus.subscribe();
    let token = CancellationToken::new();
    let master = TaskMaster::new("broken", store, Arc::new(Catalog::with_builtin()), bus);
    let h = tokio::spawn(master.run(token.clone()));

    let seen = backoffs(&mut rx, 22).await;
    token.cancel();
    assert_eq!(h.await.unwrap(), Err(TaskError::Canceled));

    let delays: Vec<u32> = seen.iter().map(|(d, _)| *d).collect();
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= 10_000));
    assert_eq!(delays[18..].to_vec(), vec![10_000; 4]);
}

#[tokio::test(start_paused = true)]
async fn missing_parent_is_not_retried() {
    let store = MemoryStore::shared();
    seed(
        store.as_ref(),
        "orphan",
        TaskInstance::new("test/sleep")
            .with_parent("gone")
            .with_data(data(json!({"delay": 1, "retry": 1}))),
    )
    .await;

    let starts = Arc::new(Mutex::new(0u32));
    let count = Arc::clone(&starts);
    let bus = Bus::new(64);
    let mut rx = bus.subscribe();
    let master = TaskMaster::new("orphan", store.clone(), Arc::new(Catalog::with_builtin()), bus)
        .with_callback(Arc::new(move |_: &str, s: &Status| {
            if *s == Status::Started {
                *count.lock().unwrap() += 1;
            }
        }));

    let err = master.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, TaskError::ParentGone { .. }));
    assert_eq!(*starts.lock().unwrap(), 1);

    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(ev.kind);
    }
    assert!(!kinds.contains(&EventKind::BackoffScheduled));
    assert_eq!(kinds.last(), Some(&EventKind::MasterDead));
    assert!(store.get(&layout::state_key("orphan", "state")).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn raised_ttl_reaches_the_running_task() {
    let store = MemoryStore::shared();
    store::save(store.as_ref(), layout::RUN_CONFIG, &data(json!({"ttl": 2}))).await.unwrap();
    seed(
        store.as_ref(),
        "stretch",
        TaskInstance::new("test/sleep").with_data(data(json!({"delay": 20}))),
    )
    .await;

    let bus = Bus::new(1024);
    let mut rx = bus.subscribe();
    let master = TaskMaster::new("stretch", store.clone(), Arc::new(Catalog::with_builtin()), bus);
    let h = tokio::spawn(master.run(CancellationToken::new()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    store::save(store.as_ref(), layout::RUN_CONFIG, &data(json!({"ttl": 10}))).await.unwrap();

    // With ttl=2 the task would time out inside this window.
    tokio::time::sleep(Duration::from_secs(1)).await;
    store.block_for(Duration::from_secs(3));

    assert!(h.await.unwrap().is_ok());
    let mut kinds = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        kinds.push(ev.kind);
    }
    assert!(!kinds.contains(&EventKind::TimeoutHit));
    assert!(!kinds.contains(&EventKind::TaskFailed));
    assert_eq!(kinds.last(), Some(&EventKind::MasterFinished));
}
