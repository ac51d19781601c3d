use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use leasevisor::reg::{Hooks, RegError, Subsystem};
use leasevisor::store::{MemoryStore, Store, layout};
use leasevisor::tasks::field;
use leasevisor::{
    Bus, EventKind, JobContext, JobFn, JobRef, RunState, RunStatus, Task, TaskError, TaskVars,
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn at_most_one_holder() {
    let store = MemoryStore::shared();
    let bus = Bus::new(256);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let job: JobRef = {
        let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
        JobFn::arc(move |ctx: JobContext| {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let res = ctx.sleep(Duration::from_secs(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                res.map(|()| "held".to_string())
            }
        })
    };

    let mut handles = Vec::new();
    for _ in 0..4 {
        let task = Task::new("shared", Arc::clone(&job), store.clone(), bus.clone());
        handles.push(tokio::spawn(task.run(CancellationToken::new())));
    }

    let mut ok = 0;
    let mut busy = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(TaskError::IsRunning { .. }) => busy += 1,
            Err(e) => panic!("unexpected {e}"),
        }
    }
    assert_eq!((ok, busy), (1, 3));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_stops_the_payload_within_the_ttl() {
    let store = MemoryStore::shared();
    let cancelled_at = Arc::new(Mutex::new(None));

    let seen = Arc::clone(&cancelled_at);
    let job: JobRef = JobFn::arc(move |ctx: JobContext| {
        let seen = Arc::clone(&seen);
        async move {
            ctx.token.cancelled().await;
            *seen.lock().await = Some(Instant::now());
            Err::<String, _>(TaskError::Canceled)
        }
    });
    let vars = TaskVars {
        ttl: 3,
        refresh: 10.0,
        ..TaskVars::default()
    };
    let task = Task::new("partitioned", job, store.clone(), Bus::new(64)).with_vars(vars);
    let h = tokio::spawn(task.run(CancellationToken::new()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let blocked = Instant::now();
    store.block_for(Duration::from_secs(4));

    let err = h.await.unwrap().unwrap_err();
    assert_eq!(err, TaskError::Timeout { ttl: Duration::from_secs(3) });

    let at = (*cancelled_at.lock().await).expect("payload saw the cancellation");
    assert!(at.duration_since(blocked) <= Duration::from_millis(3500));

    let rs = RunState::load(store.as_ref(), "partitioned").await.unwrap();
    assert_eq!(rs.state, Some(RunStatus::Fail));
    assert_eq!(rs.message.as_deref(), Some("Aborted by timeout"));
    assert_eq!(rs.running, None);
}

#[tokio::test(start_paused = true)]
async fn superseded_lease_is_left_to_its_new_owner() {
    let store = MemoryStore::shared();
    let job: JobRef = JobFn::arc(|ctx: JobContext| async move {
        ctx.sleep(Duration::from_secs(100)).await?;
        Ok::<_, TaskError>(String::new())
    });
    let vars = TaskVars {
        ttl: 3,
        ..TaskVars::default()
    };
    let task = Task::new("taken", job, store.clone(), Bus::new(64)).with_vars(vars);
    let h = tokio::spawn(task.run(CancellationToken::new()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let key = layout::state_key("taken", field::RUNNING);
    store.set(&key, Value::from("intruder"), None, None).await.unwrap();

    let err = h.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        TaskError::MarkGone {
            path: "taken".into(),
            reason: "superseded"
        }
    );
    let node = store.get(&key).await.unwrap().unwrap();
    assert_eq!(node.value, Value::from("intruder"));
    let rs = RunState::load(store.as_ref(), "taken").await.unwrap();
    assert_eq!(rs.message.as_deref(), Some("Run marker superseded"));
}

struct Valve {
    hooks: Hooks,
    closed: AtomicUsize,
}

impl Subsystem for Valve {
    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

#[tokio::test(start_paused = true)]
async fn teardown_runs_after_a_panic() {
    let mut hooks = Hooks::new("valve");
    hooks
        .register(
            "open",
            |_: Arc<Valve>, _: Value| async { Ok::<_, RegError>(()) },
            |v: Arc<Valve>, ()| async move {
                v.closed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();
    let valve = Arc::new(Valve {
        hooks,
        closed: AtomicUsize::new(0),
    });

    let store = MemoryStore::shared();
    let v = Arc::clone(&valve);
    let job: JobRef = JobFn::arc(move |ctx: JobContext| {
        let v = Arc::clone(&v);
        async move {
            let _open = ctx
                .reg
                .allocate(&v, "open", Value::Null)
                .await
                .map_err(|e| TaskError::from_error(&e))?;
            if ctx.path == "valve" {
                panic!("valve stuck");
            }
            Ok::<_, TaskError>(String::new())
        }
    });

    let err = Task::new("valve", job, store.clone(), Bus::new(64))
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Panicked { .. }));
    assert_eq!(valve.closed.load(Ordering::SeqCst), 1);

    let rs = RunState::load(store.as_ref(), "valve").await.unwrap();
    assert_eq!(rs.running, None);
    assert!(rs.stopped.is_some());
    assert_eq!(rs.status(), Some(RunStatus::Error));
}

#[tokio::test(start_paused = true)]
async fn lease_is_held_while_a_cancelled_payload_winds_down() {
    let store = MemoryStore::shared();
    let stage = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&stage);
    let job: JobRef = JobFn::arc(move |ctx: JobContext| {
        let seen = Arc::clone(&seen);
        async move {
            ctx.token.cancelled().await;
            seen.store(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(4)).await;
            seen.store(2, Ordering::SeqCst);
            Err::<String, _>(TaskError::Canceled)
        }
    });
    let vars = TaskVars {
        ttl: 2,
        ..TaskVars::default()
    };
    let token = CancellationToken::new();
    let first =
        Task::new("slow", Arc::clone(&job), store.clone(), Bus::new(64)).with_vars(vars.clone());
    let h = tokio::spawn(first.run(token.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(stage.load(Ordering::SeqCst), 1);

    let second = Task::new("slow", Arc::clone(&job), store.clone(), Bus::new(64))
        .with_vars(vars)
        .run(CancellationToken::new())
        .await;
    assert_eq!(second, Err(TaskError::IsRunning { path: "slow".into() }));

    assert_eq!(h.await.unwrap(), Err(TaskError::Canceled));
    assert_eq!(stage.load(Ordering::SeqCst), 2);
    let rs = RunState::load(store.as_ref(), "slow").await.unwrap();
    assert_eq!(rs.message.as_deref(), Some("Cancelled"));
    assert_eq!(rs.running, None);
}

#[tokio::test(start_paused = true)]
async fn marker_deleted_during_wind_down_aborts_the_payload() {
    let store = MemoryStore::shared();
    let job: JobRef = JobFn::arc(|_ctx: JobContext| async move {
        tokio::time::sleep(Duration::from_secs(100)).await;
        Ok::<_, TaskError>(String::new())
    });
    let vars = TaskVars {
        ttl: 2,
        ..TaskVars::default()
    };
    let token = CancellationToken::new();
    let task = Task::new("deaf", job, store.clone(), Bus::new(64))
        .with_vars(vars)
        .with_cancel_grace(Duration::from_secs(30));
    let start = Instant::now();
    let h = tokio::spawn(task.run(token.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();
    tokio::time::sleep(Duration::from_secs(1)).await;
    store.delete(&layout::state_key("deaf", field::RUNNING), None).await.unwrap();

    assert_eq!(h.await.unwrap(), Err(TaskError::Canceled));
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn deadline_counts_from_when_the_refresh_was_sent() {
    let store = MemoryStore::shared();
    let bus = Bus::new(64);
    let mut rx = bus.subscribe();
    let job: JobRef = JobFn::arc(|ctx: JobContext| async move {
        ctx.sleep(Duration::from_secs(100)).await?;
        Ok::<_, TaskError>(String::new())
    });
    // Refresh every 3s / 1.1, about 2.73s.
    let vars = TaskVars {
        ttl: 3,
        refresh: 1.0,
        ..TaskVars::default()
    };
    let start = Instant::now();
    let task = Task::new("slow-ack", job, store.clone(), bus).with_vars(vars);
    let h = tokio::spawn(task.run(CancellationToken::new()));

    // The first refresh is sent at ~2.73s and acknowledged at 2.9s.
    tokio::time::sleep_until(start + Duration::from_millis(2600)).await;
    store.set_reachable(false);
    tokio::time::sleep_until(start + Duration::from_millis(2900)).await;
    store.set_reachable(true);

    // The second refresh (~5.63s) never gets through.
    tokio::time::sleep_until(start + Duration::from_millis(5600)).await;
    store.set_reachable(false);
    loop {
        let ev = rx.recv().await.unwrap();
        if ev.kind == EventKind::TimeoutHit {
            break;
        }
    }
    let hit = start.elapsed();
    assert!(hit >= Duration::from_millis(5700), "{hit:?}");
    assert!(hit < Duration::from_millis(5800), "{hit:?}");

    store.set_reachable(true);
    assert_eq!(h.await.unwrap(), Err(TaskError::Timeout { ttl: Duration::from_secs(3) }));
}
