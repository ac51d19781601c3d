//! # Per-execution resource registry.
//!
//! Everything a payload acquires from a [`Subsystem`] during one task run is
//! tracked by a [`Reg`] and released exactly once: explicitly through
//! [`Reg::release`], or by [`Reg::free`] at task teardown.
//!
//! ## Rules
//! - A registration holds its subsystem **weakly** by default; if the
//!   subsystem is gone by release time, the release function is not called.
//!   Hooks registered with `register_strong` keep the subsystem alive instead.
//! - Releasing a handle whose record was already released (e.g. after `free`)
//!   logs a warning and returns [`Release::AlreadyReleased`].
//! - `free` releases every remaining record, logs individual failures and
//!   leaves the registry empty.
//! - [`Reg::spawn`] binds a background tokio task; it is aborted on release.
//!
//! ```text
//! payload ──► reg.allocate(bus, "open", args) ──► RegHandle
//!                 │                                   │
//!                 └─ records {subsystem (weak), hook, resource, release}
//!                                                     ▼
//! teardown ──► reg.free() ──► release(subsystem, resource) for each record
//! ```

mod hooks;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use hooks::{AnyObject, Hook, Hooks, Resource, Subsystem};
use hooks::ReleaseFn;

/// Errors of the resource registry.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegError {
    /// A hook of this name exists on the subsystem or one of its parents.
    #[error("hook {hook:?} already registered by {subsystem}")]
    Duplicate {
        /// Hook name.
        hook: String,
        /// Table that already defines it.
        subsystem: String,
    },

    /// The subsystem has no such hook.
    #[error("no hook {hook:?} on {subsystem}")]
    NoHook {
        /// Hook name.
        hook: String,
        /// Subsystem name.
        subsystem: String,
    },

    /// The hook was registered for a different subsystem type.
    #[error("hook {hook:?} does not apply to this subsystem")]
    WrongSubsystem {
        /// Hook name.
        hook: String,
    },

    /// The allocator or release function failed.
    #[error("{hook}: {reason}")]
    Hook {
        /// Hook name.
        hook: String,
        /// Failure detail.
        reason: String,
    },
}

impl RegError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RegError::Duplicate { .. } => "reg_duplicate",
            RegError::NoHook { .. } => "reg_no_hook",
            RegError::WrongSubsystem { .. } => "reg_wrong_subsystem",
            RegError::Hook { .. } => "reg_hook",
        }
    }
}

/// Outcome of releasing a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The release function ran.
    Freed,
    /// The subsystem no longer exists; nothing to release.
    Gone,
    /// The record had already been released.
    AlreadyReleased,
}

/// Owned handle to one registration.
#[must_use = "dropping the handle leaves the resource to Reg::free"]
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RegHandle {
    id: u64,
}

enum Holder {
    Weak(Weak<dyn std::any::Any + Send + Sync>),
    Strong(AnyObject),
}

impl Holder {
    fn is_dead(&self) -> bool {
        matches!(self, Holder::Weak(w) if w.strong_count() == 0)
    }

    fn get(&self) -> Option<AnyObject> {
        match self {
            Holder::Weak(w) => w.upgrade(),
            Holder::Strong(s) => Some(Arc::clone(s)),
        }
    }
}

/// One tracked registration.
struct RegObj {
    subsystem: String,
    hook: String,
    object: Holder,
    resource: Resource,
    release: ReleaseFn,
}

impl RegObj {
    async fn release(self) -> Result<Release, RegError> {
        let Some(obj) = self.object.get() else {
            debug!(subsystem = %self.subsystem, hook = %self.hook, "subsystem gone, skip release");
            return Ok(Release::Gone);
        };
        (self.release)(obj, self.resource).await?;
        Ok(Release::Freed)
    }
}

#[derive(Default)]
struct Inner {
    next: u64,
    objs: HashMap<u64, RegObj>,
}

/// Registry of resources acquired during one task execution.
///
/// Cheap to clone; clones share the same records.
#[derive(Clone, Default)]
pub struct Reg {
    inner: Arc<Mutex<Inner>>,
}

impl Reg {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls `hook`'s allocator on `subsystem` and tracks the result.
    pub async fn allocate<S: Subsystem>(
        &self,
        subsystem: &Arc<S>,
        hook: &str,
        args: Value,
    ) -> Result<RegHandle, RegError> {
        let hooks = subsystem.hooks();
        let found = hooks.find(hook).cloned().ok_or_else(|| RegError::NoHook {
            hook: hook.to_string(),
            subsystem: hooks.name().to_string(),
        })?;

        let obj: AnyObject = subsystem.clone();
        let resource = (found.alloc)(Arc::clone(&obj), args).await?;
        let object = if found.strong {
            Holder::Strong(obj)
        } else {
            Holder::Weak(Arc::downgrade(&obj))
        };

        Ok(self
            .track(RegObj {
                subsystem: hooks.name().to_string(),
                hook: hook.to_string(),
                object,
                resource,
                release: found.release,
            })
            .await)
    }

    /// Spawns `fut` as a background task owned by this registry.
    pub async fn spawn<F>(&self, name: &str, fut: F) -> RegHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let join: JoinHandle<()> = tokio::spawn(fut);
        let release: ReleaseFn = Arc::new(
            |_: AnyObject, res: Resource| -> BoxFuture<'static, Result<(), RegError>> {
                if let Ok(join) = res.downcast::<JoinHandle<()>>() {
                    join.abort();
                }
                Box::pin(std::future::ready(Ok(())))
            },
        );
        self.track(RegObj {
            subsystem: "task".to_string(),
            hook: name.to_string(),
            object: Holder::Strong(Arc::new(())),
            resource: Box::new(join),
            release,
        })
        .await
    }

    /// Releases one registration.
    pub async fn release(&self, handle: RegHandle) -> Result<Release, RegError> {
        let obj = self.inner.lock().await.objs.remove(&handle.id);
        match obj {
            Some(obj) => obj.release().await,
            None => {
                warn!(id = handle.id, "released twice");
                Ok(Release::AlreadyReleased)
            }
        }
    }

    /// Releases every remaining registration; returns how many release functions ran.
    pub async fn free(&self) -> usize {
        let objs: Vec<RegObj> = {
            let mut inner = self.inner.lock().await;
            let mut objs: Vec<(u64, RegObj)> = inner.objs.drain().collect();
            // newest first
            objs.sort_unstable_by(|a, b| b.0.cmp(&a.0));
            objs.into_iter().map(|(_, o)| o).collect()
        };

        let mut freed = 0;
        for obj in objs {
            let (subsystem, hook) = (obj.subsystem.clone(), obj.hook.clone());
            match obj.release().await {
                Ok(Release::Freed) => freed += 1,
                Ok(_) => {}
                Err(e) => warn!(%subsystem, %hook, error = %e, "release failed"),
            }
        }
        freed
    }

    /// Number of tracked registrations.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.objs.len()
    }

    /// True if nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Records `obj`, dropping records whose subsystem no longer exists.
    async fn track(&self, obj: RegObj) -> RegHandle {
        let mut inner = self.inner.lock().await;
        inner.objs.retain(|id, o| {
            let dead = o.object.is_dead();
            if dead {
                debug!(id, subsystem = %o.subsystem, hook = %o.hook, "subsystem gone, record dropped");
            }
            !dead
        });
        inner.next += 1;
        let id = inner.next;
        inner.objs.insert(id, obj);
        RegHandle { id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Port {
        hooks: Hooks,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Subsystem for Port {
        fn hooks(&self) -> &Hooks {
            &self.hooks
        }
    }

    fn port(strong: bool) -> Arc<Port> {
        let mut hooks = Hooks::new("port");
        let open = |p: Arc<Port>, _args: Value| async move {
            Ok::<_, RegError>(p.opened.fetch_add(1, Ordering::SeqCst))
        };
        let close = |p: Arc<Port>, _n: usize| async move {
            p.closed.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RegError>(())
        };
        if strong {
            hooks.register_strong("open", open, close).unwrap();
        } else {
            hooks.register("open", open, close).unwrap();
        }
        hooks
            .register(
                "broken",
                |_: Arc<Port>, _| async { Ok(()) },
                |_: Arc<Port>, ()| async {
                    Err(RegError::Hook { hook: "broken".into(), reason: "stuck".into() })
                },
            )
            .unwrap();
        Arc::new(Port { hooks, opened: AtomicUsize::new(0), closed: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn release_runs_exactly_once() {
        let p = port(false);
        let reg = Reg::new();
        let h = reg.allocate(&p, "open", Value::Null).await.unwrap();
        let h2 = reg.allocate(&p, "open", Value::Null).await.unwrap();

        assert_eq!(reg.release(h).await.unwrap(), Release::Freed);
        assert_eq!(reg.free().await, 1);
        assert_eq!(p.closed.load(Ordering::SeqCst), 2);
        assert!(reg.is_empty().await);

        assert_eq!(reg.release(h2).await.unwrap(), Release::AlreadyReleased);
        assert_eq!(p.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gone_subsystem_is_not_released() {
        let p = port(false);
        let reg = Reg::new();
        let h = reg.allocate(&p, "open", Value::Null).await.unwrap();
        drop(p);
        assert_eq!(reg.release(h).await.unwrap(), Release::Gone);
    }

    #[tokio::test]
    async fn records_of_gone_subsystems_are_pruned() {
        let reg = Reg::new();
        let kept = port(false);
        let _k = reg.allocate(&kept, "open", Value::Null).await.unwrap();
        for _ in 0..3 {
            let short = port(false);
            let _h = reg.allocate(&short, "open", Value::Null).await.unwrap();
        }
        assert_eq!(reg.len().await, 2);

        let _again = reg.allocate(&kept, "open", Value::Null).await.unwrap();
        assert_eq!(reg.len().await, 2);
        assert_eq!(reg.free().await, 2);
        assert_eq!(kept.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn strong_hooks_keep_the_subsystem() {
        let p = port(true);
        let weak = Arc::downgrade(&p);
        let reg = Reg::new();
        let _h = reg.allocate(&p, "open", Value::Null).await.unwrap();
        drop(p);
        assert!(weak.upgrade().is_some());
        assert_eq!(reg.free().await, 1);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn free_survives_failing_release() {
        let p = port(false);
        let reg = Reg::new();
        let _a = reg.allocate(&p, "broken", Value::Null).await.unwrap();
        let _b = reg.allocate(&p, "open", Value::Null).await.unwrap();
        assert_eq!(reg.free().await, 1);
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_hook_is_an_error() {
        let p = port(false);
        let err = Reg::new().allocate(&p, "nope", Value::Null).await.unwrap_err();
        assert_eq!(err.as_label(), "reg_no_hook");
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_tasks_are_aborted_on_free() {
        let reg = Reg::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _t = reg
            .spawn("ticker", async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    h.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(reg.free().await, 1);
        let seen = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }
}
