//! # Allocate/release hook tables.
//!
//! A subsystem (a device bus, a connection pool, ...) publishes named hooks:
//! an allocator that produces a resource and the release function that undoes
//! it. Tables chain to a parent table so derived subsystems inherit hooks; a
//! name may appear only once along the chain.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::RegError;

/// Type-erased subsystem object.
pub type AnyObject = Arc<dyn Any + Send + Sync>;

/// A resource produced by an allocator.
pub type Resource = Box<dyn Any + Send>;

pub(crate) type AllocFn =
    Arc<dyn Fn(AnyObject, Value) -> BoxFuture<'static, Result<Resource, RegError>> + Send + Sync>;
pub(crate) type ReleaseFn =
    Arc<dyn Fn(AnyObject, Resource) -> BoxFuture<'static, Result<(), RegError>> + Send + Sync>;

/// An allocate/release pair.
#[derive(Clone)]
pub struct Hook {
    pub(crate) alloc: AllocFn,
    pub(crate) release: ReleaseFn,
    pub(crate) strong: bool,
}

/// Something resources can be allocated from.
pub trait Subsystem: Send + Sync + 'static {
    /// The hook table of this subsystem.
    fn hooks(&self) -> &Hooks;
}

/// Named hooks of one subsystem, optionally inheriting from a parent table.
pub struct Hooks {
    name: String,
    parent: Option<Arc<Hooks>>,
    table: HashMap<String, Hook>,
}

impl Hooks {
    /// Empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            table: HashMap::new(),
        }
    }

    /// Empty table inheriting every hook of `parent`.
    pub fn inherit(name: impl Into<String>, parent: Arc<Hooks>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(name)
        }
    }

    /// Subsystem name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a hook whose registrations hold the subsystem weakly.
    ///
    /// `alloc` receives the subsystem and the call arguments; `release` receives
    /// the subsystem and the allocated resource. Fails if `hook` is already
    /// defined here or on a parent table.
    pub fn register<S, R, A, AF, F, FF>(
        &mut self,
        hook: &str,
        alloc: A,
        release: F,
    ) -> Result<&mut Self, RegError>
    where
        S: Send + Sync + 'static,
        R: Send + 'static,
        A: Fn(Arc<S>, Value) -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<R, RegError>> + Send + 'static,
        F: Fn(Arc<S>, R) -> FF + Send + Sync + 'static,
        FF: Future<Output = Result<(), RegError>> + Send + 'static,
    {
        self.insert(hook, alloc, release, false)
    }

    /// Like [`register`](Self::register), but registrations keep the subsystem alive.
    pub fn register_strong<S, R, A, AF, F, FF>(
        &mut self,
        hook: &str,
        alloc: A,
        release: F,
    ) -> Result<&mut Self, RegError>
    where
        S: Send + Sync + 'static,
        R: Send + 'static,
        A: Fn(Arc<S>, Value) -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<R, RegError>> + Send + 'static,
        F: Fn(Arc<S>, R) -> FF + Send + Sync + 'static,
        FF: Future<Output = Result<(), RegError>> + Send + 'static,
    {
        self.insert(hook, alloc, release, true)
    }

    fn insert<S, R, A, AF, F, FF>(
        &mut self,
        hook: &str,
        alloc_fn: A,
        release_fn: F,
        strong: bool,
    ) -> Result<&mut Self, RegError>
    where
        S: Send + Sync + 'static,
        R: Send + 'static,
        A: Fn(Arc<S>, Value) -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<R, RegError>> + Send + 'static,
        F: Fn(Arc<S>, R) -> FF + Send + Sync + 'static,
        FF: Future<Output = Result<(), RegError>> + Send + 'static,
    {
        if let Some(owner) = self.owner_of(hook) {
            return Err(RegError::Duplicate {
                hook: hook.to_string(),
                subsystem: owner.to_string(),
            });
        }

        let name = hook.to_string();
        let alloc: AllocFn = Arc::new(
            move |obj: AnyObject, args: Value| -> BoxFuture<'static, Result<Resource, RegError>> {
                match obj.downcast::<S>() {
                    Ok(obj) => {
                        let fut = alloc_fn(obj, args);
                        Box::pin(async move { fut.await.map(|r| Box::new(r) as Resource) })
                    }
                    Err(_) => Box::pin(std::future::ready(Err(RegError::WrongSubsystem {
                        hook: name.clone(),
                    }))),
                }
            },
        );

        let name = hook.to_string();
        let release: ReleaseFn = Arc::new(
            move |obj: AnyObject, res: Resource| -> BoxFuture<'static, Result<(), RegError>> {
                match (obj.downcast::<S>(), res.downcast::<R>()) {
                    (Ok(obj), Ok(res)) => Box::pin(release_fn(obj, *res)),
                    _ => Box::pin(std::future::ready(Err(RegError::WrongSubsystem {
                        hook: name.clone(),
                    }))),
                }
            },
        );

        self.table.insert(
            hook.to_string(),
            Hook {
                alloc,
                release,
                strong,
            },
        );
        Ok(self)
    }

    /// Finds `hook` here or along the parent chain.
    pub fn find(&self, hook: &str) -> Option<&Hook> {
        self.table
            .get(hook)
            .or_else(|| self.parent.as_deref().and_then(|p| p.find(hook)))
    }

    fn owner_of(&self, hook: &str) -> Option<&str> {
        if self.table.contains_key(hook) {
            return Some(&self.name);
        }
        self.parent.as_deref().and_then(|p| p.owner_of(hook))
    }
}
