//! # leasevisor
//!
//! **Leasevisor** runs declarative tasks stored in a shared coordination
//! store as supervised, mutually exclusive, restartable units of work across
//! any number of processes, without a central scheduler.
//!
//! Mutual exclusion rests on a single TTL lease per task instance. A holder
//! refreshes it with compare-and-swap; whoever cannot refresh in time stops.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   meta/task/<def>/:taskdef     task/<path>/:task      config/run
//!             │                        │                     │
//!             └──────────────┬─────────┴─────────────────────┘
//!                            ▼ (watch + scan)
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Runner                                                           │
//! │  - Bus (broadcast events)                                         │
//! │  - AliveTracker (which paths hold a lease)                        │
//! │  - SubscriberSet (fans out to user subscribers)                   │
//! │  - Registry (one TaskMaster per instance path)                    │
//! └──────┬──────────────────┬──────────────────┬──────────────────────┘
//!        ▼                  ▼                  ▼
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │  TaskMaster  │   │  TaskMaster  │   │  TaskMaster  │
//!     │(restart loop)│   │(restart loop)│   │(restart loop)│
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            ▼                  ▼                  ▼
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │     Task     │   │     Task     │   │     Task     │
//!     │ lease + job  │   │ lease + job  │   │ CollectorJob │──► writes task/…
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//!       status/run/<path>/:task/{running,started,stopped,state,message,…}
//! ```
//!
//! ### Lifecycle of one execution
//! ```text
//! TaskMaster ──► Task::run()
//!   ├─► parents present?            no ─► ParentGone (fatal)
//!   ├─► create `running` (TTL)      exists ─► IsRunning (retried with backoff)
//!   ├─► select! { payload | heartbeat (CAS refresh) | deadline | parent gone | cancel }
//!   ├─► record state / message / debug
//!   └─► teardown: Reg::free, `stopped`, CAS-delete `running`
//! ```
//!
//! ## Features
//! | Area              | Description                                                | Key types / traits                        |
//! |-------------------|------------------------------------------------------------|-------------------------------------------|
//! | **Store**         | Contract of the coordination store, in-memory backend.     | [`store::Store`], [`store::MemoryStore`]  |
//! | **Jobs**          | Payloads resolved from a definition's `code`.              | [`Job`], [`JobFn`], [`Catalog`]           |
//! | **Supervision**   | Lease-guarded executions, restarts, tree following.        | [`Task`], [`TaskMaster`], [`Runner`]      |
//! | **Collectors**    | Keep part of the job tree in sync with a source.           | [`collect::Collector`], [`CollectorJob`]  |
//! | **Resources**     | Exactly-once release of what a job acquired.               | [`reg::Reg`]                              |
//! | **Policies**      | Backoff growth and jitter.                                 | [`BackoffPolicy`], [`Growth`]             |
//! | **Subscriber API**| Hook into lifecycle events.                                | [`Subscribe`], [`LogWriter`]              |
//! | **Errors**        | Typed errors with stable labels.                           | [`TaskError`], [`RuntimeError`]           |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use leasevisor::{Catalog, JobContext, JobFn, TaskError, TaskMaster, Bus};
//! use leasevisor::store::{self, MemoryStore, layout};
//! use leasevisor::tasks::TaskInstance;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut catalog = Catalog::new();
//!     catalog.register("hello", "Greets", || {
//!         JobFn::arc(|ctx: JobContext| async move { Ok::<_, TaskError>(format!("hello {}", ctx.path)) })
//!     });
//!
//!     let st = MemoryStore::shared();
//!     catalog.publish(st.as_ref()).await?;
//!     store::save(st.as_ref(), &layout::task_key("greeter"), &TaskInstance::new("hello")).await?;
//!
//!     let master = TaskMaster::new("greeter", st.clone(), Arc::new(catalog), Bus::new(64));
//!     let msg = master.run(CancellationToken::new()).await?;
//!     assert_eq!(msg, "hello greeter");
//!     Ok(())
//! }
//! ```

pub mod collect;
mod core;
mod error;
mod events;
mod policies;
pub mod reg;
pub mod store;
mod subscribers;
pub mod tasks;

// ---- Public re-exports ----

pub use collect::CollectorJob;
pub use core::{AliveTracker, Config, Phase, Runner, Status, StatusFn, Task, TaskMaster, Trigger};
pub use error::{ConfigError, RuntimeError, TaskError};
pub use events::{BackoffSource, Bus, Event, EventKind};
pub use policies::{BackoffPolicy, Growth, JitterPolicy};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use tasks::{Catalog, Job, JobContext, JobFn, JobRef, RunState, RunStatus, TaskVars};
