//! Taskfleet - per-worker reconciliation for a distributed task fleet
//!
//! A central scheduling plane assigns durable tasks to worker processes;
//! this crate is the engine each worker runs to converge what it is
//! *actually* running toward what it is *supposed* to run. The key
//! components are:
//!
//! ## Reconciliation core
//!
//! - [`Informer`]: orchestrator that diffs want against real on every trigger
//!   and feeds the change queue; writes observed transitions back
//! - [`Indexer`]: cache of real execution status, fed by snapshots and the
//!   executor change stream
//! - [`ChangeQueue`]: per-key deduplicating work queue with in-flight
//!   tracking and drain shutdown
//! - [`ChangeConsumer`]: what the dispatch side pulls changes from
//!
//! ## Collaborators
//!
//! - [`Recorder`]: durable desired-state repository (scheduling plane side)
//! - [`ExecutorLoader`] / [`Executor`]: the runtime that owns task processes
//! - [`in_memory`]: map-backed implementations for tests and local runs
//!
//! ## Assembly
//!
//! - [`Worker`]: informer plus the dispatch loop applying changes through
//!   an executor

pub mod config;
pub mod consumer;
pub mod differ;
pub mod executor;
pub mod in_memory;
pub mod indexer;
pub mod informer;
pub mod loader;
pub mod queue;
pub mod recorder;
pub mod retry;
pub mod task;
pub mod trigger;
pub mod worker;

pub use config::{InformerConfig, WorkerConfig};
pub use consumer::ChangeConsumer;
pub use differ::{diff, TaskPair};
pub use executor::Executor;
pub use in_memory::{InMemoryExecutor, InMemoryRecorder};
pub use indexer::{Indexer, StatusSink};
pub use informer::{Informer, InformerError};
pub use loader::ExecutorLoader;
pub use queue::{ChangeQueue, DedupQueue, Keyed};
pub use recorder::Recorder;
pub use retry::{retry, BackoffConfig, RetryPolicy};
pub use task::{
    change_type, Change, ChangeType, Task, TaskExecResult, TaskStatus, UnknownTransition,
};
pub use trigger::{Trigger, TriggerInfo};
pub use worker::Worker;
