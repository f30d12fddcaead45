//! Worker runtime
//!
//! A fixed pool of single-threaded event loops. Every piece of channel state
//! is pinned to one worker for its whole life; other threads interact with it
//! only by posting tasks.
//!
//! # Architecture
//!
//! ```text
//!   HTTP accept loop / main            RuntimeHandle (Send + Sync)
//!            │                                  │
//!            │  send(worker, task)              │ broadcast / broadcast_wait
//!            ▼                                  ▼ broadcast_sequential
//!   ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐
//!   │ worker 0        │  │ worker 1        │  │ worker N-1      │
//!   │ mailbox ──► run │  │ mailbox ──► run │  │ mailbox ──► run │
//!   │ LocalSet tasks  │  │ LocalSet tasks  │  │ LocalSet tasks  │
//!   │ Rc<RefCell<S>>  │  │ Rc<RefCell<S>>  │  │ Rc<RefCell<S>>  │
//!   └─────────────────┘  └─────────────────┘  └─────────────────┘
//! ```
//!
//! Readiness registration and timers come from the worker's tokio
//! current-thread runtime: tasks may call `tokio::task::spawn_local`,
//! `tokio::time::interval` and the non-blocking socket methods directly.

pub mod worker;

use std::fmt;
use std::io;

pub use worker::{
    current_worker, BroadcastReport, Delivery, RuntimeHandle, SharedTask, Task, WorkerCx,
    WorkerId, WorkerRuntime,
};

/// Error type for runtime operations
#[derive(Debug)]
pub enum RuntimeError {
    /// Worker index out of range
    NoSuchWorker(WorkerId),
    /// Worker has stopped processing its mailbox
    WorkerNotRunning(WorkerId),
    /// Synchronous broadcast requested from a worker thread
    WouldDeadlock,
    /// Runtime started with zero workers
    NoWorkers,
    /// Worker thread or its event loop could not be created
    Spawn(io::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NoSuchWorker(id) => write!(f, "No such worker: {}", id),
            RuntimeError::WorkerNotRunning(id) => write!(f, "Worker {} is not running", id),
            RuntimeError::WouldDeadlock => {
                write!(f, "Synchronous broadcast from a worker thread would deadlock")
            }
            RuntimeError::NoWorkers => write!(f, "Runtime needs at least one worker"),
            RuntimeError::Spawn(e) => write!(f, "Failed to start worker: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}
