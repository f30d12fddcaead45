//! Channel registry implementation
//!
//! The process-wide entry point: routes client sockets to the worker that owns
//! their channel, aggregates per-worker statistics and drives the periodic
//! sweep.

use std::fmt::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::error::{ConfigError, Result};
use crate::runtime::{BroadcastReport, RuntimeError, RuntimeHandle, WorkerId};
use crate::session::ClientInfo;
use crate::stats::{self, Stats};

use super::channel::Channel;
use super::config::RegistryConfig;
use super::error::RegistryError;
use super::source::{ChannelKey, SourceParams};
use super::worker::{attach_local, run_ticker, shutdown_task, Attached, HubShared, HubWorker};

/// Counts delivered to the `done` callback of [`ChannelRegistry::enumerate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnumerateReport {
    /// Workers visited
    pub workers: usize,
    /// Channels visited
    pub channels: usize,
    /// Workers that were unreachable or whose visit failed
    pub errors: usize,
}

/// Directory of channels spread over the worker runtime
///
/// Holds no channel state itself: each worker keeps its own list in its
/// [`HubWorker`], and this handle only sends tasks and reads stats slots.
pub struct ChannelRegistry {
    handle: RuntimeHandle<HubWorker>,
    shared: Arc<HubShared>,
}

impl ChannelRegistry {
    /// Validate `config` and start the periodic sweep on worker 0
    pub fn create(handle: RuntimeHandle<HubWorker>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        if handle.workers() == 0 {
            return Err(ConfigError::NoWorkers.into());
        }

        let shared = Arc::new(HubShared::new(config, handle.workers()));

        let ticker_shared = Arc::clone(&shared);
        handle.send(0, move |cx| {
            let ticker = tokio::task::spawn_local(run_ticker(cx.clone(), ticker_shared));
            cx.state().borrow_mut().set_ticker(ticker.abort_handle());
        })?;

        tracing::info!(
            workers = handle.workers(),
            ring_size = shared.config.ring_size,
            precache = shared.config.precache,
            "Channel registry created"
        );

        Ok(Self { handle, shared })
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn workers(&self) -> usize {
        self.handle.workers()
    }

    /// Worker that owns (or will own) the channel for `key`
    pub fn worker_for(&self, key: &ChannelKey) -> WorkerId {
        key.worker(self.handle.workers())
    }

    /// Pre-rendered response header sent to stream consumers
    pub fn response_header(&self) -> Bytes {
        self.shared.header.clone()
    }

    /// Hand a client socket over to the worker owning its channel
    ///
    /// The socket must be in non-blocking mode. The channel is created on
    /// first use. The returned receiver resolves once the owning worker has
    /// either added the consumer or given up; on failure the client already
    /// got a best-effort 503.
    pub fn attach(
        &self,
        stream: TcpStream,
        params: SourceParams,
        info: ClientInfo,
    ) -> Result<oneshot::Receiver<Result<Attached>>> {
        if self.shared.is_closed() {
            return Err(RegistryError::Closed.into());
        }

        let worker = self.worker_for(&params.key());
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = oneshot::channel();

        self.handle
            .send(worker, move |cx| {
                let attach = attach_local(cx.clone(), shared, stream, params, info);
                tokio::task::spawn_local(async move {
                    let _ = tx.send(attach.await.map_err(Into::into));
                });
            })
            .map_err(|e| {
                tracing::warn!(worker = worker, error = %e, "Attach not delivered");
                RegistryError::WorkerUnavailable(worker)
            })?;

        Ok(rx)
    }

    /// Visit every channel, one worker at a time
    ///
    /// `visit` runs on the worker that owns the channel. `done` runs once,
    /// after the last worker, with the accumulator and the visit counts.
    pub fn enumerate<A, F, D>(&self, acc: A, visit: F, done: D)
    where
        A: Send + 'static,
        F: Fn(&mut A, WorkerId, &Channel) -> Result<()> + Send + Sync + 'static,
        D: FnOnce(A, EnumerateReport) + Send + 'static,
    {
        self.handle.broadcast_sequential(
            (acc, 0usize),
            move |cx, walk: &mut (A, usize)| {
                let (acc, channels) = walk;
                let state = cx.state().borrow();
                for channel in state.channels() {
                    visit(acc, cx.id(), channel)?;
                    *channels += 1;
                }
                Ok(())
            },
            move |(acc, channels), report| {
                done(
                    acc,
                    EnumerateReport {
                        workers: report.sent,
                        channels,
                        errors: report.errors,
                    },
                )
            },
        );
    }

    /// Per-channel diagnostics page
    pub async fn render_channels(&self) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        self.enumerate(
            BytesMut::new(),
            move |out, _worker, channel| {
                channel.describe(out, now)?;
                Ok(())
            },
            move |out, report| {
                let _ = tx.send((out, report));
            },
        );

        let (mut out, report) = rx.await.map_err(|_| RegistryError::Closed)?;
        writeln!(
            out,
            "\n{} channels on {} workers, {} errors",
            report.channels, report.workers, report.errors
        )?;
        Ok(out.freeze())
    }

    /// Latest snapshot published by each worker
    pub fn worker_stats(&self) -> Vec<Stats> {
        self.shared.slots.iter().map(|slot| slot.load()).collect()
    }

    /// Sum of every worker's snapshot
    pub fn stat_summary(&self) -> Stats {
        self.shared.slots.iter().map(|slot| slot.load()).sum()
    }

    pub fn uptime(&self) -> Duration {
        self.shared.started_at.elapsed()
    }

    /// Summary page: uptime plus per-worker and total counters
    pub fn render_summary(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        stats::render_summary(&mut out, self.uptime(), &self.worker_stats())?;
        Ok(out.freeze())
    }

    /// Whether [`destroy`](Self::destroy) was called
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop the sweep and destroy every channel on every worker
    ///
    /// Blocks until all workers ran the teardown. Must not be called from a
    /// worker thread. Calling it again is a no-op.
    pub fn destroy(&self) -> Result<BroadcastReport> {
        if self.handle.on_worker().is_some() {
            return Err(RuntimeError::WouldDeadlock.into());
        }
        if !self.shared.close() {
            return Ok(BroadcastReport::default());
        }

        let report = self
            .handle
            .broadcast_wait(shutdown_task(Arc::clone(&self.shared)))?;

        tracing::info!(
            workers = report.sent,
            errors = report.errors,
            "Channel registry destroyed"
        );
        Ok(report)
    }
}
