//! Per-worker registry state
//!
//! Every worker owns one [`HubWorker`]: the channels pinned to it plus the
//! tick counter. Settings shared by all workers travel inside the tasks as
//! `Arc<HubShared>`.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::runtime::{SharedTask, WorkerCx, WorkerId};
use crate::session::{socket, ClientInfo, Consumer, SendPolicy, SERVICE_UNAVAILABLE};
use crate::stats::{Stats, WorkerSlot};

use super::channel::{Channel, ChannelId};
use super::config::RegistryConfig;
use super::error::RegistryError;
use super::lifecycle::{Teardown, Verdict};
use super::source::{ChannelKey, SourceParams};

/// Read-only settings and cross-thread slots shared by every worker
#[derive(Debug)]
pub struct HubShared {
    pub(crate) config: RegistryConfig,
    pub(crate) policy: SendPolicy,
    /// Pre-rendered 200 response header
    pub(crate) header: Bytes,
    pub(crate) slots: Vec<WorkerSlot>,
    pub(crate) started_at: Instant,
    closed: AtomicBool,
}

impl HubShared {
    pub(crate) fn new(config: RegistryConfig, workers: usize) -> Self {
        Self {
            policy: SendPolicy::from(&config),
            header: config.response_header(),
            slots: (0..workers).map(|_| WorkerSlot::default()).collect(),
            started_at: Instant::now(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the registry closed; false if it already was
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn publish(&self, worker: WorkerId, stats: &Stats) {
        if let Some(slot) = self.slots.get(worker) {
            slot.publish(stats);
        }
    }
}

/// Result of a successful attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub key: ChannelKey,
    /// Worker that owns the channel
    pub worker: WorkerId,
    /// The channel was created by this attach
    pub created: bool,
    /// Consumers on the channel after the attach
    pub clients: usize,
}

/// Channels owned by one worker
#[derive(Debug, Default)]
pub struct HubWorker {
    channels: Vec<Channel>,
    next_id: ChannelId,
    ticks: u64,
    ticker: Option<AbortHandle>,
}

impl HubWorker {
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Counters for this worker's slot
    pub fn stats(&self) -> Stats {
        self.channels
            .iter()
            .map(|c| Stats {
                channels: 1,
                clients: c.client_count(),
                rate_in: c.rate_in(),
                rate_out: c.rate_out(),
            })
            .sum()
    }

    pub(crate) fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id() == id)
    }

    /// Find the channel for `params`, opening it if absent
    pub(crate) fn resolve_or_create(
        &mut self,
        cx: &WorkerCx<HubWorker>,
        shared: &Arc<HubShared>,
        params: SourceParams,
    ) -> Result<(ChannelId, bool), RegistryError> {
        let key = params.key();
        if let Some(channel) = self.channels.iter().find(|c| c.key() == &key) {
            return Ok((channel.id(), false));
        }

        let id = self.next_id;
        self.next_id += 1;

        let mut channel = Channel::open(id, cx.id(), params, &shared.config)?;
        let task = tokio::task::spawn_local(run_ingest(
            cx.clone(),
            Arc::clone(shared),
            id,
            channel.socket(),
        ));
        channel.set_ingest_task(task.abort_handle());

        tracing::info!(channel = %key, worker = cx.id(), "Channel created");
        self.channels.push(channel);
        Ok((id, true))
    }

    /// Remove and tear down one channel
    pub(crate) fn destroy_channel(&mut self, id: ChannelId, reason: Teardown) -> bool {
        match self.channels.iter().position(|c| c.id() == id) {
            Some(pos) => {
                self.channels.remove(pos).close(reason);
                true
            }
            None => false,
        }
    }

    /// Tear down every channel on this worker
    pub(crate) fn destroy_all(&mut self, reason: Teardown) -> usize {
        let count = self.channels.len();
        for channel in self.channels.drain(..) {
            channel.close(reason);
        }
        count
    }

    /// One sweep: rates, lifecycle, rejoin
    pub(crate) fn tick(&mut self, now: Instant, shared: &HubShared) -> Stats {
        self.ticks += 1;
        let tick = self.ticks;
        let timeout = shared.config.receive_timeout;

        let doomed: Vec<(ChannelId, Teardown)> = self
            .channels
            .iter_mut()
            .filter_map(|c| match c.tick(now, tick, timeout) {
                Verdict::Destroy(reason) => Some((c.id(), reason)),
                Verdict::Keep { .. } => None,
            })
            .collect();

        for (id, reason) in doomed {
            self.destroy_channel(id, reason);
        }

        self.stats()
    }

    pub(crate) fn set_ticker(&mut self, ticker: AbortHandle) {
        if let Some(old) = self.ticker.replace(ticker) {
            old.abort();
        }
    }

    pub(crate) fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// Attach a client socket on the worker that owns its channel
///
/// The adopted socket has no readiness until the reactor has seen it, and
/// `try_write` fails with `WouldBlock` before that. Waiting for writability
/// first lets the 503 or the opportunistic header pass go out right away.
pub(crate) async fn attach_local(
    cx: WorkerCx<HubWorker>,
    shared: Arc<HubShared>,
    stream: std::net::TcpStream,
    mut params: SourceParams,
    info: ClientInfo,
) -> Result<Attached, RegistryError> {
    let stream = TcpStream::from_std(stream).map_err(RegistryError::Socket)?;
    stream.writable().await.map_err(RegistryError::Socket)?;

    if shared.is_closed() {
        let _ = stream.try_write(SERVICE_UNAVAILABLE);
        return Err(RegistryError::Closed);
    }
    if params.rejoin_interval.is_zero() {
        params.rejoin_interval = shared.config.rejoin_interval;
    }

    // No await from here on: lookup and insert happen in one step
    let key = params.key();
    let mut state = cx.state().borrow_mut();
    let (id, created) = match state.resolve_or_create(&cx, &shared, params) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!(channel = %key, peer = %info.peer, error = %e, "Channel unavailable");
            let _ = stream.try_write(SERVICE_UNAVAILABLE);
            return Err(e);
        }
    };

    socket::tune(&stream, &shared.config);
    let channel = state.channel_mut(id).ok_or(RegistryError::Closed)?;
    channel.add_consumer(Consumer::new(stream, shared.header.clone(), info));
    channel.send_pass(&shared.policy);

    Ok(Attached {
        key,
        worker: cx.id(),
        created,
        clients: channel.client_count(),
    })
}

/// Readiness loop feeding one channel from its source socket
async fn run_ingest(
    cx: WorkerCx<HubWorker>,
    shared: Arc<HubShared>,
    id: ChannelId,
    socket: Rc<UdpSocket>,
) {
    loop {
        let ready = socket.readable().await;

        let more = {
            let mut state = cx.state().borrow_mut();
            let Some(channel) = state.channel_mut(id) else {
                return;
            };

            match ready.and_then(|()| channel.on_readable(&shared.policy)) {
                Ok(more) => more,
                Err(e) => {
                    tracing::warn!(channel = %channel.key(), error = %e, "Source receive failed");
                    state.destroy_channel(id, Teardown::SourceError);
                    return;
                }
            }
        };

        // A busy source must not starve the worker's other channels
        if more {
            tokio::task::yield_now().await;
        }
    }
}

/// Task broadcast to every worker on each tick
pub(crate) fn tick_task(shared: Arc<HubShared>) -> SharedTask<HubWorker> {
    Arc::new(move |cx: &WorkerCx<HubWorker>| {
        let stats = cx.state().borrow_mut().tick(Instant::now(), &shared);
        shared.publish(cx.id(), &stats);
    })
}

/// Task broadcast at shutdown
pub(crate) fn shutdown_task(shared: Arc<HubShared>) -> SharedTask<HubWorker> {
    Arc::new(move |cx: &WorkerCx<HubWorker>| {
        let mut state = cx.state().borrow_mut();
        state.stop_ticker();
        let destroyed = state.destroy_all(Teardown::Shutdown);
        shared.publish(cx.id(), &Stats::default());
        tracing::debug!(worker = cx.id(), channels = destroyed, "Worker channels destroyed");
    })
}

/// Periodic timer on one worker that broadcasts the tick to all of them
pub(crate) async fn run_ticker(cx: WorkerCx<HubWorker>, shared: Arc<HubShared>) {
    let mut interval = tokio::time::interval(shared.config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    let tick = tick_task(Arc::clone(&shared));
    loop {
        interval.tick().await;
        if shared.is_closed() {
            break;
        }

        let report = cx.broadcast(Arc::clone(&tick), false);
        if report.errors > 0 {
            tracing::debug!(errors = report.errors, "Tick not delivered to every worker");
        }
    }
}
