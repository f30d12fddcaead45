//! Channel: one live source, its ring buffer and its consumers

use std::fmt::Write;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::AbortHandle;

use crate::ring::RingBuffer;
use crate::runtime::WorkerId;
use crate::session::{fanout, socket, Consumer, SendPolicy};
use crate::source::{self, Ingest};
use crate::stats::{format_duration, format_rate, RateMeter};

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::lifecycle::{self, Observation, Teardown, Verdict};
use super::source::{ChannelKey, SourceParams};

/// Arena key of a channel within its worker
pub type ChannelId = u64;

/// A live source relayed to HTTP consumers
///
/// Owned by exactly one worker for its whole life. Consumers refer back to it
/// by [`ChannelId`] only.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    key: ChannelKey,
    owner: WorkerId,
    params: SourceParams,
    socket: Rc<UdpSocket>,
    ring: RingBuffer,
    ingest: Ingest,
    consumers: Vec<Consumer<TcpStream>>,

    /// Payload bytes written to the ring
    bytes_in: u64,
    /// Stream bytes accepted by consumer sockets
    bytes_out: u64,
    rate: RateMeter,

    created_at: Instant,
    last_receive: Instant,
    next_rejoin: Option<Instant>,
    ingest_task: Option<AbortHandle>,
}

fn schedule(now: Instant, interval: Duration) -> Option<Instant> {
    (!interval.is_zero()).then(|| now + interval)
}

impl Channel {
    /// Bind and join the source; must run on the owning worker
    pub(crate) fn open(
        id: ChannelId,
        owner: WorkerId,
        params: SourceParams,
        config: &RegistryConfig,
    ) -> Result<Self, RegistryError> {
        let key = params.key();
        let std_socket = source::open(&params, config.source_rcv_buf)?;
        let socket =
            UdpSocket::from_std(std_socket).map_err(|e| RegistryError::Bind(key.clone(), e))?;

        let now = Instant::now();
        Ok(Self {
            id,
            key,
            owner,
            next_rejoin: schedule(now, params.rejoin_interval),
            params,
            socket: Rc::new(socket),
            ring: RingBuffer::with_capacity(config.ring_size),
            ingest: Ingest::new(config.source_rcv_lowat),
            consumers: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
            rate: RateMeter::new(now),
            created_at: now,
            last_receive: now,
            ingest_task: None,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Worker that owns this channel
    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn params(&self) -> &SourceParams {
        &self.params
    }

    pub fn client_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn consumers(&self) -> &[Consumer<TcpStream>] {
        &self.consumers
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn rate_in(&self) -> u64 {
        self.rate.rate_in()
    }

    pub fn rate_out(&self) -> u64 {
        self.rate.rate_out()
    }

    pub fn last_receive(&self) -> Instant {
        self.last_receive
    }

    /// Local address of the source socket
    pub fn source_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn socket(&self) -> Rc<UdpSocket> {
        Rc::clone(&self.socket)
    }

    pub(crate) fn set_ingest_task(&mut self, task: AbortHandle) {
        self.ingest_task = Some(task);
    }

    pub(crate) fn add_consumer(&mut self, consumer: Consumer<TcpStream>) {
        tracing::info!(
            channel = %self.key,
            peer = %consumer.info().peer,
            clients = self.consumers.len() + 1,
            "Client attached"
        );
        self.consumers.push(consumer);
    }

    /// Drain the source and run a send pass when enough data arrived
    ///
    /// Returns whether the drain stopped at its budget with datagrams possibly
    /// left. An error means the source is unusable and the channel must go.
    pub(crate) fn on_readable(&mut self, policy: &SendPolicy) -> io::Result<bool> {
        let batch = self.ingest.drain(&*self.socket, &mut self.ring)?;
        // Datagrams the demultiplexer rejected do not count as source activity
        if batch.bytes > 0 {
            self.last_receive = Instant::now();
            self.bytes_in += batch.bytes as u64;
        }
        if batch.rejected > 0 {
            tracing::trace!(channel = %self.key, rejected = batch.rejected, "Datagrams dropped by demux");
        }

        if self.ingest.take_send_due() {
            self.send_pass(policy);
        }
        Ok(batch.more)
    }

    pub(crate) fn send_pass(&mut self, policy: &SendPolicy) {
        let report = fanout::send_pass(&mut self.ring, &mut self.consumers, policy);
        self.bytes_out += report.bytes_sent;

        for (consumer, reason) in report.closed {
            tracing::info!(
                channel = %self.key,
                peer = %consumer.info().peer,
                sent = consumer.bytes_sent(),
                reason = %reason,
                "Client detached"
            );
        }
    }

    /// Periodic sweep for this channel
    pub(crate) fn tick(&mut self, now: Instant, tick: u64, receive_timeout: Duration) -> Verdict {
        if lifecycle::is_rate_tick(tick) {
            self.rate.sample(now, self.bytes_in, self.bytes_out);
        }

        let observation = Observation {
            clients: self.consumers.len(),
            last_receive: self.last_receive,
            next_rejoin: self.next_rejoin,
        };
        let verdict = lifecycle::evaluate(now, &observation, receive_timeout);

        if verdict == (Verdict::Keep { rejoin: true }) {
            match source::rejoin(&*self.socket, &self.params) {
                Ok(()) => tracing::debug!(channel = %self.key, "Multicast group re-joined"),
                Err(e) => {
                    tracing::warn!(channel = %self.key, error = %e, "Multicast rejoin failed")
                }
            }
            self.next_rejoin = schedule(now, self.params.rejoin_interval);
        }

        verdict
    }

    /// Tear the channel down
    ///
    /// Consumers that have not received any of the stream header get a 503.
    pub(crate) fn close(mut self, reason: Teardown) {
        if let Some(task) = self.ingest_task.take() {
            task.abort();
        }
        for consumer in &mut self.consumers {
            consumer.reject();
        }

        tracing::info!(
            channel = %self.key,
            worker = self.owner,
            clients = self.consumers.len(),
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            reason = %reason,
            "Channel destroyed"
        );
    }

    /// Write the per-channel diagnostics block
    pub fn describe(&self, out: &mut BytesMut, now: Instant) -> std::fmt::Result {
        writeln!(
            out,
            "{}  worker: {}  clients: {}  in: {}  out: {}  age: {}  silent: {:.1}s",
            self.key,
            self.owner,
            self.consumers.len(),
            format_rate(self.rate.rate_in()),
            format_rate(self.rate.rate_out()),
            format_duration(now.saturating_duration_since(self.created_at)),
            now.saturating_duration_since(self.last_receive).as_secs_f64(),
        )?;

        for consumer in &self.consumers {
            let info = consumer.info();
            let diag = socket::diagnostics(consumer.sink());
            writeln!(
                out,
                "    {}  real: {}  agent: {}  connected: {}  sent: {}  dropped: {}  sndbuf: {}  cc: {}  nodelay: {}",
                info.peer,
                info.real_addr.as_deref().unwrap_or("-"),
                info.user_agent.as_deref().unwrap_or("-"),
                format_duration(now.saturating_duration_since(consumer.connected_at())),
                consumer.bytes_sent(),
                consumer.bytes_dropped(),
                diag.send_buffer.map_or_else(|| "-".to_string(), |n| n.to_string()),
                diag.congestion.as_deref().unwrap_or("-"),
                diag.no_delay.map_or("-", |v| if v { "yes" } else { "no" }),
            )?;
        }
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.ingest_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::net::TcpListener;

    use super::*;
    use crate::registry::source::Interface;
    use crate::session::ClientInfo;

    fn open_channel(config: &RegistryConfig, rejoin: Duration) -> Channel {
        let params = SourceParams::new("127.0.0.1:0".parse().unwrap(), Interface::any())
            .rejoin_interval(rejoin);
        Channel::open(1, 0, params, config).unwrap()
    }

    /// Server end as a consumer, plus the client end to keep it open
    async fn consumer() -> (Consumer<TcpStream>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n");
        (Consumer::new(server, header, ClientInfo::new(peer)), client)
    }

    #[tokio::test]
    async fn test_rejected_datagrams_do_not_refresh_last_receive() {
        let config = RegistryConfig::default();
        let policy = SendPolicy::from(&config);
        let mut channel = open_channel(&config, Duration::ZERO);
        let target = channel.source_addr().unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let opened = channel.last_receive();

        sender.send_to(&[0x40; 400], target).unwrap();
        channel.socket().readable().await.unwrap();
        assert!(!channel.on_readable(&policy).unwrap());
        assert_eq!(channel.last_receive(), opened);
        assert_eq!(channel.bytes_in(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        sender.send_to(&[0x47; 188], target).unwrap();
        channel.socket().readable().await.unwrap();
        channel.on_readable(&policy).unwrap();
        assert!(channel.last_receive() > opened);
        assert_eq!(channel.bytes_in(), 188);
    }

    #[tokio::test]
    async fn test_failed_rejoin_keeps_channel_and_reschedules() {
        let interval = Duration::from_secs(5);
        let mut channel = open_channel(&RegistryConfig::default(), interval);
        let (consumer, _client) = consumer().await;
        channel.add_consumer(consumer);

        // An IPv6 group on the IPv4 socket makes every join fail
        channel.params.addr = "[ff15::1]:5000".parse().unwrap();
        let due = channel.next_rejoin.unwrap();

        let early = channel.tick(due - Duration::from_secs(1), 1, Duration::ZERO);
        assert_eq!(early, Verdict::Keep { rejoin: false });
        assert_eq!(channel.next_rejoin, Some(due));

        let verdict = channel.tick(due, 2, Duration::ZERO);
        assert_eq!(verdict, Verdict::Keep { rejoin: true });
        assert_eq!(channel.next_rejoin, Some(due + interval));
        assert_eq!(channel.client_count(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_disabled_never_schedules() {
        let mut channel = open_channel(&RegistryConfig::default(), Duration::ZERO);
        let (consumer, _client) = consumer().await;
        channel.add_consumer(consumer);
        assert_eq!(channel.next_rejoin, None);

        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(
            channel.tick(later, 1, Duration::ZERO),
            Verdict::Keep { rejoin: false }
        );
        assert_eq!(channel.next_rejoin, None);
    }
}
