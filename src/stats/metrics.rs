//! Statistics and metrics for channels and workers

use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters published by one worker, or the sum over several
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Live channels
    pub channels: usize,
    /// Attached consumers
    pub clients: usize,
    /// Ingest rate in bytes/sec
    pub rate_in: u64,
    /// Send rate in bytes/sec
    pub rate_out: u64,
}

impl Add for Stats {
    type Output = Stats;

    fn add(self, other: Stats) -> Stats {
        Stats {
            channels: self.channels + other.channels,
            clients: self.clients + other.clients,
            rate_in: self.rate_in + other.rate_in,
            rate_out: self.rate_out + other.rate_out,
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, other: Stats) {
        *self = *self + other;
    }
}

impl std::iter::Sum for Stats {
    fn sum<I: Iterator<Item = Stats>>(iter: I) -> Stats {
        iter.fold(Stats::default(), Add::add)
    }
}

/// Snapshot slot written by its worker, readable from any thread
///
/// Fields are independent relaxed atomics: a reader may see counters from two
/// consecutive ticks, which is fine for diagnostics.
#[derive(Debug, Default)]
pub struct WorkerSlot {
    channels: AtomicUsize,
    clients: AtomicUsize,
    rate_in: AtomicU64,
    rate_out: AtomicU64,
}

impl WorkerSlot {
    pub fn publish(&self, stats: &Stats) {
        self.channels.store(stats.channels, Ordering::Relaxed);
        self.clients.store(stats.clients, Ordering::Relaxed);
        self.rate_in.store(stats.rate_in, Ordering::Relaxed);
        self.rate_out.store(stats.rate_out, Ordering::Relaxed);
    }

    pub fn load(&self) -> Stats {
        Stats {
            channels: self.channels.load(Ordering::Relaxed),
            clients: self.clients.load(Ordering::Relaxed),
            rate_in: self.rate_in.load(Ordering::Relaxed),
            rate_out: self.rate_out.load(Ordering::Relaxed),
        }
    }
}

/// In/out byte-rate estimate for one channel
///
/// Rates are recomputed from the byte delta over the elapsed time since the
/// previous sample.
#[derive(Debug, Clone)]
pub struct RateMeter {
    sampled_at: Instant,
    last_in: u64,
    last_out: u64,
    rate_in: u64,
    rate_out: u64,
}

impl RateMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            sampled_at: now,
            last_in: 0,
            last_out: 0,
            rate_in: 0,
            rate_out: 0,
        }
    }

    /// Take a sample of the running totals
    pub fn sample(&mut self, now: Instant, total_in: u64, total_out: u64) {
        let elapsed = now.saturating_duration_since(self.sampled_at);
        if elapsed.is_zero() {
            return;
        }

        let secs = elapsed.as_secs_f64();
        self.rate_in = (total_in.saturating_sub(self.last_in) as f64 / secs) as u64;
        self.rate_out = (total_out.saturating_sub(self.last_out) as f64 / secs) as u64;

        self.sampled_at = now;
        self.last_in = total_in;
        self.last_out = total_out;
    }

    /// Bytes/sec received
    pub fn rate_in(&self) -> u64 {
        self.rate_in
    }

    /// Bytes/sec sent
    pub fn rate_out(&self) -> u64 {
        self.rate_out
    }
}

/// Render a byte rate as kbit/s
pub fn format_rate(bytes_per_sec: u64) -> String {
    format!("{} kbit/s", bytes_per_sec * 8 / 1000)
}

/// Render a duration as `[Nd ]HH:MM:SS`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, rest) = (total / 86_400, total % 86_400);
    let (h, m, s) = (rest / 3600, rest % 3600 / 60, rest % 60);
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, h, m, s)
    } else {
        format!("{:02}:{:02}:{:02}", h, m, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_sum() {
        let a = Stats {
            channels: 1,
            clients: 3,
            rate_in: 100,
            rate_out: 300,
        };
        let b = Stats {
            channels: 2,
            clients: 1,
            rate_in: 50,
            rate_out: 50,
        };

        let total: Stats = [a, b].into_iter().sum();
        assert_eq!(total.channels, 3);
        assert_eq!(total.clients, 4);
        assert_eq!(total.rate_in, 150);
        assert_eq!(total.rate_out, 350);
    }

    #[test]
    fn test_slot_publish_load() {
        let slot = WorkerSlot::default();
        assert_eq!(slot.load(), Stats::default());

        let stats = Stats {
            channels: 4,
            clients: 9,
            rate_in: 1_000,
            rate_out: 9_000,
        };
        slot.publish(&stats);
        assert_eq!(slot.load(), stats);
    }

    #[test]
    fn test_rate_meter() {
        let start = Instant::now();
        let mut meter = RateMeter::new(start);

        meter.sample(start + Duration::from_secs(2), 2_000, 8_000);
        assert_eq!(meter.rate_in(), 1_000);
        assert_eq!(meter.rate_out(), 4_000);

        // Zero elapsed time keeps the previous estimate
        meter.sample(start + Duration::from_secs(2), 9_999, 9_999);
        assert_eq!(meter.rate_in(), 1_000);

        meter.sample(start + Duration::from_secs(4), 2_000, 8_000);
        assert_eq!(meter.rate_in(), 0);
        assert_eq!(meter.rate_out(), 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(3_723)), "01:02:03");
        assert_eq!(format_duration(Duration::from_secs(90_061)), "1d 01:01:01");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0), "0 kbit/s");
        assert_eq!(format_rate(125_000), "1000 kbit/s");
    }
}
