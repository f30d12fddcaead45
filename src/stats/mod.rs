//! Statistics
//!
//! Per-worker snapshot slots and the plain-text summary page.

pub mod metrics;

use std::fmt::Write;
use std::time::Duration;

use bytes::BytesMut;

pub use metrics::{format_duration, format_rate, RateMeter, Stats, WorkerSlot};

/// Write the summary page: uptime, one line per worker, then the total
pub fn render_summary(out: &mut BytesMut, uptime: Duration, workers: &[Stats]) -> std::fmt::Result {
    writeln!(out, "uptime: {}", format_duration(uptime))?;
    writeln!(out)?;

    for (id, stats) in workers.iter().enumerate() {
        write_line(out, &format!("worker {}", id), stats)?;
    }

    let total: Stats = workers.iter().copied().sum();
    write_line(out, "total", &total)
}

fn write_line(out: &mut BytesMut, label: &str, stats: &Stats) -> std::fmt::Result {
    writeln!(
        out,
        "{:<10} channels: {:>4}  clients: {:>5}  in: {:>12}  out: {:>12}",
        label,
        stats.channels,
        stats.clients,
        format_rate(stats.rate_in),
        format_rate(stats.rate_out),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_summary() {
        let workers = [
            Stats {
                channels: 1,
                clients: 2,
                rate_in: 125_000,
                rate_out: 250_000,
            },
            Stats::default(),
        ];

        let mut out = BytesMut::new();
        render_summary(&mut out, Duration::from_secs(61), &workers).unwrap();
        let text = std::str::from_utf8(&out).unwrap();

        assert!(text.starts_with("uptime: 00:01:01\n"));
        assert!(text.contains("worker 0"));
        assert!(text.contains("worker 1"));
        let total = text.lines().last().unwrap();
        assert!(total.starts_with("total"));
        assert!(total.contains("clients:     2"));
        assert!(total.contains("2000 kbit/s"));
    }
}
