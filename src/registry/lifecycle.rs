//! Channel lifecycle rules
//!
//! ```text
//!   Active ──(no clients)──────────► Idle ──────────► Destroyed
//!     │                                                   ▲
//!     └──(no datagram within receive_timeout)─► SourceTimedOut
//! ```
//!
//! Evaluated once per tick on the owning worker. Kept free of I/O so the
//! rules can be checked with an injected clock.

use std::fmt;
use std::time::{Duration, Instant};

/// Why a channel is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Last consumer is gone
    Idle,
    /// Source stayed silent longer than the receive timeout
    SourceTimedOut { silent: Duration },
    /// Source socket failed
    SourceError,
    /// Registry shutdown
    Shutdown,
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Teardown::Idle => write!(f, "no clients"),
            Teardown::SourceTimedOut { silent } => {
                write!(f, "no data for {:.1}s", silent.as_secs_f64())
            }
            Teardown::SourceError => write!(f, "source error"),
            Teardown::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// What a tick decided for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep {
        /// Leave and re-join the multicast group now
        rejoin: bool,
    },
    Destroy(Teardown),
}

/// Inputs of one evaluation
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub clients: usize,
    pub last_receive: Instant,
    /// Next scheduled rejoin, `None` when rejoin is disabled
    pub next_rejoin: Option<Instant>,
}

/// Apply the lifecycle rules at `now`
pub fn evaluate(now: Instant, obs: &Observation, receive_timeout: Duration) -> Verdict {
    if obs.clients == 0 {
        return Verdict::Destroy(Teardown::Idle);
    }

    let silent = now.saturating_duration_since(obs.last_receive);
    if !receive_timeout.is_zero() && silent > receive_timeout {
        return Verdict::Destroy(Teardown::SourceTimedOut { silent });
    }

    Verdict::Keep {
        rejoin: obs.next_rejoin.is_some_and(|at| now >= at),
    }
}

/// Whether rates are recomputed on tick number `tick`
pub fn is_rate_tick(tick: u64) -> bool {
    tick % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_silent_source_destroyed_on_third_tick() {
        let created = Instant::now();
        let obs = Observation {
            clients: 1,
            last_receive: created,
            next_rejoin: None,
        };

        let verdicts: Vec<Verdict> = (1..=3)
            .map(|tick| evaluate(created + secs(tick), &obs, secs(2)))
            .collect();

        assert_eq!(verdicts[0], Verdict::Keep { rejoin: false });
        assert_eq!(verdicts[1], Verdict::Keep { rejoin: false });
        assert_eq!(
            verdicts[2],
            Verdict::Destroy(Teardown::SourceTimedOut { silent: secs(3) })
        );
    }

    #[test]
    fn test_no_clients_destroyed_first() {
        let now = Instant::now();
        let obs = Observation {
            clients: 0,
            last_receive: now,
            next_rejoin: Some(now),
        };
        assert_eq!(evaluate(now, &obs, secs(10)), Verdict::Destroy(Teardown::Idle));
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let start = Instant::now();
        let obs = Observation {
            clients: 3,
            last_receive: start,
            next_rejoin: None,
        };
        assert_eq!(
            evaluate(start + secs(3600), &obs, Duration::ZERO),
            Verdict::Keep { rejoin: false }
        );
    }

    #[test]
    fn test_rejoin_when_due() {
        let start = Instant::now();
        let obs = Observation {
            clients: 1,
            last_receive: start,
            next_rejoin: Some(start + secs(5)),
        };

        assert_eq!(
            evaluate(start + secs(4), &obs, Duration::ZERO),
            Verdict::Keep { rejoin: false }
        );
        assert_eq!(
            evaluate(start + secs(5), &obs, Duration::ZERO),
            Verdict::Keep { rejoin: true }
        );
    }

    #[test]
    fn test_rate_ticks() {
        assert!(!is_rate_tick(1));
        assert!(is_rate_tick(2));
        assert!(!is_rate_tick(3));
        assert!(is_rate_tick(4));
    }
}
