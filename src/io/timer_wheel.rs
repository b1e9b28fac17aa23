//! Deadline tracking for native timers
//!
//! Keyed by [`Token`]. Repeating deadlines advance by whole intervals from
//! their previous deadline, so a late poll does not make them drift.

use super::Token;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    interval: Option<Duration>,
}

pub struct TimerWheel {
    deadlines: HashMap<Token, Deadline>,
    resolution: Duration,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::with_resolution(Duration::from_millis(1))
    }

    pub fn with_resolution(resolution: Duration) -> Self {
        Self {
            deadlines: HashMap::new(),
            resolution: resolution.max(Duration::from_micros(1)),
        }
    }

    /// Schedule `token` after `delay`, then every `interval` if given.
    pub fn insert(&mut self, token: Token, now: Instant, delay: Duration, interval: Option<Duration>) {
        let interval = interval.filter(|i| !i.is_zero());
        self.deadlines.insert(
            token,
            Deadline {
                at: now + delay,
                interval,
            },
        );
    }

    pub fn remove(&mut self, token: Token) -> bool {
        self.deadlines.remove(&token).is_some()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.deadlines.contains_key(&token)
    }

    /// Collect tokens due at `now`, earliest first.
    ///
    /// One-shot deadlines are removed; repeating ones move to their next
    /// interval boundary after `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<Token> {
        let mut due: Vec<(Instant, Token)> = self
            .deadlines
            .iter()
            .filter(|(_, d)| d.at <= now)
            .map(|(token, d)| (d.at, *token))
            .collect();
        due.sort();

        for (_, token) in &due {
            let Some(deadline) = self.deadlines.get_mut(token) else {
                continue;
            };
            match deadline.interval {
                Some(interval) => {
                    deadline.at += interval;
                    while deadline.at <= now {
                        deadline.at += interval;
                    }
                }
                None => {
                    self.deadlines.remove(token);
                }
            }
        }
        due.into_iter().map(|(_, token)| token).collect()
    }

    /// Time until the earliest deadline, rounded up to the resolution.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let at = self.deadlines.values().map(|d| d.at).min()?;
        let remaining = at.saturating_duration_since(now);
        let step = self.resolution.as_nanos();
        let rounded = remaining.as_nanos().div_ceil(step) * step;
        Some(Duration::from_nanos(rounded.min(u64::MAX as u128) as u64))
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}
