/*
[INPUT]:  RestartPolicy from launcher config, process exit observations
[OUTPUT]: Restart-or-give-up decisions with backoff delays
[POS]:    Supervision policy - sliding-window restart budget
[UPDATE]: When changing backoff shapes or attempt accounting
*/

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

fn default_max_attempts() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    300
}

/// Delay before a restart, indexed by how many restarts the window already holds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `base_ms * 2^n`, capped at `cap_ms`
    Exponential { base_ms: u64, cap_ms: u64 },
    /// Explicit delays; the last entry repeats
    ScheduleMs(Vec<u64>),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_ms: 2_000,
            cap_ms: 60_000,
        }
    }
}

impl Backoff {
    pub fn delay(&self, index: usize) -> Duration {
        match self {
            Backoff::Exponential { base_ms, cap_ms } => {
                let shift = index.min(16) as u32;
                let ms = base_ms.saturating_mul(1u64 << shift).min(*cap_ms);
                Duration::from_millis(ms)
            }
            Backoff::ScheduleMs(delays) => {
                let ms = delays
                    .get(index)
                    .or_else(|| delays.last())
                    .copied()
                    .unwrap_or(0);
                Duration::from_millis(ms)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicy {
    /// Restarts allowed inside the window; 0 disables restarts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Whether an unrequested exit with code 0 consumes an attempt
    #[serde(default)]
    pub count_clean_exit: bool,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub backoff: Backoff,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            count_clean_exit: false,
            backoff: Backoff::default(),
        }
    }
}

impl RestartPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart {
        delay: Duration,
        /// Attempts held in the window after this one
        attempt: usize,
    },
    Exhausted {
        attempts: usize,
    },
}

/// Restart budget of one market.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    attempts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Decide what follows an unrequested exit observed at `now`.
    pub fn on_exit(&mut self, clean: bool, now: Instant) -> RestartDecision {
        self.prune(now);
        let held = self.attempts.len();

        if clean && !self.policy.count_clean_exit {
            return RestartDecision::Restart {
                delay: self.policy.backoff.delay(held.saturating_sub(1)),
                attempt: held,
            };
        }

        if held >= self.policy.max_attempts as usize {
            return RestartDecision::Exhausted { attempts: held };
        }

        self.attempts.push_back(now);
        RestartDecision::Restart {
            delay: self.policy.backoff.delay(held),
            attempt: held + 1,
        }
    }

    pub fn attempts_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.attempts.len()
    }

    fn prune(&mut self, now: Instant) {
        let window = self.policy.window();
        while let Some(&oldest) = self.attempts.front() {
            if now.duration_since(oldest) >= window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule_policy(max_attempts: u32, schedule: &[u64]) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            window_secs: 60,
            count_clean_exit: false,
            backoff: Backoff::ScheduleMs(schedule.to_vec()),
        }
    }

    #[test]
    fn schedule_repeats_last_entry() {
        let backoff = Backoff::ScheduleMs(vec![1, 2, 4]);
        assert_eq!(backoff.delay(0), Duration::from_millis(1));
        assert_eq!(backoff.delay(2), Duration::from_millis(4));
        assert_eq!(backoff.delay(9), Duration::from_millis(4));
    }

    #[test]
    fn exponential_is_capped() {
        let backoff = Backoff::Exponential {
            base_ms: 100,
            cap_ms: 1_000,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(64), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_crash_in_window_is_terminal() {
        let mut tracker = RestartTracker::new(schedule_policy(3, &[1, 2, 4]));
        let now = Instant::now();

        let delays: Vec<_> = (0..3)
            .map(|_| match tracker.on_exit(false, now) {
                RestartDecision::Restart { delay, .. } => delay,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4)
            ]
        );
        assert_eq!(
            tracker.on_exit(false, now),
            RestartDecision::Exhausted { attempts: 3 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_expire_with_the_window() {
        let mut tracker = RestartTracker::new(schedule_policy(1, &[5]));
        let start = Instant::now();
        assert!(matches!(
            tracker.on_exit(false, start),
            RestartDecision::Restart { attempt: 1, .. }
        ));
        assert!(matches!(
            tracker.on_exit(false, start + Duration::from_secs(10)),
            RestartDecision::Exhausted { .. }
        ));
        assert!(matches!(
            tracker.on_exit(false, start + Duration::from_secs(61)),
            RestartDecision::Restart { attempt: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_is_free_unless_counted() {
        let now = Instant::now();
        let mut free = RestartTracker::new(schedule_policy(0, &[1]));
        assert!(matches!(
            free.on_exit(true, now),
            RestartDecision::Restart { attempt: 0, .. }
        ));
        assert!(matches!(
            free.on_exit(false, now),
            RestartDecision::Exhausted { attempts: 0 }
        ));

        let mut counted = RestartTracker::new(RestartPolicy {
            count_clean_exit: true,
            ..schedule_policy(1, &[1])
        });
        assert!(matches!(
            counted.on_exit(true, now),
            RestartDecision::Restart { attempt: 1, .. }
        ));
        assert_eq!(counted.attempts_in_window(now), 1);
    }
}
