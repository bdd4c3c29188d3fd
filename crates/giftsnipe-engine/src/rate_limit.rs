/*
[INPUT]:  RateLimitConfig (max actions per window), cancellation token of the caller
[OUTPUT]: PermitPool - market-wide sliding-window action ceiling
[POS]:    Execution layer - shared throttle in front of every client call
[UPDATE]: When changing throttling semantics
*/

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("permit acquisition cancelled")]
pub struct AcquireCancelled;

/// Sliding-window permit pool shared by every account loop of a market.
///
/// At most `max_actions` permits are granted in any `window`. Permits are not
/// returned; they expire when they fall out of the window.
#[derive(Debug, Clone)]
pub struct PermitPool {
    granted: Arc<Mutex<VecDeque<Instant>>>,
    max_actions: usize,
    window: Duration,
}

impl PermitPool {
    pub fn new(max_actions: usize, window: Duration) -> Self {
        Self {
            granted: Arc::new(Mutex::new(VecDeque::with_capacity(max_actions))),
            max_actions: max_actions.max(1),
            window,
        }
    }

    /// Wait for a permit or until `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireCancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(AcquireCancelled);
            }
            let wait = match self.try_grant().await {
                None => return Ok(()),
                Some(wait) => wait,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(AcquireCancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Grant a permit now if one is free.
    pub async fn try_acquire(&self) -> bool {
        self.try_grant().await.is_none()
    }

    /// Permits currently counted against the window.
    pub async fn in_use(&self) -> usize {
        let mut granted = self.granted.lock().await;
        prune(&mut granted, Instant::now(), self.window);
        granted.len()
    }

    /// `None` when a permit was granted, otherwise how long until one frees up.
    async fn try_grant(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut granted = self.granted.lock().await;
        prune(&mut granted, now, self.window);
        if granted.len() < self.max_actions {
            granted.push_back(now);
            return None;
        }
        let oldest = granted.front().copied().unwrap_or(now);
        Some((oldest + self.window).saturating_duration_since(now).max(Duration::from_millis(1)))
    }
}

fn prune(granted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = granted.front() {
        if now.saturating_duration_since(*front) >= window {
            granted.pop_front();
        } else {
            break;
        }
    }
}
