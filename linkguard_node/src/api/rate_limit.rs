use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{LinkGuardError, Result};

/// Sliding-window admission control keyed by source IP.
///
/// Each IP keeps the instants of its admitted requests inside the trailing
/// window. Rejected requests are never recorded, so hammering the endpoint
/// does not push the window further out. Every check runs under the DashMap
/// shard lock for that IP and touches no other shared state.
#[derive(Debug)]
pub struct RateLimiter {
    /// Requests admitted per window
    limit: usize,
    /// Window length
    window: Duration,
    /// Tracked IPs past which a new IP sweeps idle windows first
    max_tracked: usize,
    /// Admitted request instants by client IP
    windows: DashMap<IpAddr, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            max_tracked: 100_000,
            windows: DashMap::new(),
        }
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked;
        self
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.limit, config.window()).with_max_tracked(config.max_tracked_ips)
    }

    /// Admit or reject a request from `ip` now.
    pub fn check(&self, ip: IpAddr) -> Result<()> {
        self.check_at(ip, Instant::now())
    }

    /// Admit or reject a request from `ip` at `now`.
    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<()> {
        // Must run before `entry` takes a shard lock that `retain` would need
        if self.windows.len() >= self.max_tracked && !self.windows.contains_key(&ip) {
            let removed = self.cleanup_at(now);
            if removed == 0 {
                warn!(
                    "Rate limiter tracks {} IPs, all active within {:?}",
                    self.windows.len(),
                    self.window
                );
            }
        }

        let mut entry = self.windows.entry(ip).or_default();
        let admitted = entry.value_mut();

        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() >= self.limit {
            warn!(
                "Rate limited IP {} ({} requests in {:?})",
                ip,
                admitted.len(),
                self.window
            );
            return Err(LinkGuardError::RateLimitExceeded(format!(
                "{} requests per {} seconds",
                self.limit,
                self.window.as_secs()
            )));
        }

        admitted.push_back(now);
        Ok(())
    }

    /// Drop IPs with no admitted request left inside the window.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let window = self.window;
        self.windows.retain(|_, admitted| {
            admitted
                .back()
                .map_or(false, |last| now.saturating_duration_since(*last) < window)
        });
        let removed = before.saturating_sub(self.windows.len());
        debug!("Rate limiter cleanup removed {} idle IPs", removed);
        removed
    }

    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// Number of IPs currently tracked
    pub fn tracked_ips(&self) -> usize {
        self.windows.len()
    }

    /// Periodically drop idle IPs until the returned handle is aborted.
    pub fn spawn_cleanup(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.cleanup();
            }
        })
    }
}
