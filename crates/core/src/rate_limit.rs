use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::domain::provider::ProviderId;

const WINDOW: Duration = Duration::from_secs(60);

/// Requests-per-minute limiter keyed by provider, using a sliding 60s window.
#[derive(Debug, Default)]
pub struct ProviderRateLimiter {
    windows: HashMap<ProviderId, VecDeque<Instant>>,
}

impl ProviderRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request when a slot is free, otherwise returns how long to wait.
    /// A limit of zero disables limiting for the provider.
    pub fn try_acquire(
        &mut self,
        provider: &ProviderId,
        requests_per_minute: u32,
        now: Instant,
    ) -> Result<(), Duration> {
        if requests_per_minute == 0 {
            return Ok(());
        }

        let window = self.windows.entry(provider.clone()).or_default();
        while window.front().is_some_and(|&oldest| now.saturating_duration_since(oldest) >= WINDOW) {
            window.pop_front();
        }

        if window.len() < requests_per_minute as usize {
            window.push_back(now);
            return Ok(());
        }

        let oldest = window.front().copied().unwrap_or(now);
        Err(WINDOW.saturating_sub(now.saturating_duration_since(oldest)))
    }

    pub fn in_flight(&self, provider: &ProviderId) -> usize {
        self.windows.get(provider).map_or(0, VecDeque::len)
    }
}
