// ABOUTME: Per-client-address flood guard in front of the gateway
// ABOUTME: Coarse HTTP protection with governor; tiered quotas are enforced by admission

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
};
use tracing::{debug, warn};

use crate::error::AppError;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

#[derive(Clone)]
pub struct FloodGuard {
    limiter: Arc<KeyedLimiter>,
    clock: DefaultClock,
}

impl FloodGuard {
    pub fn new(rpm: u32, burst: u32) -> Self {
        let rpm = NonZeroU32::new(rpm).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        debug!(rpm = %rpm, burst = %burst, "Created flood guard");

        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(rpm).allow_burst(burst))),
            clock: DefaultClock::default(),
        }
    }

    /// Seconds until `ip` may send again, or None when the request may pass
    pub fn check(&self, ip: IpAddr) -> Option<u64> {
        match self.limiter.check_key(&ip) {
            Ok(()) => None,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Some(wait.as_secs() + u64::from(wait.subsec_nanos() > 0))
            }
        }
    }

    /// Drop state for addresses that are back at full capacity
    pub fn purge(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }
}

pub async fn flood_guard_middleware(
    State(guard): State<FloodGuard>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = addr.ip();
    match guard.check(ip) {
        None => Ok(next.run(request).await),
        Some(retry_after) => {
            warn!(
                ip = %ip,
                path = %request.uri().path(),
                audit = true,
                "Flood guard rejected request"
            );
            Err(AppError::rate_limited(retry_after.max(1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject() {
        let guard = FloodGuard::new(60, 2);
        let ip = IpAddr::from([10, 0, 0, 1]);

        assert_eq!(guard.check(ip), None);
        assert_eq!(guard.check(ip), None);
        assert_eq!(guard.check(ip), Some(1));
    }

    #[test]
    fn test_addresses_are_independent() {
        let guard = FloodGuard::new(60, 1);
        assert_eq!(guard.check(IpAddr::from([10, 0, 0, 1])), None);
        assert_eq!(guard.check(IpAddr::from([10, 0, 0, 2])), None);
        assert!(guard.check(IpAddr::from([10, 0, 0, 1])).is_some());
        assert_eq!(guard.tracked(), 2);
    }
}
