//! Tunables of the reconciliation core

use std::time::Duration;

/// Configuration shared by every reconciliation pass
#[derive(Clone, Debug, PartialEq)]
pub struct MemberConfig {
    /// Replace unhealthy members automatically
    pub auto_failover: bool,
    /// Interval at which converged clusters are re-reconciled
    pub resync_interval: Duration,
    /// Grace window for never-ready pods, in multiples of `resync_interval`
    pub unjoined_grace_periods: u32,
    /// How long a member must stay unhealthy before it is marked failed
    pub failover_period: Duration,
    /// Default cap on deleted failure members per component
    pub max_failover_count: i32,
    /// Whether the operator may read and patch PersistentVolumes
    pub pv_access: bool,
    /// Requeue delay after a retryable wait
    pub requeue_delay: Duration,
    /// Request timeout for the membership API
    pub membership_timeout: Duration,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            auto_failover: true,
            resync_interval: Duration::from_secs(30),
            unjoined_grace_periods: 5,
            failover_period: Duration::from_secs(300),
            max_failover_count: 3,
            pv_access: true,
            requeue_delay: Duration::from_secs(5),
            membership_timeout: Duration::from_secs(5),
        }
    }
}

impl MemberConfig {
    /// How long a pod may stay not-ready before scale-in treats it as never joined
    pub fn unjoined_grace(&self) -> chrono::Duration {
        let window = self
            .resync_interval
            .saturating_mul(self.unjoined_grace_periods);
        to_chrono(window)
    }

    /// `failover_period` as a chrono duration
    pub fn failover_period(&self) -> chrono::Duration {
        to_chrono(self.failover_period)
    }
}

/// Convert, clamping anything chrono cannot represent to its maximum
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}
