use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GspnError, Result};

/// Tunables of one scheduler instance. Missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Number of hardware cores.
    pub core_count: usize,
    /// Command slots in the pool.
    pub kcmd_max: usize,
    /// Largest `n` accepted by one submission.
    pub cmd_array_max: usize,
    /// How long a submitter waits for free slots.
    pub capacity_wait_ms: u64,
    /// How long a synchronous submitter waits for completion.
    pub sync_wait_ms: u64,
    /// Execution deadline of one trigger.
    pub exec_timeout_ms: u64,
    /// Per-fence wait before triggering an asynchronous command.
    pub fence_wait_ms: u64,
    /// Per-fence wait once a fence of the same command has failed.
    pub fence_wait_degraded_ms: u64,
    /// How long a suspend caller waits for the drain.
    pub suspend_wait_ms: u64,
    /// Worker re-check delay when a free core has queued work.
    pub dispatch_nudge_ms: u64,
    /// Scaler coefficient tables kept in the cache.
    pub coef_cache_max: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            core_count: 2,
            kcmd_max: 32,
            cmd_array_max: gspn_spec::CMD_ARRAY_MAX as usize,
            capacity_wait_ms: 500,
            sync_wait_ms: 1000,
            exec_timeout_ms: 500,
            fence_wait_ms: 3000,
            fence_wait_degraded_ms: 1,
            suspend_wait_ms: 500,
            dispatch_nudge_ms: 1,
            coef_cache_max: 32,
        }
    }
}

impl SchedulerConfig {
    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.core_count == 0 {
            return Err(GspnError::InvalidArgument("core_count must be at least 1".into()));
        }
        if self.kcmd_max == 0 {
            return Err(GspnError::InvalidArgument("kcmd_max must be at least 1".into()));
        }
        if self.cmd_array_max == 0 || self.cmd_array_max > gspn_spec::CMD_ARRAY_MAX as usize {
            return Err(GspnError::InvalidArgument(format!(
                "cmd_array_max must be within 1..={}",
                gspn_spec::CMD_ARRAY_MAX
            )));
        }
        if self.cmd_array_max > self.kcmd_max {
            return Err(GspnError::InvalidArgument(
                "cmd_array_max cannot exceed kcmd_max".into(),
            ));
        }
        if self.coef_cache_max == 0 {
            return Err(GspnError::InvalidArgument("coef_cache_max must be at least 1".into()));
        }
        Ok(())
    }

    /// Capacity wait as a [`Duration`].
    pub fn capacity_wait(&self) -> Duration {
        Duration::from_millis(self.capacity_wait_ms)
    }

    /// Synchronous completion wait as a [`Duration`].
    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }

    /// Execution deadline as a [`Duration`].
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    /// Acquire-fence wait as a [`Duration`].
    pub fn fence_wait(&self) -> Duration {
        Duration::from_millis(self.fence_wait_ms)
    }

    /// Acquire-fence wait after a failure as a [`Duration`].
    pub fn fence_wait_degraded(&self) -> Duration {
        Duration::from_millis(self.fence_wait_degraded_ms)
    }

    /// Suspend drain wait as a [`Duration`].
    pub fn suspend_wait(&self) -> Duration {
        Duration::from_millis(self.suspend_wait_ms)
    }

    /// Dispatch nudge as a [`Duration`].
    pub fn dispatch_nudge(&self) -> Duration {
        Duration::from_millis(self.dispatch_nudge_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SchedulerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.capacity_wait(), Duration::from_millis(500));
        assert_eq!(cfg.sync_wait(), Duration::from_secs(1));
    }

    #[test]
    fn zero_cores_is_rejected() {
        let cfg = SchedulerConfig {
            core_count: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(GspnError::InvalidArgument(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: SchedulerConfig = serde_json::from_str(r#"{"core_count": 4}"#).unwrap();
        assert_eq!(cfg.core_count, 4);
        assert_eq!(cfg.kcmd_max, 32);
        assert!(serde_json::from_str::<SchedulerConfig>(r#"{"cores": 4}"#).is_err());
    }
}
