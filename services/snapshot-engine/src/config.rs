//! Configuration for the snapshot engine.

use std::time::Duration;

use anyhow::{Context, Result};

/// Engine timeouts and concurrency limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for a single task.
    pub task_timeout: Duration,

    /// Upper bound for a single remote command.
    pub command_timeout: Duration,

    /// Upper bound for one reachability probe.
    pub reachability_timeout: Duration,

    /// How long to wait for a rebooted node to answer again.
    pub restart_timeout: Duration,

    /// Delay between reachability probes while waiting for a reboot.
    pub restart_poll_interval: Duration,

    /// How often a running plan checks the state store for a stop request
    /// and renews its lease.
    pub stop_poll_interval: Duration,

    /// A running plan whose lease has not been renewed for this long is
    /// treated as abandoned by a dead process.
    pub lease_ttl: Duration,

    /// Maximum number of nodes driven concurrently within a phase.
    pub max_parallel_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            command_timeout: Duration::from_secs(300),
            reachability_timeout: Duration::from_secs(10),
            restart_timeout: Duration::from_secs(1800),
            restart_poll_interval: Duration::from_secs(10),
            stop_poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(60),
            max_parallel_nodes: 16,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            task_timeout: secs_var("VOLSNAP_TASK_TIMEOUT_SECS", defaults.task_timeout)?,
            command_timeout: secs_var("VOLSNAP_COMMAND_TIMEOUT_SECS", defaults.command_timeout)?,
            reachability_timeout: secs_var(
                "VOLSNAP_PING_TIMEOUT_SECS",
                defaults.reachability_timeout,
            )?,
            restart_timeout: secs_var("VOLSNAP_RESTART_TIMEOUT_SECS", defaults.restart_timeout)?,
            restart_poll_interval: secs_var(
                "VOLSNAP_RESTART_POLL_SECS",
                defaults.restart_poll_interval,
            )?,
            stop_poll_interval: defaults.stop_poll_interval,
            lease_ttl: secs_var("VOLSNAP_LEASE_TTL_SECS", defaults.lease_ttl)?,
            max_parallel_nodes: match std::env::var("VOLSNAP_MAX_PARALLEL_NODES") {
                Ok(v) => v
                    .parse::<usize>()
                    .context("VOLSNAP_MAX_PARALLEL_NODES must be a positive integer")?
                    .max(1),
                Err(_) => defaults.max_parallel_nodes,
            },
        })
    }

    /// Returns the bound applied to a whole task of the given kind.
    ///
    /// Waiting for a reboot polls for up to `restart_timeout`, so it gets that
    /// budget plus one poll interval instead of the generic task timeout.
    pub fn task_budget(&self, waits_for_restart: bool) -> Duration {
        if waits_for_restart {
            self.restart_timeout + self.restart_poll_interval
        } else {
            self.task_timeout
        }
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => {
            let secs: u64 = v
                .parse()
                .with_context(|| format!("{name} must be a whole number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_bounded() {
        let config = EngineConfig::default();
        assert!(config.command_timeout <= config.task_timeout);
        assert!(config.max_parallel_nodes > 0);
        assert!(config.stop_poll_interval < config.lease_ttl);
    }

    #[test]
    fn test_restart_wait_gets_restart_budget() {
        let config = EngineConfig::default();
        assert_eq!(config.task_budget(false), config.task_timeout);
        assert_eq!(
            config.task_budget(true),
            config.restart_timeout + config.restart_poll_interval
        );
    }
}
