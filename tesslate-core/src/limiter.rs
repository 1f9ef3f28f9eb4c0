//! Thread-safe global and per-run resource limiter (§4.E).
//!
//! A process-wide singleton in production (constructed once, handed out by
//! reference — §9 "Global mutable state"); the type itself holds no
//! process-global state so tests can construct independent instances.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub max_cost_cents: i64,
    pub max_iterations: u64,
    pub max_cost_per_run_cents: i64,
    pub max_iterations_per_run: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_cost_cents: 2000,
            max_iterations: 1000,
            max_cost_per_run_cents: 500,
            max_iterations_per_run: 50,
        }
    }
}

impl From<tesslate_config::ResourceLimitsConfig> for LimiterConfig {
    fn from(cfg: tesslate_config::ResourceLimitsConfig) -> Self {
        Self {
            max_cost_cents: cfg.max_cost_cents,
            max_iterations: cfg.max_iterations,
            max_cost_per_run_cents: cfg.max_cost_per_run_cents,
            max_iterations_per_run: cfg.max_iterations_per_run,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceLimitExceeded {
    #[error("global cost cap exceeded: {current}c > {max}c")]
    GlobalCost { current: i64, max: i64 },
    #[error("global iteration cap exceeded: {current} > {max}")]
    GlobalIterations { current: u64, max: u64 },
    #[error("per-run cost cap exceeded for run {run_id}: {current}c > {max}c")]
    RunCost {
        run_id: String,
        current: i64,
        max: i64,
    },
    #[error("per-run iteration cap exceeded for run {run_id}: {current} > {max}")]
    RunIterations {
        run_id: String,
        current: u64,
        max: u64,
    },
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub cost_cents: i64,
    pub iterations: u64,
}

#[derive(Debug, Default)]
struct Global {
    cost_cents: i64,
    iterations: u64,
}

/// Tracks global spend/iterations plus a per-run breakdown, all mutex- or
/// DashMap-guarded so concurrent runs never race on the same counters.
pub struct ResourceLimiter {
    config: LimiterConfig,
    global: Mutex<Global>,
    per_run: DashMap<String, Stats>,
}

impl ResourceLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            global: Mutex::new(Global::default()),
            per_run: DashMap::new(),
        }
    }

    /// Add to the global (and, if given, per-run) cost counter, returning
    /// an error without reverting the increment if a cap is breached — the
    /// spend already happened; the caller decides whether to terminate.
    pub fn add_cost(
        &self,
        amount_cents: i64,
        run_id: Option<&str>,
    ) -> Result<(), ResourceLimitExceeded> {
        {
            let mut global = self.global.lock().expect("limiter mutex poisoned");
            global.cost_cents += amount_cents;
        }
        if let Some(run_id) = run_id {
            self.per_run
                .entry(run_id.to_string())
                .or_default()
                .cost_cents += amount_cents;
        }
        self.check_limits(run_id)
    }

    pub fn add_iteration(&self, run_id: Option<&str>) -> Result<(), ResourceLimitExceeded> {
        {
            let mut global = self.global.lock().expect("limiter mutex poisoned");
            global.iterations += 1;
        }
        if let Some(run_id) = run_id {
            self.per_run
                .entry(run_id.to_string())
                .or_default()
                .iterations += 1;
        }
        self.check_limits(run_id)
    }

    pub fn check_limits(&self, run_id: Option<&str>) -> Result<(), ResourceLimitExceeded> {
        let global = self.global.lock().expect("limiter mutex poisoned");
        if global.cost_cents > self.config.max_cost_cents {
            return Err(ResourceLimitExceeded::GlobalCost {
                current: global.cost_cents,
                max: self.config.max_cost_cents,
            });
        }
        if global.iterations > self.config.max_iterations {
            return Err(ResourceLimitExceeded::GlobalIterations {
                current: global.iterations,
                max: self.config.max_iterations,
            });
        }
        drop(global);
        if let Some(run_id) = run_id {
            if let Some(stats) = self.per_run.get(run_id) {
                if stats.cost_cents > self.config.max_cost_per_run_cents {
                    return Err(ResourceLimitExceeded::RunCost {
                        run_id: run_id.to_string(),
                        current: stats.cost_cents,
                        max: self.config.max_cost_per_run_cents,
                    });
                }
                if stats.iterations > self.config.max_iterations_per_run {
                    return Err(ResourceLimitExceeded::RunIterations {
                        run_id: run_id.to_string(),
                        current: stats.iterations,
                        max: self.config.max_iterations_per_run,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get_stats(&self, run_id: Option<&str>) -> Stats {
        match run_id {
            Some(run_id) => self.per_run.get(run_id).map(|s| *s).unwrap_or_default(),
            None => {
                let global = self.global.lock().expect("limiter mutex poisoned");
                Stats {
                    cost_cents: global.cost_cents,
                    iterations: global.iterations,
                }
            }
        }
    }

    /// Free the per-run entry; the global counters retain whatever that
    /// run spent (§8 invariant 6).
    pub fn cleanup_run(&self, run_id: &str) {
        self.per_run.remove(run_id);
    }

    pub fn reset(&self) {
        *self.global.lock().expect("limiter mutex poisoned") = Global::default();
        self.per_run.clear();
    }
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_cost_updates_global_and_per_run() {
        let limiter = ResourceLimiter::new(LimiterConfig {
            max_cost_cents: 1000,
            ..Default::default()
        });
        limiter.add_cost(100, Some("run-1")).unwrap();
        assert_eq!(limiter.get_stats(Some("run-1")).cost_cents, 100);
        assert_eq!(limiter.get_stats(None).cost_cents, 100);
    }

    #[test]
    fn cleanup_run_frees_per_run_but_keeps_global() {
        let limiter = ResourceLimiter::default();
        limiter.add_cost(500, Some("run-1")).unwrap();
        limiter.cleanup_run("run-1");
        assert_eq!(limiter.get_stats(Some("run-1")).cost_cents, 0);
        assert_eq!(limiter.get_stats(None).cost_cents, 500);
    }

    #[test]
    fn breaches_global_cost_cap() {
        let limiter = ResourceLimiter::new(LimiterConfig {
            max_cost_cents: 100,
            ..Default::default()
        });
        let err = limiter.add_cost(200, None).unwrap_err();
        assert!(matches!(err, ResourceLimitExceeded::GlobalCost { .. }));
    }

    #[test]
    fn breaches_per_run_iteration_cap() {
        let limiter = ResourceLimiter::new(LimiterConfig {
            max_iterations_per_run: 2,
            ..Default::default()
        });
        limiter.add_iteration(Some("run-1")).unwrap();
        limiter.add_iteration(Some("run-1")).unwrap();
        let err = limiter.add_iteration(Some("run-1")).unwrap_err();
        assert!(matches!(err, ResourceLimitExceeded::RunIterations { .. }));
    }

    #[test]
    fn reset_clears_everything() {
        let limiter = ResourceLimiter::default();
        limiter.add_cost(10, Some("run-1")).unwrap();
        limiter.reset();
        assert_eq!(limiter.get_stats(None).cost_cents, 0);
        assert_eq!(limiter.get_stats(Some("run-1")).cost_cents, 0);
    }
}
