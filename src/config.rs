//! Configuration types.
//!
//! Everything is read from environment variables once at startup and passed
//! explicitly to the scheduler and agent constructors.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::model::Operator;

/// Simulated latency per operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimes {
    pub addition: Duration,
    pub subtraction: Duration,
    pub multiplication: Duration,
    pub division: Duration,
}

impl Default for OperationTimes {
    fn default() -> Self {
        Self {
            addition: Duration::from_millis(3000),
            subtraction: Duration::from_millis(3000),
            multiplication: Duration::from_millis(5000),
            division: Duration::from_millis(5000),
        }
    }
}

impl OperationTimes {
    /// No simulated latency at all (tests, local runs).
    pub fn zero() -> Self {
        Self {
            addition: Duration::ZERO,
            subtraction: Duration::ZERO,
            multiplication: Duration::ZERO,
            division: Duration::ZERO,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addition: env_millis("TIME_ADDITION_MS", defaults.addition),
            subtraction: env_millis("TIME_SUBTRACTION_MS", defaults.subtraction),
            multiplication: env_millis("TIME_MULTIPLICATIONS_MS", defaults.multiplication),
            division: env_millis("TIME_DIVISIONS_MS", defaults.division),
        }
    }

    /// Latency configured for `operator`.
    pub fn for_operator(&self, operator: Operator) -> Duration {
        match operator {
            Operator::Add => self.addition,
            Operator::Subtract => self.subtraction,
            Operator::Multiply => self.multiplication,
            Operator::Divide => self.division,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Latency stamped onto each task at build time.
    pub operation_times: OperationTimes,
    /// How long a claim stays valid, on top of the task's operation time,
    /// before the task returns to pending.
    pub lease_timeout: Duration,
    /// Interval of the background sweep that releases expired claims.
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            operation_times: OperationTimes::default(),
            lease_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            operation_times: OperationTimes::from_env(),
            lease_timeout: env_secs("DISTCALC_LEASE_TIMEOUT_SECS", defaults.lease_timeout),
            sweep_interval: env_secs("DISTCALC_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
        }
    }
}

/// Orchestrator process settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub port: u16,
    pub db_path: String,
    pub scheduler: SchedulerConfig,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("DISTCALC_PORT", 8080),
            db_path: std::env::var("DISTCALC_DB_PATH")
                .unwrap_or_else(|_| "./data/distcalc.db".to_string()),
            scheduler: SchedulerConfig::from_env(),
        }
    }
}

/// Worker agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the orchestrator, e.g. `http://localhost:8080`.
    pub orchestrator_url: String,
    /// Number of concurrent worker loops.
    pub computing_power: usize,
    /// Initial wait after an empty claim.
    pub poll_interval: Duration,
    /// Back-off ceiling for repeated empty claims.
    pub max_poll_interval: Duration,
    /// Operators this agent accepts. Empty means all.
    pub operators: Vec<Operator>,
    /// Sleep for each task's configured latency before submitting.
    pub simulate_latency: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: "http://localhost:8080".to_string(),
            computing_power: 4,
            poll_interval: Duration::from_millis(1000),
            max_poll_interval: Duration::from_millis(8000),
            operators: Vec::new(),
            simulate_latency: true,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let operators: Vec<Operator> = std::env::var("AGENT_OPERATORS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse() {
                Ok(op) => Some(op),
                Err(e) => {
                    warn!(value = s, error = %e, "Ignoring unknown operator in AGENT_OPERATORS");
                    None
                }
            })
            .collect();

        let computing_power = env_parse("COMPUTING_POWER", defaults.computing_power).max(1);

        Self {
            orchestrator_url: std::env::var("ORCHESTRATOR_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.orchestrator_url),
            computing_power,
            poll_interval: env_millis("AGENT_POLL_INTERVAL_MS", defaults.poll_interval),
            max_poll_interval: env_millis("AGENT_MAX_POLL_INTERVAL_MS", defaults.max_poll_interval),
            operators,
            simulate_latency: env_parse("AGENT_SIMULATE_LATENCY", defaults.simulate_latency),
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn env_parse<T: FromStr + std::fmt::Debug>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = ?default, "Invalid value, using default");
            default
        }),
        _ => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_operation_times() {
        let times = OperationTimes::default();
        assert_eq!(times.for_operator(Operator::Add), Duration::from_millis(3000));
        assert_eq!(times.for_operator(Operator::Subtract), Duration::from_millis(3000));
        assert_eq!(times.for_operator(Operator::Multiply), Duration::from_millis(5000));
        assert_eq!(times.for_operator(Operator::Divide), Duration::from_millis(5000));
    }

    #[test]
    fn zero_operation_times() {
        let times = OperationTimes::zero();
        assert!(Operator::ALL
            .iter()
            .all(|op| times.for_operator(*op) == Duration::ZERO));
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // Unique keys so parallel tests don't interfere.
        unsafe {
            std::env::set_var("DISTCALC_TEST_PARSE_OK", "42");
            std::env::set_var("DISTCALC_TEST_PARSE_BAD", "forty-two");
        }
        assert_eq!(env_parse("DISTCALC_TEST_PARSE_OK", 7u64), 42);
        assert_eq!(env_parse("DISTCALC_TEST_PARSE_BAD", 7u64), 7);
        assert_eq!(env_parse("DISTCALC_TEST_PARSE_UNSET", 7u64), 7);
    }

    #[test]
    fn env_millis_reads_milliseconds() {
        unsafe {
            std::env::set_var("DISTCALC_TEST_MILLIS", "250");
        }
        assert_eq!(
            env_millis("DISTCALC_TEST_MILLIS", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn scheduler_defaults() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.lease_timeout, Duration::from_secs(30));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(10));
    }

    #[test]
    fn agent_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.computing_power, 4);
        assert!(cfg.operators.is_empty());
        assert!(cfg.simulate_latency);
        assert!(cfg.poll_interval < cfg.max_poll_interval);
    }
}
