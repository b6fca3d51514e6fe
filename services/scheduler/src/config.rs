//! Configuration for the fleet scheduler.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::constraints::LabelConstraints;
use crate::driver::FrameworkInfo;
use crate::offer::DEFAULT_ROLE;
use crate::offer_buffer::{DEFAULT_CAPACITY, DEFAULT_OFFER_WAIT};
use crate::online::DEFAULT_POLL_INTERVAL;

/// Refusal window for offers that did not fit, so they come back soon.
pub const SHORT_DECLINE: Duration = Duration::from_secs(1);

/// Default refusal window when nothing is waiting for offers.
pub const DEFAULT_DECLINE_OFFER: Duration = Duration::from_secs(600);

/// Default number of recently used agents preferred when matching.
pub const DEFAULT_AFFINITY_CACHE_SIZE: usize = 10;

/// Default capacity of the command session queue.
pub const DEFAULT_COMMAND_QUEUE_SIZE: usize = 16;

/// Default time to wait for a worker to come online.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Scheduler service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster master URL.
    pub master_url: String,

    /// Name the framework registers under.
    pub framework_name: String,

    /// Resource role accepted besides `*`.
    pub role: String,

    /// User tasks run as; empty for the cluster default.
    pub user: String,

    /// Framework principal.
    pub principal: String,

    /// Base URL agents connect back to.
    pub controller_url: String,

    /// Offer buffer capacity (0 = unbounded).
    pub offer_queue_capacity: usize,

    /// How long the processing thread waits for offers.
    pub offer_wait: Duration,

    /// Refusal window when no request is pending.
    pub decline_offer: Duration,

    /// Process offers on a dedicated thread.
    pub multi_threaded: bool,

    /// Let the supervisor stop the session when idle.
    pub on_demand_registration: bool,

    pub affinity_cache_size: usize,

    /// Attribute constraints per worker label.
    pub label_constraints: LabelConstraints,

    pub session: SessionSettings,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let offer_queue_capacity =
            parse_or(&lookup, "FLEET_OFFER_QUEUE_CAPACITY", DEFAULT_CAPACITY)?;
        let offer_wait_secs =
            parse_or(&lookup, "FLEET_OFFER_WAIT_SECS", DEFAULT_OFFER_WAIT.as_secs())?;
        let decline_offer_secs =
            parse_or(&lookup, "FLEET_DECLINE_OFFER_SECS", DEFAULT_DECLINE_OFFER.as_secs())?;
        let affinity_cache_size =
            parse_or(&lookup, "FLEET_AFFINITY_CACHE_SIZE", DEFAULT_AFFINITY_CACHE_SIZE)?;
        let command_queue_size =
            parse_or(&lookup, "FLEET_COMMAND_QUEUE_SIZE", DEFAULT_COMMAND_QUEUE_SIZE)?;
        let agent_timeout_secs =
            parse_or(&lookup, "FLEET_AGENT_TIMEOUT_SECS", DEFAULT_AGENT_TIMEOUT.as_secs())?;

        let multi_threaded = parse_bool(&lookup, "FLEET_MULTI_THREADED", false)?;
        let on_demand_registration = parse_bool(&lookup, "FLEET_ON_DEMAND_REGISTRATION", true)?;

        // Malformed constraints are logged and ignored
        let label_constraints =
            LabelConstraints::parse_lenient(&lookup("FLEET_SLAVE_ATTRIBUTES").unwrap_or_default());

        let session = SessionSettings::default()
            .with_command_queue_size(command_queue_size)
            .with_agent_timeout(Duration::from_secs(agent_timeout_secs));

        Ok(Self {
            master_url: string("FLEET_MASTER_URL", "http://127.0.0.1:5050"),
            framework_name: string("FLEET_FRAMEWORK_NAME", "fleet-scheduler"),
            role: string("FLEET_ROLE", DEFAULT_ROLE),
            user: string("FLEET_USER", ""),
            principal: string("FLEET_PRINCIPAL", "fleet"),
            controller_url: string("FLEET_CONTROLLER_URL", "http://127.0.0.1:8080/"),
            offer_queue_capacity,
            offer_wait: Duration::from_secs(offer_wait_secs),
            decline_offer: Duration::from_secs(decline_offer_secs),
            multi_threaded,
            on_demand_registration,
            affinity_cache_size,
            label_constraints,
            session,
            log_level: string("FLEET_LOG_LEVEL", "info"),
        })
    }

    /// Identity to register the framework with.
    pub fn framework_info(&self) -> FrameworkInfo {
        FrameworkInfo {
            name: self.framework_name.clone(),
            user: self.user.clone(),
            role: self.role.clone(),
            principal: self.principal.clone(),
            id: None,
        }
    }

    /// Settings for the scheduler core.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            role: self.role.clone(),
            controller_url: self.controller_url.clone(),
            offer_queue_capacity: self.offer_queue_capacity,
            offer_wait: self.offer_wait,
            decline_offer: self.decline_offer,
            multi_threaded: self.multi_threaded,
            on_demand_registration: self.on_demand_registration,
            affinity_cache_size: self.affinity_cache_size,
            label_constraints: self.label_constraints.clone(),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid value for {key}: {raw:?}"),
    }
}

/// Settings for the scheduler core.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub role: String,
    pub controller_url: String,
    pub offer_queue_capacity: usize,
    pub offer_wait: Duration,
    pub decline_offer: Duration,
    pub multi_threaded: bool,
    pub on_demand_registration: bool,
    pub affinity_cache_size: usize,
    pub label_constraints: LabelConstraints,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            role: DEFAULT_ROLE.to_string(),
            controller_url: "http://127.0.0.1:8080/".to_string(),
            offer_queue_capacity: DEFAULT_CAPACITY,
            offer_wait: DEFAULT_OFFER_WAIT,
            decline_offer: DEFAULT_DECLINE_OFFER,
            multi_threaded: false,
            on_demand_registration: true,
            affinity_cache_size: DEFAULT_AFFINITY_CACHE_SIZE,
            label_constraints: LabelConstraints::default(),
        }
    }
}

/// Operator settings for the asynchronous front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Commands buffered before new ones are dropped.
    pub command_queue_size: usize,

    /// How long to wait for a launched worker to come online.
    pub agent_timeout: Duration,

    /// Time between online probes.
    pub poll_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_queue_size: DEFAULT_COMMAND_QUEUE_SIZE,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl SessionSettings {
    /// Zero is raised to one; the queue always holds at least one command.
    pub fn with_command_queue_size(mut self, size: usize) -> Self {
        self.command_queue_size = size.max(1);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.master_url, "http://127.0.0.1:5050");
        assert_eq!(config.role, "*");
        assert_eq!(config.offer_queue_capacity, 100);
        assert_eq!(config.decline_offer, Duration::from_secs(600));
        assert!(!config.multi_threaded);
        assert!(config.on_demand_registration);
        assert!(config.label_constraints.is_empty());
        assert_eq!(config.session, SessionSettings::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("FLEET_ROLE", "ci"),
            ("FLEET_MULTI_THREADED", "true"),
            ("FLEET_OFFER_QUEUE_CAPACITY", "0"),
            ("FLEET_COMMAND_QUEUE_SIZE", "1"),
            ("FLEET_SLAVE_ATTRIBUTES", r#"{"linux": {"os": "ubuntu"}}"#),
        ])
        .unwrap();

        assert_eq!(config.role, "ci");
        assert!(config.multi_threaded);
        assert_eq!(config.offer_queue_capacity, 0);
        assert_eq!(config.session.command_queue_size, 1);
        assert!(config.label_constraints.selector_for("linux").is_some());

        let settings = config.scheduler_settings();
        assert_eq!(settings.role, "ci");
        assert_eq!(config.framework_info().principal, "fleet");
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = load(&[("FLEET_OFFER_WAIT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("FLEET_OFFER_WAIT_SECS"));
    }

    #[test]
    fn test_invalid_bool_is_an_error() {
        assert!(load(&[("FLEET_MULTI_THREADED", "maybe")]).is_err());
    }

    #[test]
    fn test_malformed_constraints_are_ignored() {
        let config = load(&[("FLEET_SLAVE_ATTRIBUTES", "{oops")]).unwrap();
        assert!(config.label_constraints.is_empty());
    }
}
