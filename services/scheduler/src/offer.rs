//! Resource offers as delivered by the cluster resource manager.
//!
//! Offers are immutable once received. The scheduler only ever holds them
//! transiently: until they are matched, rescinded, or declined.

use chrono::{DateTime, Utc};
use fleet_id::{AgentId, OfferId};
use serde::{Deserialize, Serialize};

/// Role that matches every framework role.
pub const DEFAULT_ROLE: &str = "*";

/// Well-known resource names.
pub mod names {
    pub const CPUS: &str = "cpus";
    pub const MEM: &str = "mem";
    pub const DISK: &str = "disk";
    pub const PORTS: &str = "ports";
}

/// An inclusive integer range, e.g. a port range `[31000, 32000]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// A range containing exactly one value.
    pub const fn single(value: u64) -> Self {
        Self {
            begin: value,
            end: value,
        }
    }
}

/// The typed value of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<Range>),
    Set(Vec<String>),
}

impl ResourceValue {
    /// Name of the value type, for log messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Ranges(_) => "ranges",
            Self::Set(_) => "set",
        }
    }
}

/// A named resource carried by an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub role: String,
    pub value: ResourceValue,
}

impl Resource {
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            role: DEFAULT_ROLE.to_string(),
            value: ResourceValue::Scalar(value),
        }
    }

    pub fn ranges(name: impl Into<String>, ranges: Vec<Range>) -> Self {
        Self {
            name: name.into(),
            role: DEFAULT_ROLE.to_string(),
            value: ResourceValue::Ranges(ranges),
        }
    }

    /// Returns this resource reserved for `role`.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

/// A text attribute reported by the agent, used for placement constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// A maintenance window announced for the offering agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailability {
    pub start: DateTime<Utc>,
    /// `None` means the agent is unavailable indefinitely from `start`.
    pub end: Option<DateTime<Utc>>,
}

impl Unavailability {
    /// Returns true if `now` falls inside the window.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        if now < self.start {
            return false;
        }
        match self.end {
            Some(end) => now < end,
            None => true,
        }
    }
}

/// A time-limited grant of resources on one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Vec<Resource>,
    pub attributes: Vec<Attribute>,
    pub unavailability: Option<Unavailability>,
}

impl ResourceOffer {
    /// Create an empty offer.
    pub fn new(id: OfferId, agent_id: AgentId) -> Self {
        Self {
            id,
            agent_id,
            hostname: String::new(),
            resources: Vec::new(),
            attributes: Vec::new(),
            unavailability: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_scalar(self, name: &str, value: f64) -> Self {
        self.with_resource(Resource::scalar(name, value))
    }

    pub fn with_ranges(self, name: &str, ranges: Vec<Range>) -> Self {
        self.with_resource(Resource::ranges(name, ranges))
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_unavailability(mut self, unavailability: Unavailability) -> Self {
        self.unavailability = Some(unavailability);
        self
    }

    /// Returns false while the agent is inside an announced maintenance window.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self
            .unavailability
            .as_ref()
            .is_some_and(|window| window.covers(now))
    }

    /// Looks up the first resource with `name`.
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> ResourceOffer {
        ResourceOffer::new(
            OfferId::parse("offer-1").unwrap(),
            AgentId::parse("agent-1").unwrap(),
        )
    }

    #[test]
    fn test_offer_without_window_is_available() {
        assert!(offer().is_available(Utc::now()));
    }

    #[test]
    fn test_offer_inside_window_is_unavailable() {
        let now = Utc::now();
        let offer = offer().with_unavailability(Unavailability {
            start: now - chrono::Duration::minutes(5),
            end: Some(now + chrono::Duration::minutes(5)),
        });
        assert!(!offer.is_available(now));
        assert!(offer.is_available(now + chrono::Duration::minutes(6)));
    }

    #[test]
    fn test_open_ended_window() {
        let now = Utc::now();
        let offer = offer().with_unavailability(Unavailability {
            start: now - chrono::Duration::seconds(1),
            end: None,
        });
        assert!(!offer.is_available(now));
        assert!(offer.is_available(now - chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_resource_value_json_shape() {
        let resource = Resource::ranges(names::PORTS, vec![Range::new(31000, 32000)]);
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["value"]["type"], "ranges");
        assert_eq!(json["value"]["value"][0]["begin"], 31000);
    }
}
