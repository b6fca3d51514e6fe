//! Greedy offer matching.
//!
//! An offer satisfies a worker when it carries enough cpus and memory
//! (memory padded by [`MEMORY_OVERHEAD_FACTOR`]), every required agent
//! attribute, and enough host ports for the worker's dynamic port mappings.
//! Malformed resources never fail hard: they are logged and treated as
//! absent.

use std::fmt;

use tracing::{debug, error, info, warn};

use crate::offer::{names, Range, ResourceOffer, ResourceValue, DEFAULT_ROLE};
use crate::spec::WorkerSpec;

/// Extra memory reserved on top of the worker's heap for runtime overhead.
pub const MEMORY_OVERHEAD_FACTOR: f64 = 0.1;

/// Memory (MB) a worker actually asks the cluster for.
pub fn required_memory(memory_mb: u32) -> f64 {
    (1.0 + MEMORY_OVERHEAD_FACTOR) * f64::from(memory_mb)
}

/// Scalar and range resources extracted from one offer.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferResources {
    /// `-1.0` when absent or malformed.
    pub cpus: f64,
    /// `-1.0` when absent or malformed.
    pub mem: f64,
    pub ports: Option<Vec<Range>>,
}

impl OfferResources {
    /// Collects the resources usable by `role`.
    ///
    /// Resources reserved for other roles are skipped.
    pub fn extract(offer: &ResourceOffer, role: &str) -> Self {
        let mut resources = Self {
            cpus: -1.0,
            mem: -1.0,
            ports: None,
        };

        for resource in &offer.resources {
            if resource.role != role && resource.role != DEFAULT_ROLE {
                warn!(
                    offer_id = %offer.id,
                    resource = %resource.name,
                    resource_role = %resource.role,
                    expected_role = %role,
                    "Resource role doesn't match expected role"
                );
                continue;
            }

            match (resource.name.as_str(), &resource.value) {
                (names::CPUS, ResourceValue::Scalar(v)) => resources.cpus = *v,
                (names::MEM, ResourceValue::Scalar(v)) => resources.mem = *v,
                (names::PORTS, ResourceValue::Ranges(ranges)) => {
                    resources.ports = Some(ranges.clone());
                }
                (names::CPUS | names::MEM, other) => {
                    error!(
                        offer_id = %offer.id,
                        resource = %resource.name,
                        value_type = other.type_name(),
                        "Resource was not a scalar"
                    );
                }
                (names::PORTS, other) => {
                    error!(
                        offer_id = %offer.id,
                        value_type = other.type_name(),
                        "Ports resource was not a range"
                    );
                }
                (names::DISK, _) => {}
                (name, _) => debug!(offer_id = %offer.id, resource = name, "Ignoring unknown resource"),
            }
        }

        if resources.cpus < 0.0 {
            debug!(offer_id = %offer.id, "No cpus resource present");
        }
        if resources.mem < 0.0 {
            debug!(offer_id = %offer.id, "No mem resource present");
        }

        resources
    }
}

/// A dimension in which an offer fell short.
#[derive(Debug, Clone, PartialEq)]
pub enum Shortfall {
    Cpus { requested: f64, offered: f64 },
    Mem { requested: f64, offered: f64 },
    Ports { requested: usize, available: usize },
    Attribute { name: String, value: String },
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpus { requested, offered } => {
                write!(f, "cpus: requested {requested}, offered {offered}")
            }
            Self::Mem { requested, offered } => {
                write!(f, "mem: requested {requested}, offered {offered}")
            }
            Self::Ports {
                requested,
                available,
            } => write!(f, "ports: requested {requested}, available {available}"),
            Self::Attribute { name, value } => write!(f, "attribute: {name}={value} not offered"),
        }
    }
}

/// Resources claimed from an offer by a successful match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Host ports for the worker's dynamic port mappings, in order.
    pub ports: Vec<u64>,
}

/// Decides whether offers satisfy worker specs.
#[derive(Debug, Clone)]
pub struct Matcher {
    role: String,
}

impl Matcher {
    /// Create a matcher accepting resources of `role` and `*`.
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Checks every dimension and returns either the allocation or all
    /// shortfalls.
    pub fn evaluate(
        &self,
        offer: &ResourceOffer,
        spec: &WorkerSpec,
    ) -> Result<Allocation, Vec<Shortfall>> {
        let resources = OfferResources::extract(offer, &self.role);
        let mut shortfalls = Vec::new();

        let requested_mem = required_memory(spec.memory_mb);
        if !(spec.cpus <= resources.cpus) {
            shortfalls.push(Shortfall::Cpus {
                requested: spec.cpus,
                offered: resources.cpus,
            });
        }
        if !(requested_mem <= resources.mem) {
            shortfalls.push(Shortfall::Mem {
                requested: requested_mem,
                offered: resources.mem,
            });
        }

        for (name, value) in spec.attributes.unmet(&offer.attributes) {
            shortfalls.push(Shortfall::Attribute {
                name: name.to_string(),
                value: value.to_string(),
            });
        }

        let mut allocation = Allocation::default();
        if spec.has_port_mappings() {
            let wanted = spec.dynamic_port_count();
            match resources.ports.as_deref() {
                Some(ranges) if !ranges.is_empty() => {
                    allocation.ports = find_ports(ranges, wanted);
                    if allocation.ports.len() < wanted {
                        shortfalls.push(Shortfall::Ports {
                            requested: wanted,
                            available: allocation.ports.len(),
                        });
                    }
                }
                _ => {
                    error!(offer_id = %offer.id, "No ports resource present");
                    shortfalls.push(Shortfall::Ports {
                        requested: wanted,
                        available: 0,
                    });
                }
            }
        }

        if shortfalls.is_empty() {
            Ok(allocation)
        } else {
            Err(shortfalls)
        }
    }

    /// Returns true if `offer` satisfies `spec`, logging what was missing
    /// otherwise.
    pub fn matches(&self, offer: &ResourceOffer, spec: &WorkerSpec) -> bool {
        match self.evaluate(offer, spec) {
            Ok(_) => true,
            Err(shortfalls) => {
                log_mismatch(offer, spec, &shortfalls);
                false
            }
        }
    }
}

pub(crate) fn log_mismatch(offer: &ResourceOffer, spec: &WorkerSpec, shortfalls: &[Shortfall]) {
    let reasons: Vec<String> = shortfalls.iter().map(ToString::to_string).collect();
    info!(
        offer_id = %offer.id,
        agent_id = %offer.agent_id,
        worker = %spec.name,
        reasons = %reasons.join("; "),
        "Offer not sufficient for worker request"
    );
}

/// Takes up to `count` ports, walking `ranges` in order.
///
/// Each range contributes sequential ports from its beginning until `count`
/// ports are collected; the walk then moves on to the next range. Fewer than
/// `count` ports are returned if the ranges run out.
pub fn find_ports(ranges: &[Range], count: usize) -> Vec<u64> {
    let mut ports = Vec::with_capacity(count);
    for range in ranges {
        if ports.len() >= count {
            break;
        }
        let wanted = count - ports.len();
        ports.extend((range.begin..=range.end).take(wanted));
    }
    ports
}

/// Role of the offer's ports resource, used when claiming allocated ports.
pub fn find_role_for_ports(offer: &ResourceOffer) -> &str {
    offer
        .resources
        .iter()
        .rev()
        .find(|r| r.name == names::PORTS)
        .map_or(DEFAULT_ROLE, |r| r.role.as_str())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fleet_id::{AgentId, OfferId, TaskId};
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::constraints::AttributeSelector;
    use crate::offer::Resource;
    use crate::spec::{ContainerSpec, PortMapping};

    fn offer(cpus: f64, mem: f64) -> ResourceOffer {
        ResourceOffer::new(
            OfferId::parse("offer-1").unwrap(),
            AgentId::parse("agent-1").unwrap(),
        )
        .with_scalar(names::CPUS, cpus)
        .with_scalar(names::MEM, mem)
    }

    fn spec(cpus: f64, memory_mb: u32) -> WorkerSpec {
        WorkerSpec::new(TaskId::parse("worker-1").unwrap(), cpus, memory_mb)
    }

    fn with_ports(spec: WorkerSpec, dynamic: usize) -> WorkerSpec {
        let mut container = ContainerSpec::docker("agent:latest");
        container.port_mappings = (0..dynamic)
            .map(|i| PortMapping {
                container_port: 8000 + i as u32,
                host_port: None,
                protocol: "tcp".to_string(),
            })
            .collect();
        spec.with_container(container)
    }

    #[rstest]
    #[case(1.0, 1000, 1.0, 1100.0, true)]
    #[case(1.0, 1000, 1.0, 1099.0, false)]
    #[case(2.0, 100, 1.5, 4096.0, false)]
    #[case(0.0, 0, 0.0, 0.0, true)]
    fn test_scalar_matching(
        #[case] cpus: f64,
        #[case] memory_mb: u32,
        #[case] offered_cpus: f64,
        #[case] offered_mem: f64,
        #[case] expected: bool,
    ) {
        let matcher = Matcher::new("*");
        assert_eq!(
            matcher.matches(&offer(offered_cpus, offered_mem), &spec(cpus, memory_mb)),
            expected
        );
    }

    #[test]
    fn test_missing_resources_never_match() {
        let matcher = Matcher::new("*");
        let bare = ResourceOffer::new(
            OfferId::parse("offer-1").unwrap(),
            AgentId::parse("agent-1").unwrap(),
        );
        let shortfalls = matcher.evaluate(&bare, &spec(0.0, 0)).unwrap_err();
        assert_eq!(shortfalls.len(), 2);
    }

    #[test]
    fn test_non_scalar_cpus_treated_as_absent() {
        let matcher = Matcher::new("*");
        let offer = ResourceOffer::new(
            OfferId::parse("offer-1").unwrap(),
            AgentId::parse("agent-1").unwrap(),
        )
        .with_ranges(names::CPUS, vec![Range::new(1, 4)])
        .with_scalar(names::MEM, 4096.0);

        let shortfalls = matcher.evaluate(&offer, &spec(0.5, 128)).unwrap_err();
        assert_eq!(
            shortfalls,
            vec![Shortfall::Cpus {
                requested: 0.5,
                offered: -1.0
            }]
        );
    }

    #[test]
    fn test_foreign_role_resources_are_ignored() {
        let offer = ResourceOffer::new(
            OfferId::parse("offer-1").unwrap(),
            AgentId::parse("agent-1").unwrap(),
        )
        .with_resource(Resource::scalar(names::CPUS, 8.0).with_role("analytics"))
        .with_scalar(names::MEM, 8192.0);

        assert!(!Matcher::new("ci").matches(&offer, &spec(1.0, 512)));
        assert!(Matcher::new("analytics").matches(&offer, &spec(1.0, 512)));
    }

    #[test]
    fn test_attribute_mismatch_reported() {
        let matcher = Matcher::new("*");
        let offer = offer(4.0, 8192.0).with_attribute("os", "linux");
        let spec = spec(1.0, 512).with_attributes(AttributeSelector::new().with("os", "windows"));

        let shortfalls = matcher.evaluate(&offer, &spec).unwrap_err();
        assert_eq!(
            shortfalls,
            vec![Shortfall::Attribute {
                name: "os".to_string(),
                value: "windows".to_string()
            }]
        );
    }

    #[test]
    fn test_port_allocation_single_range() {
        assert_eq!(find_ports(&[Range::new(31000, 32000)], 1), vec![31000]);
    }

    #[test]
    fn test_port_allocation_advances_past_single_width_range() {
        let ranges = [Range::single(31000), Range::new(31005, 32000)];
        assert_eq!(find_ports(&ranges, 2), vec![31000, 31005]);
    }

    #[test]
    fn test_port_allocation_many_single_width_ranges() {
        let ranges: Vec<_> = (0..1000).map(|i| Range::single(40000 + i * 2)).collect();
        let ports = find_ports(&ranges, 3);
        assert_eq!(ports, vec![40000, 40002, 40004]);
    }

    #[test]
    fn test_port_allocation_exhausted() {
        let ranges = [Range::single(31000), Range::single(31001)];
        assert_eq!(find_ports(&ranges, 5), vec![31000, 31001]);
        assert!(find_ports(&[], 1).is_empty());
    }

    #[test]
    fn test_port_allocation_at_integer_limit() {
        assert_eq!(find_ports(&[Range::single(u64::MAX)], 2), vec![u64::MAX]);
    }

    #[test]
    fn test_ports_required_but_absent() {
        let matcher = Matcher::new("*");
        let spec = with_ports(spec(1.0, 512), 1);
        assert!(!matcher.matches(&offer(4.0, 8192.0), &spec));
    }

    #[test]
    fn test_ports_allocated_on_match() {
        let matcher = Matcher::new("*");
        let offer = offer(4.0, 8192.0)
            .with_ranges(names::PORTS, vec![Range::single(31000), Range::new(31005, 31010)]);
        let allocation = matcher.evaluate(&offer, &with_ports(spec(1.0, 512), 2)).unwrap();
        assert_eq!(allocation.ports, vec![31000, 31005]);
    }

    #[test]
    fn test_ports_insufficient() {
        let matcher = Matcher::new("*");
        let offer = offer(4.0, 8192.0).with_ranges(names::PORTS, vec![Range::single(31000)]);
        let shortfalls = matcher
            .evaluate(&offer, &with_ports(spec(1.0, 512), 2))
            .unwrap_err();
        assert_eq!(
            shortfalls,
            vec![Shortfall::Ports {
                requested: 2,
                available: 1
            }]
        );
    }

    #[test]
    fn test_find_role_for_ports() {
        let offer = offer(1.0, 1.0)
            .with_resource(Resource::ranges(names::PORTS, vec![Range::single(1)]).with_role("ci"));
        assert_eq!(find_role_for_ports(&offer), "ci");
        assert_eq!(find_role_for_ports(&offer_without_ports()), DEFAULT_ROLE);
    }

    fn offer_without_ports() -> ResourceOffer {
        offer(1.0, 1.0)
    }

    fn attributes() -> impl Strategy<Value = BTreeMap<String, String>> {
        prop::collection::btree_map("[a-c]", "[x-z]", 0..3)
    }

    proptest! {
        #[test]
        fn test_match_iff_all_dimensions_fit(
            cpus in 0.0f64..8.0,
            memory_mb in 0u32..8192,
            offered_cpus in 0.0f64..8.0,
            offered_mem in 0.0f64..10000.0,
            required in attributes(),
            offered in attributes(),
        ) {
            let mut selector = AttributeSelector::new();
            for (k, v) in &required {
                selector = selector.with(k.clone(), v.clone());
            }
            let mut offer = offer(offered_cpus, offered_mem);
            for (k, v) in &offered {
                offer = offer.with_attribute(k.clone(), v.clone());
            }
            let spec = spec(cpus, memory_mb).with_attributes(selector);

            let expected = cpus <= offered_cpus
                && f64::from(memory_mb) * 1.1 <= offered_mem
                && required.iter().all(|(k, v)| offered.get(k) == Some(v));

            prop_assert_eq!(Matcher::new("*").matches(&offer, &spec), expected);
        }
    }
}
