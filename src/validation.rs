//! Kind-specific validation, run before any store mutation.
//!
//! Failures are reported as a single `InvalidInput` listing every problem
//! found, separated by `; `.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::api::{Event, Log, Node, Pod};
use crate::cloud::{CloudClient, SubnetAttributes};
use crate::config::ValidationConfig;
use crate::error::{RegistryError, Result};
use crate::registry::PodValidator;

/// An IPv4 network in `a.b.c.d/len` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix_len: u8,
}

impl Cidr {
    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - n),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(addr) & self.mask()) == self.network
    }
}

impl FromStr for Cidr {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RegistryError::InvalidInput(format!("invalid CIDR {:?}", s));
        let (addr, len) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = len.parse().map_err(|_| invalid())?;
        if prefix_len > 32 {
            return Err(invalid());
        }
        let mut cidr = Cidr {
            network: 0,
            prefix_len,
        };
        cidr.network = u32::from(addr) & cidr.mask();
        Ok(cidr)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends.
pub fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}

/// RFC 1123 subdomain: dot-separated labels, at most 253 bytes.
pub fn is_dns_subdomain(s: &str) -> bool {
    s.len() <= 253 && s.split('.').all(is_dns_label)
}

#[derive(Default)]
struct Problems(Vec<String>);

impl Problems {
    fn push(&mut self, problem: impl Into<String>) {
        self.0.push(problem.into());
    }

    fn check(&mut self, ok: bool, problem: impl FnOnce() -> String) {
        if !ok {
            self.0.push(problem());
        }
    }

    fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::InvalidInput(self.0.join("; ")))
        }
    }
}

fn check_names(problems: &mut Problems, namespace: Option<&str>, name: &str) {
    problems.check(is_dns_subdomain(name), || {
        format!("name {:?} is not a valid DNS subdomain", name)
    });
    if let Some(ns) = namespace {
        problems.check(is_dns_label(ns), || {
            format!("namespace {:?} is not a valid DNS label", ns)
        });
    }
}

pub fn validate_node(node: &Node) -> Result<()> {
    let mut problems = Problems::default();
    check_names(&mut problems, None, &node.metadata.name);
    problems.check(!node.spec.instance_type.is_empty(), || {
        "spec.instanceType is required".to_string()
    });
    problems.check(!node.spec.boot_image.is_empty(), || {
        "spec.bootImage is required".to_string()
    });
    problems.into_result()
}

pub fn validate_event(event: &Event) -> Result<()> {
    let mut problems = Problems::default();
    check_names(
        &mut problems,
        event.metadata.namespace.as_deref(),
        &event.metadata.name,
    );
    problems.check(!event.involved_object.kind.is_empty(), || {
        "involvedObject.kind is required".to_string()
    });
    problems.check(!event.involved_object.name.is_empty(), || {
        "involvedObject.name is required".to_string()
    });
    problems.check(!event.reason.is_empty(), || "reason is required".to_string());
    problems.into_result()
}

pub fn validate_log(log: &Log) -> Result<()> {
    let mut problems = Problems::default();
    check_names(
        &mut problems,
        log.metadata.namespace.as_deref(),
        &log.metadata.name,
    );
    problems.check(!log.parent_object.name.is_empty(), || {
        "parentObject.name is required".to_string()
    });
    problems.into_result()
}

/// Pod validation against the cluster's current network and instance
/// constraints.
///
/// Subnets are cached from the cloud and refreshed with [`refresh`].
///
/// [`refresh`]: StatefulValidator::refresh
pub struct StatefulValidator {
    cloud: Arc<dyn CloudClient>,
    vpc_cidrs: Vec<Cidr>,
    default_instance_type: String,
    allowed_instance_types: BTreeSet<String>,
    subnets: RwLock<Vec<SubnetAttributes>>,
}

impl StatefulValidator {
    /// Build a validator and load the current subnets from `cloud`.
    pub async fn connect(cloud: Arc<dyn CloudClient>, config: &ValidationConfig) -> Result<Self> {
        let vpc_cidrs = config
            .vpc_cidrs
            .iter()
            .map(|c| c.parse())
            .collect::<Result<Vec<Cidr>>>()?;
        let validator = Self {
            cloud,
            vpc_cidrs,
            default_instance_type: config.default_instance_type.clone(),
            allowed_instance_types: config.allowed_instance_types.iter().cloned().collect(),
            subnets: RwLock::new(Vec::new()),
        };
        validator.refresh().await?;
        Ok(validator)
    }

    /// Reload subnet status from the cloud.
    pub async fn refresh(&self) -> Result<()> {
        let subnets = self.cloud.subnets().await?;
        info!(count = subnets.len(), "loaded subnet status");
        *self.subnets.write() = subnets;
        Ok(())
    }

    fn check_network(&self, problems: &mut Problems, pod: &Pod) {
        let subnets = self.subnets.read();
        let placement = &pod.spec.placement;

        let subnet = match &placement.subnet_id {
            Some(id) => match subnets.iter().find(|s| &s.id == id) {
                Some(subnet) => Some(subnet),
                None => {
                    problems.push(format!("placement.subnetId {:?} does not exist", id));
                    None
                }
            },
            None => None,
        };

        if let (Some(subnet), Some(zone)) = (subnet, &placement.availability_zone) {
            problems.check(&subnet.availability_zone == zone, || {
                format!(
                    "subnet {} is in {}, not {}",
                    subnet.id, subnet.availability_zone, zone
                )
            });
        }

        let Some(ip) = &pod.spec.private_ip else {
            return;
        };
        let Ok(addr) = ip.parse::<Ipv4Addr>() else {
            problems.push(format!("privateIp {:?} is not an IPv4 address", ip));
            return;
        };
        problems.check(self.vpc_cidrs.iter().any(|c| c.contains(addr)), || {
            format!("privateIp {} is outside the VPC", ip)
        });
        if let Some(subnet) = subnet {
            match subnet.cidr.parse::<Cidr>() {
                Ok(cidr) => problems.check(cidr.contains(addr), || {
                    format!("privateIp {} is outside subnet {} ({})", ip, subnet.id, cidr)
                }),
                Err(_) => problems.push(format!("subnet {} has an invalid CIDR", subnet.id)),
            }
        }
    }
}

impl PodValidator for StatefulValidator {
    fn apply_defaults(&self, pod: &mut Pod) {
        if pod.spec.instance_type.is_empty() {
            pod.spec.instance_type = self.default_instance_type.clone();
        }
    }

    fn validate_pod(&self, pod: &Pod) -> Result<()> {
        let mut problems = Problems::default();
        check_names(
            &mut problems,
            pod.metadata.namespace.as_deref(),
            &pod.metadata.name,
        );

        problems.check(!pod.spec.containers.is_empty(), || {
            "spec.containers must not be empty".to_string()
        });
        let mut seen = HashSet::new();
        for container in &pod.spec.containers {
            problems.check(is_dns_label(&container.name), || {
                format!("container name {:?} is not a valid DNS label", container.name)
            });
            problems.check(seen.insert(container.name.as_str()), || {
                format!("container name {:?} is duplicated", container.name)
            });
            problems.check(!container.image.is_empty(), || {
                format!("container {:?} has no image", container.name)
            });
        }

        let instance_type = &pod.spec.instance_type;
        if instance_type.is_empty() {
            problems.push("spec.instanceType is required");
        } else if !self.allowed_instance_types.is_empty()
            && !self.allowed_instance_types.contains(instance_type)
        {
            problems.push(format!(
                "spec.instanceType {:?} is not an allowed instance type",
                instance_type
            ));
        }

        self.check_network(&mut problems, pod);
        problems.into_result()
    }
}
