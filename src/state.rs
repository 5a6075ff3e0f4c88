//! Observed environment state and configuration fingerprints.
//!
//! Nothing here is persisted. The container engine is the source of truth:
//! state is re-read from it before every orchestration step.

use crate::manifest::Service;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Absent,
    Building,
    Built,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Absent => "absent",
            ServiceStatus::Building => "building",
            ServiceStatus::Built => "built",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of bringing a service up went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Querying the engine for the container's current state.
    Observe,
    /// Removing a drifted container before rebuilding.
    Replace,
    Build,
    Network,
    Mount,
    Process,
    /// Waiting for a started service to become ready.
    Wait,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Observe => "observe",
            Step::Replace => "replace",
            Step::Build => "build",
            Step::Network => "network",
            Step::Mount => "mount",
            Step::Process => "process",
            Step::Wait => "wait",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hash of everything that determines what a service's container is:
/// build source (context, Dockerfile digest, args) or image, command,
/// entrypoint, mounts, ports and environment. Attach settings and
/// readiness waits do not change the container and are left out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(service: &Service) -> Self {
        // serde_json over BTreeMaps and Vecs is deterministic.
        let canonical = serde_json::to_vec(service).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        Fingerprint(format!("{digest:x}"))
    }

    pub fn from_label(value: impl Into<String>) -> Self {
        Fingerprint(value.into())
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the engine reports about one service's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedService {
    pub status: ServiceStatus,
    pub container: Option<String>,
    /// Fingerprint the container was created with.
    pub fingerprint: Option<Fingerprint>,
}

impl ObservedService {
    pub fn absent() -> Self {
        Self {
            status: ServiceStatus::Absent,
            container: None,
            fingerprint: None,
        }
    }
}

/// Live state of a profile's services, keyed by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentState {
    services: BTreeMap<String, ObservedService>,
}

impl EnvironmentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: impl Into<String>, observed: ObservedService) {
        self.services.insert(service.into(), observed);
    }

    /// Unknown services read as absent.
    pub fn get(&self, service: &str) -> ObservedService {
        self.services
            .get(service)
            .cloned()
            .unwrap_or_else(ObservedService::absent)
    }
}
