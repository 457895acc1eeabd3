//! Component health as observed by recent invocations.
//!
//! Invocations are short-lived, so health here is derived from the outcome of
//! the most recent call into each collaborator rather than from probes.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

/// Collaborators whose health is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// Durable configuration and batch store
    Store,
    /// Outbound notification channel
    Notifications,
    /// Bulk-load target clusters
    Targets,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Store => "store",
            Component::Notifications => "notifications",
            Component::Targets => "targets",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// No call has reached the component yet
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Tracks the last observed status of each component.
pub struct HealthCheck {
    components: RwLock<BTreeMap<Component, ComponentStatus>>,
}

impl HealthCheck {
    /// Create a tracker with every component in `Unknown`.
    pub fn new() -> Self {
        let components = [Component::Store, Component::Notifications, Component::Targets]
            .into_iter()
            .map(|c| (c, ComponentStatus::Unknown))
            .collect();
        Self {
            components: RwLock::new(components),
        }
    }

    pub fn mark_healthy(&self, component: Component) {
        self.components
            .write()
            .insert(component, ComponentStatus::Healthy);
    }

    pub fn mark_degraded(&self, component: Component, reason: &str) {
        self.components
            .write()
            .insert(component, ComponentStatus::Degraded(reason.to_string()));
    }

    pub fn mark_unhealthy(&self, component: Component, reason: &str) {
        self.components
            .write()
            .insert(component, ComponentStatus::Unhealthy(reason.to_string()));
    }

    pub fn status_of(&self, component: Component) -> ComponentStatus {
        self.components
            .read()
            .get(&component)
            .cloned()
            .unwrap_or(ComponentStatus::Unknown)
    }

    /// Snapshot of every component status keyed by name.
    pub fn all_statuses(&self) -> BTreeMap<String, ComponentStatus> {
        self.components
            .read()
            .iter()
            .map(|(c, s)| (c.as_str().to_string(), s.clone()))
            .collect()
    }

    /// Overall health. Target failures only degrade: one bad cluster does
    /// not stop files from being admitted and batched.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for (component, status) in components.iter() {
            match (component, status) {
                (Component::Targets, ComponentStatus::Unhealthy(_)) => has_degraded = true,
                (_, ComponentStatus::Unhealthy(_)) => return HealthStatus::Unhealthy,
                (_, ComponentStatus::Degraded(_)) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        self.overall_status() != HealthStatus::Unhealthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
