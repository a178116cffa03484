use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tracing::{info, warn};

/// Health reporting for the long-running loops of a service.
///
/// Every loop the process depends on registers itself as a component and
/// must keep reporting healthy before its deadline elapses. The process is
/// healthy when all registered components are; a component that misses its
/// deadline is considered stalled.
///
/// Liveness and readiness should use separate registries.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if every component is healthy. A registry without components is unhealthy.
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, never reported yet
    Starting,
    /// Reported healthy, must report again before the deadline
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Missed its deadline
    Stalled,
}

impl ComponentStatus {
    fn evaluate(&self, now: OffsetDateTime) -> ComponentStatus {
        match self {
            ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
            status => status.clone(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > OffsetDateTime::now_utc())
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy until now + deadline. Must be called more often than the deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = components.insert(self.component.clone(), status.clone());
        let was_healthy = matches!(previous, Some(ComponentStatus::HealthyUntil(_)));
        match status {
            ComponentStatus::HealthyUntil(_) if !was_healthy => {
                info!("component {} is healthy", self.component)
            }
            ComponentStatus::Unhealthy => warn!("component {} reported unhealthy", self.component),
            _ => {}
        }
    }
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a new component. It starts in `Starting` state, which counts as unhealthy.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        self.components
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(component.clone(), ComponentStatus::Starting);
        info!("registered {} component {}", self.name, component);

        HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        }
    }

    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components: HashMap<String, ComponentStatus> = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, status)| (name.clone(), status.evaluate(now)))
            .collect();

        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));
        if !healthy {
            warn!("{} health check failed: {:?}", self.name, components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}
