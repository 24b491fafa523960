use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Health reporting for the operators of a pipeline.
///
/// Every operator loop (ingestor, processing component, join, sink) owns a
/// [`HealthHandle`] and reports on each iteration. The process is only
/// healthy while all registered operators have reported within their
/// deadline, so a stuck loop shows up on the liveness probe instead of
/// silently stalling the pipeline.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True iff every registered component is currently healthy.
    pub healthy: bool,
    /// Per-component status, for the probe body.
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
    /// Registered but has not reported yet.
    Starting,
    /// Healthy until the contained instant, then considered stalled.
    HealthyUntil(time::OffsetDateTime),
    /// The component reported itself broken.
    Unhealthy,
    /// Deadline elapsed without a report.
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => *until > time::OffsetDateTime::now_utc(),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy for another `deadline` window. Call once per loop turn.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc() + self.deadline,
        ));
    }

    pub fn report_unhealthy(&self) {
        self.report_status(ComponentStatus::Unhealthy);
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probe will fail and the process restart.
            Err(_) => warn!("poisoned HealthRegistry lock"),
        }
    }
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component; the returned handle is given to the operator so
    /// it can report on every loop iteration. Components start in
    /// [`ComponentStatus::Starting`] and the registry is unhealthy until all
    /// of them have reported.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Aggregate status over all registered components; usable as an axum
    /// handler body for the liveness route.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned HealthRegistry lock");
            return HealthStatus::default();
        };

        let now = time::OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let observed = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(observed, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), observed);
        }

        if !status.healthy {
            warn!(
                "{} health check failed: {:?}",
                self.name, status.components
            );
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn starting_component_is_unhealthy_until_first_report() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("sink", Duration::from_secs(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("sink"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn stale_report_stalls_the_component() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("component", Duration::from_secs(30));

        handle.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc() - time::Duration::seconds(1),
        ));
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("component"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let ingestor = registry.register("ingestor", Duration::from_secs(30));
        let sink = registry.register("sink", Duration::from_secs(30));

        ingestor.report_healthy();
        assert!(!registry.get_status().healthy);

        sink.report_healthy();
        assert!(registry.get_status().healthy);

        ingestor.report_unhealthy();
        assert!(!registry.get_status().healthy);

        ingestor.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn into_response_maps_health_to_status_code() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
