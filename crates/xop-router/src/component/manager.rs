//! Component registration and lifecycle.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use super::{ComponentContext, VirtualComponent};
use crate::metrics;
use crate::router::PacketRouter;
use crate::XopError;

/// Outcome of stopping every component.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Components stopped cleanly
    pub stopped: Vec<String>,
    /// Components whose `stop()` failed or panicked
    pub failed: Vec<(String, XopError)>,
}

impl ShutdownReport {
    /// Check if every component stopped cleanly.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ManagerInner {
    domain: String,
    router: PacketRouter,
    components: DashMap<String, Arc<dyn VirtualComponent>>,
}

/// Owns component registration, initialization and shutdown ordering.
///
/// Cheap to clone; clones share one component map.
#[derive(Clone)]
pub struct ComponentManager {
    inner: Arc<ManagerInner>,
}

impl ComponentManager {
    /// Create a manager publishing routes into `router`.
    pub fn new(domain: impl Into<String>, router: PacketRouter) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                domain: domain.into(),
                router,
                components: DashMap::new(),
            }),
        }
    }

    /// Domain served by this proxy.
    pub fn domain(&self) -> &str {
        &self.inner.domain
    }

    /// Router the components are published into.
    pub fn router(&self) -> &PacketRouter {
        &self.inner.router
    }

    /// Initialize a component, publish its route, then record it.
    ///
    /// A component already registered under the same name is replaced and stopped.
    #[instrument(skip(self, component), fields(component = %component.name()))]
    pub async fn add_component(
        &self,
        mut component: Box<dyn VirtualComponent>,
    ) -> Result<(), XopError> {
        let ctx = ComponentContext::new(self.inner.router.clone(), self.clone());

        match AssertUnwindSafe(component.init(&ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let name = component.name().to_string();
                warn!(error = %e, "Component initialization failed");
                metrics::record_component_failure(&name, "init");
                return Err(XopError::component(name, e.to_string()));
            }
            Err(_) => {
                let name = component.name().to_string();
                error!("Component panicked during initialization");
                metrics::record_component_failure(&name, "init");
                return Err(XopError::component(name, "panicked during initialization"));
            }
        }

        // init may settle the name, and the route is keyed by it
        let name = component.name().to_string();
        let component: Arc<dyn VirtualComponent> = Arc::from(component);
        let displaced = self.inner.router.add_route(Arc::clone(&component)).await;
        self.inner.components.insert(name.clone(), component);
        info!("Component added");

        if let Some(previous) = displaced {
            if let Err(e) = stop_component(&name, &previous).await {
                warn!(error = %e, "Replaced component failed to stop");
            }
        }

        Ok(())
    }

    /// Remove the named component's route, then stop it.
    pub async fn remove_component(&self, name: &str) -> Result<(), XopError> {
        let Some((_, component)) = self.inner.components.remove(name) else {
            return Err(XopError::ComponentNotFound(name.to_string()));
        };

        self.inner.router.remove_route(name).await;
        info!(component = %name, "Component removed");
        stop_component(name, &component).await
    }

    /// Remove and stop every component, continuing past failures.
    ///
    /// Running deliveries are waited for until the router's shutdown grace
    /// period ends; components still busy after that are stopped anyway.
    pub async fn shut_down(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let deadline = self.inner.router.shutdown_deadline();

        for name in self.components() {
            let Some((_, component)) = self.inner.components.remove(&name) else {
                continue;
            };
            self.inner.router.remove_route_by(&name, deadline).await;

            match stop_component(&name, &component).await {
                Ok(()) => report.stopped.push(name),
                Err(e) => report.failed.push((name, e)),
            }
        }

        info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "Component manager shut down"
        );
        report
    }

    /// Look up a registered component.
    pub fn component(&self, name: &str) -> Option<Arc<dyn VirtualComponent>> {
        self.inner.components.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Registered component names, sorted.
    pub fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .components
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }
}

async fn stop_component(name: &str, component: &Arc<dyn VirtualComponent>) -> Result<(), XopError> {
    match AssertUnwindSafe(component.stop()).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(component = %name, "Component stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(component = %name, error = %e, "Component failed to stop");
            metrics::record_component_failure(name, "stop");
            Err(XopError::component(name, e.to_string()))
        }
        Err(_) => {
            error!(component = %name, "Component panicked while stopping");
            metrics::record_component_failure(name, "stop");
            Err(XopError::component(name, "panicked while stopping"))
        }
    }
}

impl fmt::Display for ComponentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "This proxy (\"{}\") has the following components: [{}]",
            self.inner.domain,
            self.components().join(", ")
        )
    }
}

impl fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentManager")
            .field("domain", &self.inner.domain)
            .field("components", &self.components())
            .finish()
    }
}
