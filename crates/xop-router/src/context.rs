//! Application context wiring the router and component manager together.
//!
//! Built once at startup and passed by handle to everything that needs to
//! submit stanzas or inspect the proxy.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, info, instrument};

use crate::component::{
    ComponentAutoLoader, ComponentManager, ComponentRegistry, LoadReport, ShutdownReport,
};
use crate::config::XopConfig;
use crate::delivery::EnqueueResult;
use crate::router::PacketRouter;
use crate::stanza::Stanza;
use crate::XopError;

/// Observer notified of every stanza entering the proxy, before routing.
pub trait PacketListener: Send + Sync {
    /// Called with each stanza handed to [`XopContext::process_packet`].
    fn packet_received(&self, stanza: &Stanza);
}

struct ContextInner {
    config: XopConfig,
    router: PacketRouter,
    manager: ComponentManager,
    listeners: RwLock<Vec<Arc<dyn PacketListener>>>,
    load_report: LoadReport,
}

/// Running proxy: router, component manager and configuration.
#[derive(Clone)]
pub struct XopContext {
    inner: Arc<ContextInner>,
}

impl XopContext {
    /// Validate the configuration, start the router and load the enabled components.
    ///
    /// Component load failures are recorded in [`XopContext::load_report`] and do
    /// not fail startup.
    #[instrument(skip_all, fields(domain = %config.domain))]
    pub async fn start(config: XopConfig, registry: &ComponentRegistry) -> Result<Self, XopError> {
        config.validate()?;

        let router = PacketRouter::new(&config.router)?;
        let manager = ComponentManager::new(config.domain.clone(), router.clone());
        let load_report = ComponentAutoLoader::new(registry, &manager)
            .load(&config.components)
            .await;

        info!(
            components = ?manager.components(),
            failed = load_report.failed.len(),
            "Proxy context started"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                router,
                manager,
                listeners: RwLock::new(Vec::new()),
                load_report,
            }),
        })
    }

    /// Notify listeners, then hand the stanza to the router.
    pub fn process_packet(&self, stanza: Stanza) -> EnqueueResult {
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.packet_received(&stanza))).is_err() {
                error!("Packet listener panicked");
            }
        }

        self.inner.router.process_packet(stanza)
    }

    /// Register an observer for incoming stanzas.
    pub fn add_packet_listener(&self, listener: Arc<dyn PacketListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Signal that a client stream closed.
    pub async fn handle_close_stream(&self, jid: &str) {
        self.inner.router.handle_close_stream(jid).await;
    }

    /// Human-readable route table.
    pub fn routes(&self) -> String {
        self.inner.router.to_string()
    }

    /// Human-readable component list.
    pub fn components(&self) -> String {
        self.inner.manager.to_string()
    }

    /// The packet router.
    pub fn router(&self) -> &PacketRouter {
        &self.inner.router
    }

    /// The component manager.
    pub fn manager(&self) -> &ComponentManager {
        &self.inner.manager
    }

    /// Configuration the context was started with.
    pub fn config(&self) -> &XopConfig {
        &self.inner.config
    }

    /// Outcome of loading components at startup.
    pub fn load_report(&self) -> &LoadReport {
        &self.inner.load_report
    }

    /// Stop the IQ reaper, every component, then the router.
    ///
    /// The whole sequence shares one `shutdown_grace_ms` budget for waiting on
    /// running deliveries.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down proxy");
        self.inner.router.shutdown_deadline();
        self.inner.router.stop_reaper().await;
        let report = self.inner.manager.shut_down().await;
        self.inner.router.shutdown().await;
        report
    }
}
