//! Virtual components: the units stanzas are routed to.
//!
//! A component is registered through the [`ComponentManager`], which calls
//! [`VirtualComponent::init`] before publishing it into the router's route
//! table. From then on the router offers it every stanza its
//! [`PacketFilter::accept`] predicate takes, each as a private copy.

mod manager;
mod registry;

pub use manager::{ComponentManager, ShutdownReport};
pub use registry::{
    ComponentAutoLoader, ComponentFactory, ComponentRegistry, ComponentSettings, LoadFailure,
    LoadReport,
};

use async_trait::async_trait;

use crate::router::PacketRouter;
use crate::stanza::Stanza;
use crate::XopError;

/// Accept/reject predicate deciding whether a stanza is offered to a component.
pub trait PacketFilter {
    /// Check whether the stanza should be delivered.
    fn accept(&self, stanza: &Stanza) -> bool;
}

/// A pluggable, server-side routing target.
#[async_trait]
pub trait VirtualComponent: PacketFilter + Send + Sync {
    /// Route identity. Registering another component with the same name replaces this one.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Constructor-completion hook; the component must not do work before it runs.
    async fn init(&mut self, _ctx: &ComponentContext) -> Result<(), XopError> {
        Ok(())
    }

    /// Handle a stanza copy the filter accepted.
    async fn process(&self, stanza: Stanza) -> Result<(), XopError>;

    /// A client stream closed.
    async fn on_close_stream(&self, _jid: &str) {}

    /// Release resources. Called once the route is removed.
    async fn stop(&self) -> Result<(), XopError> {
        Ok(())
    }
}

/// Handles passed to a component during [`VirtualComponent::init`].
#[derive(Clone)]
pub struct ComponentContext {
    router: PacketRouter,
    manager: ComponentManager,
}

impl ComponentContext {
    pub(crate) fn new(router: PacketRouter, manager: ComponentManager) -> Self {
        Self { router, manager }
    }

    /// Router for issuing stanzas and registering child routes.
    pub fn router(&self) -> &PacketRouter {
        &self.router
    }

    /// Manager the component is being registered with.
    pub fn manager(&self) -> &ComponentManager {
        &self.manager
    }

    /// Domain served by this proxy.
    pub fn domain(&self) -> &str {
        self.manager.domain()
    }
}
