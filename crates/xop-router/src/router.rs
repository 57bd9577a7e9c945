//! Packet routing for the proxy.
//!
//! This module provides the `PacketRouter`, the central dispatcher between the
//! stream layer and the registered virtual components.
//!
//! # Routing Logic
//!
//! For each stanza handed to [`PacketRouter::process_packet`], the router:
//! 1. Registers IQ requests with the reaper (and settles IQ responses)
//! 2. Enqueues the stanza on the delivery queue and returns immediately
//!
//! A delivery worker then calls [`PacketRouter::route`], which:
//! 1. Runs the interceptor chain, dropping the stanza on rejection
//! 2. Takes a snapshot of the route table
//! 3. Offers the stanza to every component whose filter accepts it, each
//!    receiving its own copy
//!
//! # Example
//!
//! ```ignore
//! use xop_router::{PacketRouter, RouterConfig};
//!
//! let router = PacketRouter::new(&RouterConfig::default())?;
//! router.add_route(Arc::new(my_component)).await;
//! router.process_packet(stanza);
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::component::VirtualComponent;
use crate::config::RouterConfig;
use crate::delivery::{DeliveryQueue, DeliveryStats, EnqueueResult, RouteFn};
use crate::interceptor::{ChainVerdict, InterceptorChain, PacketInterceptor};
use crate::metrics;
use crate::reaper::{ExpirySink, IqReaper};
use crate::stanza::{Stanza, StanzaKind};
use crate::XopError;

tokio::task_local! {
    /// Name of the route whose component is processing on this task.
    static DELIVERING_TO: String;
}

/// Receives local client connect/disconnect events from the stream layer.
#[async_trait]
pub trait LocalClientListener: Send + Sync {
    /// A client stream finished binding and can receive stanzas.
    async fn local_client_added(&self, client: Arc<dyn VirtualComponent>);

    /// A client stream went away.
    async fn local_client_removed(&self, name: &str);
}

/// An entry in the route table.
struct Route {
    name: String,
    component: Arc<dyn VirtualComponent>,
    /// Cleared when the route is removed or replaced
    live: AtomicBool,
    /// Deliveries to this component currently running
    in_flight: AtomicUsize,
    /// Signalled when `in_flight` drops to zero
    drained: Notify,
}

impl Route {
    fn new(name: String, component: Arc<dyn VirtualComponent>) -> Self {
        Self {
            name,
            component,
            live: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Register a delivery, or `None` once the route was retired.
    ///
    /// The count is raised before `live` is checked, pairing with `retire`
    /// clearing `live` before it reads the count.
    fn begin_delivery(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(self);
        self.live.load(Ordering::SeqCst).then_some(guard)
    }

    async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// One running delivery to a route.
struct InFlight<'a>(&'a Route);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

struct RouterInner {
    routes: DashMap<String, Arc<Route>>,
    interceptors: InterceptorChain,
    delivery: DeliveryQueue,
    reaper: IqReaper,
    shutdown_grace: Duration,
    /// Fixed by the first shutdown step, shared by all later ones
    shutdown_deadline: OnceLock<Instant>,
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        self.delivery.shutdown_now();
    }
}

/// Component-based stanza router.
///
/// Cheap to clone; all clones share one route table, interceptor chain,
/// delivery queue and reaper.
#[derive(Clone)]
pub struct PacketRouter {
    inner: Arc<RouterInner>,
}

impl PacketRouter {
    /// Create a router with the built-in interceptors, a delivery queue and a
    /// running IQ reaper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &RouterConfig) -> Result<Self, XopError> {
        let handle = Handle::try_current().map_err(|e| XopError::NoRuntime(e.to_string()))?;

        let inner = Arc::new_cyclic(|weak: &Weak<RouterInner>| {
            let route_target = weak.clone();
            let route: RouteFn = Arc::new(move |stanza| {
                let target = route_target.clone();
                async move {
                    if let Some(inner) = target.upgrade() {
                        PacketRouter { inner }.route(stanza).await;
                    }
                }
                .boxed()
            });

            let reply_target = weak.clone();
            let sink: ExpirySink = Arc::new(move |reply| {
                if let Some(inner) = reply_target.upgrade() {
                    PacketRouter { inner }.process_packet(reply);
                }
            });

            RouterInner {
                routes: DashMap::new(),
                interceptors: InterceptorChain::with_builtins(
                    config.interceptor_failure_policy,
                    config.duplicate_cache_size,
                    config.presence_sender_cache_size,
                ),
                delivery: DeliveryQueue::with_handle(config.delivery.clone(), route, handle.clone()),
                reaper: IqReaper::start_on(config.iq_timeout(), sink, &handle),
                shutdown_grace: config.shutdown_grace(),
                shutdown_deadline: OnceLock::new(),
            }
        });

        info!(
            iq_timeout_ms = config.iq_timeout_ms,
            core_pool_size = config.delivery.core_pool_size,
            max_pool_size = config.delivery.max_pool_size,
            "Packet router started"
        );

        Ok(Self { inner })
    }

    /// Accept a stanza from the stream layer. Never waits for routing.
    pub fn process_packet(&self, stanza: Stanza) -> EnqueueResult {
        metrics::record_received(stanza.kind().as_str());

        if stanza.kind() == StanzaKind::Iq {
            self.inner.reaper.handle_delayed_iq(&stanza);
        }

        self.inner.delivery.enqueue(stanza)
    }

    /// Run the interceptor chain and deliver to every accepting component.
    ///
    /// Called by delivery workers.
    #[instrument(skip(self, stanza), fields(kind = %stanza.kind(), id = stanza.id().unwrap_or_default()))]
    pub async fn route(&self, stanza: Stanza) {
        if let ChainVerdict::Rejected { interceptor } = self.inner.interceptors.run(&stanza) {
            debug!(interceptor = %interceptor, "Stanza rejected by interceptor");
            metrics::record_intercepted(&interceptor);
            return;
        }

        let mut handled = false;
        for route in self.snapshot() {
            let Some(_delivery) = route.begin_delivery() else {
                continue;
            };

            match catch_unwind(AssertUnwindSafe(|| route.component.accept(&stanza))) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => {
                    error!(component = %route.name, "Component filter panicked");
                    metrics::record_component_failure(&route.name, "accept");
                    continue;
                }
            }
            handled = true;

            let processing = DELIVERING_TO.scope(
                route.name.clone(),
                route.component.process(stanza.clone()),
            );
            match AssertUnwindSafe(processing).catch_unwind().await {
                Ok(Ok(())) => metrics::record_routed(stanza.kind().as_str()),
                Ok(Err(e)) => {
                    warn!(component = %route.name, error = %e, "Component failed to process stanza");
                    metrics::record_component_failure(&route.name, "process");
                }
                Err(_) => {
                    error!(component = %route.name, "Component panicked while processing stanza");
                    metrics::record_component_failure(&route.name, "process");
                }
            }
        }

        if !handled {
            warn!(stanza = %stanza, "No component accepted stanza");
            metrics::record_unhandled(stanza.kind().as_str());
        }
    }

    /// Publish a component into the route table under its name.
    ///
    /// Returns the component it replaced, once no delivery to it is running.
    pub async fn add_route(
        &self,
        component: Arc<dyn VirtualComponent>,
    ) -> Option<Arc<dyn VirtualComponent>> {
        let name = component.name().to_string();
        let displaced = self
            .inner
            .routes
            .insert(name.clone(), Arc::new(Route::new(name.clone(), component)));
        metrics::record_route_count(self.inner.routes.len());

        match displaced {
            Some(previous) => {
                info!(component = %name, "Route replaced");
                Some(self.retire(previous, None).await)
            }
            None => {
                info!(component = %name, "Route added");
                None
            }
        }
    }

    /// Remove the named route.
    ///
    /// No `process()` call for the component starts afterwards. Called from
    /// outside a delivery, it also waits for the running ones to finish. Called
    /// from inside a component's `process()` or `on_close_stream()`, it returns
    /// without waiting.
    pub async fn remove_route(&self, name: &str) -> Option<Arc<dyn VirtualComponent>> {
        let (_, route) = self.inner.routes.remove(name)?;
        metrics::record_route_count(self.inner.routes.len());
        info!(component = %name, "Route removed");
        Some(self.retire(route, None).await)
    }

    /// Remove the named route, waiting for running deliveries no later than `deadline`.
    pub(crate) async fn remove_route_by(
        &self,
        name: &str,
        deadline: Instant,
    ) -> Option<Arc<dyn VirtualComponent>> {
        let (_, route) = self.inner.routes.remove(name)?;
        metrics::record_route_count(self.inner.routes.len());
        info!(component = %name, "Route removed");
        Some(self.retire(route, Some(deadline)).await)
    }

    /// Append an interceptor to the chain.
    pub fn add_packet_interceptor(&self, interceptor: Arc<dyn PacketInterceptor>) {
        self.inner.interceptors.push(interceptor);
    }

    /// Tell every component a client stream closed.
    pub async fn handle_close_stream(&self, jid: &str) {
        debug!(jid, "Broadcasting stream close");

        for route in self.snapshot() {
            let Some(_delivery) = route.begin_delivery() else {
                continue;
            };

            let notify = DELIVERING_TO.scope(route.name.clone(), route.component.on_close_stream(jid));
            if AssertUnwindSafe(notify).catch_unwind().await.is_err() {
                error!(component = %route.name, jid, "Component panicked handling stream close");
                metrics::record_component_failure(&route.name, "close_stream");
            }
        }
    }

    /// Check whether a route is registered under this name.
    pub fn has_route(&self, name: &str) -> bool {
        self.inner.routes.contains_key(name)
    }

    /// Registered route names, sorted.
    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.routes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.inner.routes.len()
    }

    /// Number of IQ requests waiting for a response.
    pub fn pending_iq_count(&self) -> usize {
        self.inner.reaper.pending_count()
    }

    /// Delivery pool statistics.
    pub fn delivery_stats(&self) -> DeliveryStats {
        self.inner.delivery.stats()
    }

    /// Names of the interceptors in chain order.
    pub fn interceptor_names(&self) -> Vec<String> {
        self.inner.interceptors.names()
    }

    /// End of the shutdown grace period, fixed the first time it is asked for.
    pub(crate) fn shutdown_deadline(&self) -> Instant {
        *self
            .inner
            .shutdown_deadline
            .get_or_init(|| Instant::now() + self.inner.shutdown_grace)
    }

    /// Stop the IQ reaper. Pending requests are dropped without replies.
    pub(crate) async fn stop_reaper(&self) {
        self.inner.reaper.shutdown().await;
    }

    /// Stop the reaper, discard queued deliveries and wait for running ones.
    ///
    /// Running deliveries are waited for until the grace period ends. The period
    /// starts at the first shutdown step, which may be a component manager
    /// shutdown.
    pub async fn shutdown(&self) {
        let deadline = self.shutdown_deadline();
        self.stop_reaper().await;

        let discarded = self.inner.delivery.shutdown_now();
        for stanza in &discarded {
            debug!(stanza = %stanza, "Discarding queued stanza");
        }
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "Discarded queued stanzas on shutdown");
        }

        if tokio::time::timeout_at(deadline, self.inner.delivery.join())
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.inner.shutdown_grace.as_millis() as u64,
                pool = %self.inner.delivery.stats(),
                "Delivery workers still running after grace period"
            );
        }

        info!("Packet router stopped");
    }

    fn snapshot(&self) -> Vec<Arc<Route>> {
        self.inner
            .routes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn retire(&self, route: Arc<Route>, deadline: Option<Instant>) -> Arc<dyn VirtualComponent> {
        route.live.store(false, Ordering::SeqCst);

        // waiting from inside a delivery could wait on that delivery itself,
        // or on one waiting for us
        if let Ok(caller) = DELIVERING_TO.try_with(String::clone) {
            debug!(component = %route.name, caller = %caller, "Route retired from inside a delivery");
            return Arc::clone(&route.component);
        }

        match deadline {
            None => route.wait_drained().await,
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, route.wait_drained())
                    .await
                    .is_err()
                {
                    warn!(
                        component = %route.name,
                        in_flight = route.in_flight.load(Ordering::SeqCst),
                        "Deliveries still running after shutdown grace period"
                    );
                }
            }
        }

        Arc::clone(&route.component)
    }
}

#[async_trait]
impl LocalClientListener for PacketRouter {
    async fn local_client_added(&self, client: Arc<dyn VirtualComponent>) {
        self.add_route(client).await;
    }

    async fn local_client_removed(&self, name: &str) {
        self.remove_route(name).await;
    }
}

impl fmt::Display for PacketRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketRouter: available routes:")?;
        for name in self.route_names() {
            write!(f, "\n > {}", name)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRouter")
            .field("routes", &self.route_names())
            .field("interceptors", &self.interceptor_names())
            .field("delivery", &self.inner.delivery.stats())
            .finish()
    }
}
