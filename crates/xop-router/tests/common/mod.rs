//! Test utilities for router integration testing.
//!
//! Provides recording and blocking components, stanza builders and tracing setup.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Barrier, Notify, Semaphore};
use xop_router::{
    ComponentContext, DeliveryConfig, PacketFilter, PacketRouter, RouterConfig, Stanza,
    VirtualComponent, XopError,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing for a test binary.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Router configuration with a small pool and the given IQ timeout.
pub fn router_config(iq_timeout_ms: u64) -> RouterConfig {
    RouterConfig {
        iq_timeout_ms,
        delivery: DeliveryConfig {
            core_pool_size: 4,
            max_pool_size: 8,
            keep_alive_ms: 1000,
            queue_capacity: 0,
        },
        ..Default::default()
    }
}

/// Build a chat message.
pub fn message(to: &str, from: &str, body: &str) -> Stanza {
    format!("<message xmlns='jabber:client' to='{to}' from='{from}'><body>{body}</body></message>")
        .parse()
        .unwrap()
}

/// Build an IQ with no payload.
pub fn iq(id: &str, iq_type: &str, from: &str, to: &str) -> Stanza {
    format!("<iq xmlns='jabber:client' type='{iq_type}' id='{id}' from='{from}' to='{to}'/>")
        .parse()
        .unwrap()
}

type Filter = Arc<dyn Fn(&Stanza) -> bool + Send + Sync>;

#[derive(Default)]
struct Log {
    received: Mutex<Vec<Stanza>>,
    changed: Notify,
}

/// Component recording every stanza it processes.
///
/// Clones share the same log, so a clone can be handed to the router or a
/// factory while the test keeps another for assertions.
#[derive(Clone)]
pub struct RecordingComponent {
    name: String,
    filter: Filter,
    log: Arc<Log>,
}

impl RecordingComponent {
    /// Record stanzas matching `filter`.
    pub fn new(name: &str, filter: impl Fn(&Stanza) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            filter: Arc::new(filter),
            log: Arc::new(Log::default()),
        }
    }

    /// Record stanzas addressed to the given domain.
    pub fn for_domain(name: &str, domain: &'static str) -> Self {
        Self::new(name, move |stanza| {
            stanza.to().map(|to| to.domain().as_str() == domain).unwrap_or(false)
        })
    }

    /// Record stanzas addressed exactly to `jid`.
    pub fn for_jid(name: &str, jid: &'static str) -> Self {
        Self::new(name, move |stanza| {
            stanza.to().map(|to| to.to_string() == jid).unwrap_or(false)
        })
    }

    /// Everything processed so far.
    pub fn received(&self) -> Vec<Stanza> {
        self.log.received.lock().unwrap().clone()
    }

    /// Number of stanzas processed so far.
    pub fn count(&self) -> usize {
        self.log.received.lock().unwrap().len()
    }

    /// Wait until at least `n` stanzas were processed.
    pub async fn wait_for(&self, n: usize) -> Vec<Stanza> {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            loop {
                let changed = self.log.changed.notified();
                if self.count() >= n {
                    return self.received();
                }
                changed.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} received {} stanzas, expected {}", self.name, self.count(), n))
    }
}

impl PacketFilter for RecordingComponent {
    fn accept(&self, stanza: &Stanza) -> bool {
        (self.filter)(stanza)
    }
}

#[async_trait]
impl VirtualComponent for RecordingComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, stanza: Stanza) -> Result<(), XopError> {
        self.log.received.lock().unwrap().push(stanza);
        self.log.changed.notify_waiters();
        Ok(())
    }
}

/// Component whose `process` waits for a permit before completing.
pub struct BlockingComponent {
    pub gate: Arc<Semaphore>,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
}

impl BlockingComponent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(0)),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        })
    }

    /// Let `n` blocked deliveries complete.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

impl PacketFilter for BlockingComponent {
    fn accept(&self, _stanza: &Stanza) -> bool {
        true
    }
}

#[async_trait]
impl VirtualComponent for BlockingComponent {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn process(&self, _stanza: Stanza) -> Result<(), XopError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| XopError::internal(e.to_string()))?;
        permit.forget();
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Component counting deliveries that start after it was flagged as removed.
pub struct RemovalWatcher {
    pub removed: AtomicBool,
    pub delivered: AtomicUsize,
    pub after_removal: AtomicUsize,
}

impl RemovalWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            removed: AtomicBool::new(false),
            delivered: AtomicUsize::new(0),
            after_removal: AtomicUsize::new(0),
        })
    }
}

impl PacketFilter for RemovalWatcher {
    fn accept(&self, _stanza: &Stanza) -> bool {
        true
    }
}

#[async_trait]
impl VirtualComponent for RemovalWatcher {
    fn name(&self) -> &str {
        "removal-watcher"
    }

    async fn process(&self, _stanza: Stanza) -> Result<(), XopError> {
        if self.removed.load(Ordering::SeqCst) {
            self.after_removal.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        if self.removed.load(Ordering::SeqCst) {
            self.after_removal.fetch_add(1, Ordering::SeqCst);
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Component failing in the configured lifecycle steps.
pub struct FailingComponent {
    pub name: String,
    pub fail_init: bool,
    pub fail_process: bool,
    pub panic_process: bool,
    pub fail_stop: bool,
}

impl FailingComponent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_init: false,
            fail_process: false,
            panic_process: false,
            fail_stop: false,
        }
    }
}

impl PacketFilter for FailingComponent {
    fn accept(&self, _stanza: &Stanza) -> bool {
        true
    }
}

#[async_trait]
impl VirtualComponent for FailingComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, _ctx: &ComponentContext) -> Result<(), XopError> {
        if self.fail_init {
            return Err(XopError::internal("cannot open room store"));
        }
        Ok(())
    }

    async fn process(&self, _stanza: Stanza) -> Result<(), XopError> {
        if self.panic_process {
            panic!("component bug");
        }
        if self.fail_process {
            return Err(XopError::internal("processing failed"));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), XopError> {
        if self.fail_stop {
            return Err(XopError::internal("stop failed"));
        }
        Ok(())
    }
}

/// Component removing `target`'s route from inside `process()`.
///
/// Accepts stanzas addressed to `<name>@proxy`. With a barrier set, every
/// delivery first waits until the other parties' deliveries are running too.
pub struct RouteRemover {
    name: String,
    target: String,
    jid: String,
    barrier: Option<Arc<Barrier>>,
    router: Option<PacketRouter>,
    pub removed: Arc<AtomicBool>,
    pub completed: Arc<AtomicUsize>,
}

impl RouteRemover {
    pub fn new(name: &str, target: &str, barrier: Option<Arc<Barrier>>) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            jid: format!("{name}@proxy"),
            barrier,
            router: None,
            removed: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl PacketFilter for RouteRemover {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.to().is_some_and(|to| to.to_string() == self.jid)
    }
}

#[async_trait]
impl VirtualComponent for RouteRemover {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, ctx: &ComponentContext) -> Result<(), XopError> {
        self.router = Some(ctx.router().clone());
        Ok(())
    }

    async fn process(&self, _stanza: Stanza) -> Result<(), XopError> {
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        let router = self
            .router
            .as_ref()
            .ok_or_else(|| XopError::internal("not initialized"))?;
        let removed = router.remove_route(&self.target).await.is_some();
        self.removed.store(removed, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Component registering `child` as a new route from inside `process()`.
///
/// Accepts stanzas addressed to `registrar@proxy`.
pub struct RouteAdder {
    child: RecordingComponent,
    router: Option<PacketRouter>,
}

impl RouteAdder {
    pub fn new(child: RecordingComponent) -> Self {
        Self { child, router: None }
    }
}

impl PacketFilter for RouteAdder {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.to().is_some_and(|to| to.to_string() == "registrar@proxy")
    }
}

#[async_trait]
impl VirtualComponent for RouteAdder {
    fn name(&self) -> &str {
        "registrar"
    }

    async fn init(&mut self, ctx: &ComponentContext) -> Result<(), XopError> {
        self.router = Some(ctx.router().clone());
        Ok(())
    }

    async fn process(&self, _stanza: Stanza) -> Result<(), XopError> {
        let router = self
            .router
            .as_ref()
            .ok_or_else(|| XopError::internal("not initialized"))?;
        router.add_route(Arc::new(self.child.clone())).await;
        Ok(())
    }
}

/// Component whose `process()` never returns.
#[derive(Clone, Default)]
pub struct StuckComponent {
    pub started: Arc<AtomicUsize>,
}

impl PacketFilter for StuckComponent {
    fn accept(&self, _stanza: &Stanza) -> bool {
        true
    }
}

#[async_trait]
impl VirtualComponent for StuckComponent {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn process(&self, _stanza: Stanza) -> Result<(), XopError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Wait until `counter` reaches `n`.
pub async fn wait_until(counter: &AtomicUsize, n: usize) {
    tokio::time::timeout(DEFAULT_TIMEOUT, async {
        while counter.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("counter stuck at {}, expected {}", counter.load(Ordering::SeqCst), n));
}
