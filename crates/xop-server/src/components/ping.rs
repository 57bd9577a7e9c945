//! XEP-0199 ping responder for the proxy domain.

use async_trait::async_trait;
use tracing::{debug, warn};
use xop_router::{
    ns, ComponentContext, IqType, PacketFilter, PacketRouter, Stanza, StanzaKind,
    VirtualComponent, XopError,
};

pub(super) const NAME: &str = "ping";

/// Answers `<ping xmlns='urn:xmpp:ping'/>` IQ gets sent to the proxy domain.
#[derive(Default)]
pub struct PingComponent {
    domain: String,
    router: Option<PacketRouter>,
}

impl PingComponent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketFilter for PingComponent {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.kind() == StanzaKind::Iq
            && stanza.iq_type() == Some(IqType::Get)
            && stanza.to().is_some_and(|to| to.as_str() == self.domain)
            && stanza.element().get_child("ping", ns::PING).is_some()
    }
}

#[async_trait]
impl VirtualComponent for PingComponent {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(&mut self, ctx: &ComponentContext) -> Result<(), XopError> {
        self.domain = ctx.domain().to_string();
        self.router = Some(ctx.router().clone());
        Ok(())
    }

    async fn process(&self, stanza: Stanza) -> Result<(), XopError> {
        let router = self
            .router
            .as_ref()
            .ok_or_else(|| XopError::component(NAME, "not initialized"))?;
        let Some(reply) = stanza.iq_result() else {
            return Ok(());
        };

        debug!(id = ?stanza.id(), from = ?stanza.from().map(|j| j.to_string()), "Answering ping");
        let result = router.process_packet(reply);
        if !result.is_accepted() {
            warn!(id = ?stanza.id(), "Ping reply not accepted: {result:?}");
        }
        Ok(())
    }
}
