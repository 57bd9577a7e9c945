//! Console sink standing in for local client connections.

use async_trait::async_trait;
use xop_router::{ComponentContext, ComponentSettings, PacketFilter, Stanza, VirtualComponent, XopError};

pub(super) const NAME: &str = "console";

const DEFAULT_PREFIX: &str = "<<";

/// Prints every stanza bound for a client (anything not addressed to the
/// proxy service itself) on stdout.
pub struct ConsoleComponent {
    domain: String,
    prefix: String,
}

impl ConsoleComponent {
    /// Build from component settings. Recognizes `prefix`.
    pub fn from_settings(settings: &ComponentSettings) -> Self {
        Self {
            domain: String::new(),
            prefix: settings
                .get("prefix")
                .cloned()
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        }
    }

    fn line(&self, stanza: &Stanza) -> String {
        format!("{} {}", self.prefix, stanza.to_xml())
    }
}

impl PacketFilter for ConsoleComponent {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.to().is_some_and(|to| to.as_str() != self.domain)
    }
}

#[async_trait]
impl VirtualComponent for ConsoleComponent {
    fn name(&self) -> &str {
        NAME
    }

    async fn init(&mut self, ctx: &ComponentContext) -> Result<(), XopError> {
        self.domain = ctx.domain().to_string();
        Ok(())
    }

    async fn process(&self, stanza: Stanza) -> Result<(), XopError> {
        println!("{}", self.line(&stanza));
        Ok(())
    }

    async fn on_close_stream(&self, jid: &str) {
        println!("{} stream closed: {jid}", self.prefix);
    }
}
