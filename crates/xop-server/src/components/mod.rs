//! Components shipped with the daemon.

mod console;
mod ping;

pub use console::ConsoleComponent;
pub use ping::PingComponent;

use xop_router::{ComponentRegistry, VirtualComponent};

/// Registry of every built-in component factory.
pub fn registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry
        .register(ping::NAME, |_| {
            Ok(Box::new(PingComponent::new()) as Box<dyn VirtualComponent>)
        })
        .register(console::NAME, |settings| {
            Ok(Box::new(ConsoleComponent::from_settings(settings)) as Box<dyn VirtualComponent>)
        });
    registry
}
