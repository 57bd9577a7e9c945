//! # xop-router
//!
//! Packet routing core for the XOP XMPP proxy.
//!
//! Parsed stanzas from the stream layer enter through
//! [`PacketRouter::process_packet`] (or [`XopContext::process_packet`]), are
//! gated by the interceptor chain and delivered concurrently to every virtual
//! component whose filter accepts them.
//!
//! ## Architecture
//!
//! - **Stanza**: structured packet (message, presence, iq) wrapping a `minidom` element
//! - **Interceptors**: pre-routing gates, with duplicate suppression and
//!   self-addressed rejection built in
//! - **Delivery queue**: bounded worker pool decoupling submission from routing,
//!   rejecting stanzas under overload
//! - **IQ reaper**: answers every IQ request left unanswered past its timeout
//!   with a generic error
//! - **Router**: route table of virtual components and the dispatch loop
//! - **Component manager**: registration, initialization and shutdown ordering,
//!   fed by a name-to-factory registry

pub mod component;
pub mod config;
pub mod context;
pub mod delivery;
pub mod interceptor;
pub mod metrics;
pub mod reaper;
pub mod router;
pub mod stanza;

mod error;

pub use component::{
    ComponentAutoLoader, ComponentContext, ComponentManager, ComponentRegistry,
    ComponentSettings, LoadFailure, LoadReport, PacketFilter, ShutdownReport, VirtualComponent,
};
pub use config::{ComponentsConfig, DeliveryConfig, RouterConfig, XopConfig};
pub use context::{PacketListener, XopContext};
pub use delivery::{DeliveryQueue, DeliveryStats, EnqueueResult, RejectReason};
pub use error::{StanzaErrorCondition, StanzaErrorType, XopError};
pub use interceptor::{
    ChainVerdict, DuplicateInterceptor, FailurePolicy, InterceptorChain, PacketInterceptor,
    SelfAddressedInterceptor,
};
pub use reaper::{IqReaper, ReaperAction};
pub use router::{LocalClientListener, PacketRouter};
pub use stanza::{ns, IqType, Stanza, StanzaKind};
