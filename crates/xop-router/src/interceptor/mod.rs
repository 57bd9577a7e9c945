//! Pre-routing interceptor chain.
//!
//! Every stanza taken off the delivery queue passes through the chain before it
//! is offered to any component. The first interceptor that rejects a stanza
//! stops the chain and the stanza is dropped.

mod duplicate;
mod self_addressed;

pub use duplicate::{DuplicateInterceptor, DEFAULT_PRESENCE_SENDERS};
pub use self_addressed::SelfAddressedInterceptor;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::stanza::Stanza;
use crate::XopError;

/// A pre-routing gate.
///
/// Interceptors may record state about a stanza (e.g. a fingerprint) but never
/// replace it. They run concurrently on several delivery workers, so any state
/// must be internally synchronized.
pub trait PacketInterceptor: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Decide whether the stanza may continue to the route table.
    fn intercept(&self, stanza: &Stanza) -> Result<bool, XopError>;
}

/// What the chain does when an interceptor errors or panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and treat it as accept
    #[default]
    Open,
    /// Log the failure and reject the stanza
    Closed,
}

/// Outcome of running the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    /// Every interceptor accepted the stanza
    Accepted,
    /// The named interceptor rejected the stanza
    Rejected {
        /// Name of the rejecting interceptor
        interceptor: String,
    },
}

impl ChainVerdict {
    /// Check if the stanza may be routed.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Ordered, append-only list of interceptors.
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Arc<dyn PacketInterceptor>>>,
    policy: FailurePolicy,
}

impl InterceptorChain {
    /// Create an empty chain.
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            interceptors: RwLock::new(Vec::new()),
            policy,
        }
    }

    /// Create a chain with the built-in duplicate and self-addressed interceptors.
    pub fn with_builtins(
        policy: FailurePolicy,
        duplicate_cache_size: usize,
        presence_senders: usize,
    ) -> Self {
        let chain = Self::new(policy);
        chain.push(Arc::new(DuplicateInterceptor::new(
            duplicate_cache_size,
            presence_senders,
        )));
        chain.push(Arc::new(SelfAddressedInterceptor));
        chain
    }

    /// Append an interceptor. It runs after every interceptor already present.
    pub fn push(&self, interceptor: Arc<dyn PacketInterceptor>) {
        debug!(interceptor = %interceptor.name(), "Adding packet interceptor");
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Get the configured failure policy.
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Get the interceptor names in chain order.
    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|i| i.name().to_string()).collect()
    }

    /// Get the number of interceptors.
    pub fn len(&self) -> usize {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the chain has no interceptors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the stanza through every interceptor until one rejects it.
    pub fn run(&self, stanza: &Stanza) -> ChainVerdict {
        for interceptor in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| interceptor.intercept(stanza)));

            let accepted = match outcome {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    warn!(
                        interceptor = %interceptor.name(),
                        error = %e,
                        policy = ?self.policy,
                        "Packet interceptor failed"
                    );
                    self.policy == FailurePolicy::Open
                }
                Err(_) => {
                    warn!(
                        interceptor = %interceptor.name(),
                        policy = ?self.policy,
                        "Packet interceptor panicked"
                    );
                    self.policy == FailurePolicy::Open
                }
            };

            if !accepted {
                return ChainVerdict::Rejected {
                    interceptor: interceptor.name().to_string(),
                };
            }
        }

        ChainVerdict::Accepted
    }

    fn snapshot(&self) -> Vec<Arc<dyn PacketInterceptor>> {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new(FailurePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        verdict: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(verdict: bool) -> Arc<Self> {
            Arc::new(Self {
                verdict,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl PacketInterceptor for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn intercept(&self, _stanza: &Stanza) -> Result<bool, XopError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }
    }

    struct Broken;

    impl PacketInterceptor for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn intercept(&self, _stanza: &Stanza) -> Result<bool, XopError> {
            Err(XopError::internal("fingerprint store unavailable"))
        }
    }

    struct Panicking;

    impl PacketInterceptor for Panicking {
        fn intercept(&self, _stanza: &Stanza) -> Result<bool, XopError> {
            panic!("interceptor bug");
        }
    }

    fn stanza() -> Stanza {
        "<message xmlns='jabber:client' to='foo@proxy' from='bar@proxy'><body>hi</body></message>"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_empty_chain_accepts() {
        let chain = InterceptorChain::default();
        assert!(chain.is_empty());
        assert!(chain.run(&stanza()).is_accepted());
    }

    #[test]
    fn test_rejection_short_circuits() {
        let chain = InterceptorChain::new(FailurePolicy::Open);
        let first = Fixed::new(false);
        let second = Fixed::new(true);
        chain.push(first.clone());
        chain.push(second.clone());

        let verdict = chain.run(&stanza());
        assert_eq!(
            verdict,
            ChainVerdict::Rejected {
                interceptor: "fixed".to_string()
            }
        );
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fail_open_accepts_on_error_and_panic() {
        let chain = InterceptorChain::new(FailurePolicy::Open);
        chain.push(Arc::new(Broken));
        chain.push(Arc::new(Panicking));
        let tail = Fixed::new(true);
        chain.push(tail.clone());

        assert!(chain.run(&stanza()).is_accepted());
        assert_eq!(tail.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fail_closed_rejects_on_error() {
        let chain = InterceptorChain::new(FailurePolicy::Closed);
        chain.push(Arc::new(Broken));

        assert_eq!(
            chain.run(&stanza()),
            ChainVerdict::Rejected {
                interceptor: "broken".to_string()
            }
        );
    }

    #[test]
    fn test_fail_closed_rejects_on_panic() {
        let chain = InterceptorChain::new(FailurePolicy::Closed);
        chain.push(Arc::new(Panicking));
        assert!(!chain.run(&stanza()).is_accepted());
    }

    #[test]
    fn test_builtins_in_order() {
        let chain = InterceptorChain::with_builtins(FailurePolicy::Open, 16, 16);
        let names = chain.names();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "duplicate");
        assert_eq!(names[1], "self-addressed");
    }

    #[test]
    fn test_policy_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: FailurePolicy,
        }

        let parsed: Wrapper = toml::from_str("policy = \"closed\"").unwrap();
        assert_eq!(parsed.policy, FailurePolicy::Closed);
    }
}
