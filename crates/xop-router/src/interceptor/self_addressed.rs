//! Self-addressed stanza rejection.

use super::PacketInterceptor;
use crate::stanza::Stanza;
use crate::XopError;

/// Rejects stanzas whose `to` and `from` are both present and equal.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfAddressedInterceptor;

impl PacketInterceptor for SelfAddressedInterceptor {
    fn name(&self) -> &str {
        "self-addressed"
    }

    fn intercept(&self, stanza: &Stanza) -> Result<bool, XopError> {
        match (stanza.to(), stanza.from()) {
            (Some(to), Some(from)) => Ok(to != from),
            _ => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(xml: &str) -> bool {
        let stanza: Stanza = xml.parse().unwrap();
        SelfAddressedInterceptor.intercept(&stanza).unwrap()
    }

    #[test]
    fn test_self_addressed_rejected() {
        assert!(!verdict("<message xmlns='jabber:client' to='foo@proxy/a' from='foo@proxy/a'/>"));
        assert!(!verdict("<iq xmlns='jabber:client' type='get' id='1' to='foo@proxy' from='foo@proxy'/>"));
    }

    #[test]
    fn test_distinct_addresses_pass() {
        assert!(verdict("<message xmlns='jabber:client' to='foo@proxy/a' from='foo@proxy/b'/>"));
        assert!(verdict("<message xmlns='jabber:client' to='foo@proxy' from='bar@proxy'/>"));
    }

    #[test]
    fn test_missing_address_passes() {
        assert!(verdict("<message xmlns='jabber:client' to='foo@proxy'/>"));
        assert!(verdict("<presence xmlns='jabber:client' from='foo@proxy'/>"));
        assert!(verdict("<presence xmlns='jabber:client'/>"));
    }
}
