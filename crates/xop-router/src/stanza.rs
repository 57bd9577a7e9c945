//! Structured stanza model shared by every routing stage.
//!
//! A [`Stanza`] is produced by the stream/transport layer, handed to the router by
//! value and cloned once per accepting component, so no component ever observes
//! another component's mutations.

use std::fmt;
use std::str::FromStr;

use jid::Jid;
use minidom::Element;
use sha2::{Digest, Sha256};
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::{StanzaErrorCondition, StanzaErrorType, XopError};

/// XML namespace constants.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// XEP-0199 ping namespace
    pub const PING: &str = "urn:xmpp:ping";
}

/// Text sent with the error reply for IQs nobody answered.
pub const GENERIC_IQ_ERROR_TEXT: &str = "Unfortunately, we do not support this feature at this time.";

/// SHA-256 digest of a stanza's serialized form.
pub type Fingerprint = [u8; 32];

/// Top-level stanza kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// `<iq/>`
    Iq,
    /// Anything else the stream layer hands over
    Other,
}

impl StanzaKind {
    fn from_name(name: &str) -> Self {
        match name {
            "message" => Self::Message,
            "presence" => Self::Presence,
            "iq" => Self::Iq,
            _ => Self::Other,
        }
    }

    /// Get the kind name for tracing and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Iq => "iq",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IQ `type` attribute values (RFC 6120 Section 8.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    /// Request for information
    Get,
    /// Request to change state
    Set,
    /// Successful response
    Result,
    /// Error response
    Error,
}

impl IqType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    /// Whether this type expects exactly one response.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Get | Self::Set)
    }
}

impl FromStr for IqType {
    type Err = XopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Self::Get),
            "set" => Ok(Self::Set),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            other => Err(XopError::bad_request(Some(format!(
                "Unknown IQ type '{}'",
                other
            )))),
        }
    }
}

/// A parsed XMPP stanza.
///
/// The addressing attributes are parsed once at construction; the payload stays
/// an opaque [`Element`].
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    to: Option<Jid>,
    from: Option<Jid>,
    element: Element,
}

impl Stanza {
    /// Build a stanza from a parsed element.
    ///
    /// Fails if the `to` or `from` attribute is not a valid JID.
    pub fn from_element(element: Element) -> Result<Self, XopError> {
        let to = element.attr("to").map(Jid::from_str).transpose()?;
        let from = element.attr("from").map(Jid::from_str).transpose()?;

        Ok(Self {
            kind: StanzaKind::from_name(element.name()),
            to,
            from,
            element,
        })
    }

    /// Stanza kind.
    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    /// Destination address, if any.
    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    /// Source address, if any.
    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    /// The `id` attribute, used for IQ request/response correlation.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// The IQ type, for IQ stanzas with a recognised `type` attribute.
    pub fn iq_type(&self) -> Option<IqType> {
        if self.kind != StanzaKind::Iq {
            return None;
        }
        self.element.attr("type").and_then(|t| t.parse().ok())
    }

    /// The underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Consume the stanza and return the underlying element.
    pub fn into_element(self) -> Element {
        self.element
    }

    /// Serialize the stanza to XML.
    pub fn to_xml(&self) -> String {
        String::from(&self.element)
    }

    /// Content fingerprint of the serialized stanza.
    pub fn fingerprint(&self) -> Fingerprint {
        Sha256::digest(self.to_xml().as_bytes()).into()
    }

    /// Build an error reply for an IQ request.
    ///
    /// The reply carries the same `id`, is addressed back to the sender and claims
    /// to come from the original recipient. Returns `None` for non-IQ stanzas.
    pub fn iq_error(
        &self,
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<&str>,
    ) -> Option<Stanza> {
        if self.kind != StanzaKind::Iq {
            return None;
        }

        let namespace = self.element.ns();
        let mut error = Element::builder("error", namespace)
            .attr("type", error_type.as_str())
            .append(Element::builder(condition.as_str(), ns::STANZAS));
        if let Some(text) = text {
            error = error.append(Element::builder("text", ns::STANZAS).append(text.to_string()));
        }

        Some(self.iq_reply(IqType::Error, Some(error.build())))
    }

    /// Build the generic `feature-not-implemented` error reply for an IQ request.
    pub fn generic_iq_error(&self) -> Option<Stanza> {
        self.iq_error(
            StanzaErrorCondition::FeatureNotImplemented,
            StanzaErrorType::Cancel,
            Some(GENERIC_IQ_ERROR_TEXT),
        )
    }

    /// Build an empty `result` reply for an IQ request.
    pub fn iq_result(&self) -> Option<Stanza> {
        if self.kind != StanzaKind::Iq {
            return None;
        }
        Some(self.iq_reply(IqType::Result, None))
    }

    fn iq_reply(&self, iq_type: IqType, payload: Option<Element>) -> Stanza {
        let mut builder = Element::builder("iq", self.element.ns()).attr("type", iq_type.as_str());
        if let Some(id) = self.id() {
            builder = builder.attr("id", id);
        }
        if let Some(sender) = &self.from {
            builder = builder.attr("to", sender.to_string());
        }
        if let Some(recipient) = &self.to {
            builder = builder.attr("from", recipient.to_string());
        }
        if let Some(payload) = payload {
            builder = builder.append(payload);
        }

        Stanza {
            kind: StanzaKind::Iq,
            to: self.from.clone(),
            from: self.to.clone(),
            element: builder.build(),
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = XopError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        Self::from_element(element)
    }
}

impl FromStr for Stanza {
    type Err = XopError;

    fn from_str(xml: &str) -> Result<Self, Self::Err> {
        let element: Element = xml.parse()?;
        Self::from_element(element)
    }
}

// `Stanza::from(..)` resolves to the sender accessor; convert with `.into()`
// or `<Stanza as From<_>>::from(..)`.
impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        let to = message.to.clone();
        let from = message.from.clone();
        Self {
            kind: StanzaKind::Message,
            to,
            from,
            element: message.into(),
        }
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        let to = presence.to.clone();
        let from = presence.from.clone();
        Self {
            kind: StanzaKind::Presence,
            to,
            from,
            element: presence.into(),
        }
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        let to = iq.to.clone();
        let from = iq.from.clone();
        Self {
            kind: StanzaKind::Iq,
            to,
            from,
            element: iq.into(),
        }
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::presence::Type as PresenceType;

    fn parse(xml: &str) -> Stanza {
        xml.parse().unwrap()
    }

    #[test]
    fn test_kind_from_element_name() {
        let msg = parse("<message xmlns='jabber:client' to='foo@proxy'><body>hi</body></message>");
        assert_eq!(msg.kind(), StanzaKind::Message);

        let pres = parse("<presence xmlns='jabber:client' from='bar@proxy/phone'/>");
        assert_eq!(pres.kind(), StanzaKind::Presence);

        let iq = parse("<iq xmlns='jabber:client' type='get' id='q1'/>");
        assert_eq!(iq.kind(), StanzaKind::Iq);

        let other = parse("<r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(other.kind(), StanzaKind::Other);
    }

    #[test]
    fn test_addresses_are_parsed() {
        let msg = parse("<message xmlns='jabber:client' to='foo@proxy' from='bar@proxy/desk'/>");
        assert_eq!(msg.to().unwrap().to_string(), "foo@proxy");
        assert_eq!(msg.from().unwrap().to_string(), "bar@proxy/desk");
        assert_eq!(msg.to().unwrap().domain().as_str(), "proxy");
    }

    #[test]
    fn test_malformed_jid_is_rejected() {
        let result: Result<Stanza, _> = "<message xmlns='jabber:client' to='@'/>".parse();
        assert!(matches!(result, Err(XopError::Jid(_))));
    }

    #[test]
    fn test_iq_type() {
        assert_eq!(parse("<iq xmlns='jabber:client' type='set' id='a'/>").iq_type(), Some(IqType::Set));
        assert_eq!(parse("<iq xmlns='jabber:client' type='bogus' id='a'/>").iq_type(), None);
        assert_eq!(parse("<message xmlns='jabber:client' type='get'/>").iq_type(), None);
        assert!(IqType::Get.is_request());
        assert!(!IqType::Result.is_request());
    }

    #[test]
    fn test_generic_iq_error_reply() {
        let iq = parse("<iq xmlns='jabber:client' type='get' id='disco1' from='alice@proxy/phone' to='proxy'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>");
        let reply = iq.generic_iq_error().unwrap();

        assert_eq!(reply.kind(), StanzaKind::Iq);
        assert_eq!(reply.iq_type(), Some(IqType::Error));
        assert_eq!(reply.id(), Some("disco1"));
        assert_eq!(reply.to().unwrap().to_string(), "alice@proxy/phone");
        assert_eq!(reply.from().unwrap().to_string(), "proxy");

        let error = reply.element().get_child("error", ns::JABBER_CLIENT).unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.has_child("feature-not-implemented", ns::STANZAS));
        assert!(reply.to_xml().contains(GENERIC_IQ_ERROR_TEXT));
    }

    #[test]
    fn test_iq_result_reply() {
        let iq = parse("<iq xmlns='jabber:client' type='get' id='p1' from='alice@proxy/phone' to='proxy'><ping xmlns='urn:xmpp:ping'/></iq>");
        let reply = iq.iq_result().unwrap();
        assert_eq!(reply.iq_type(), Some(IqType::Result));
        assert_eq!(reply.id(), Some("p1"));
        assert_eq!(reply.element().children().count(), 0);
    }

    #[test]
    fn test_error_reply_only_for_iq() {
        let msg = parse("<message xmlns='jabber:client' to='foo@proxy'/>");
        assert!(msg.generic_iq_error().is_none());
        assert!(msg.iq_result().is_none());
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = parse("<message xmlns='jabber:client' to='foo@proxy'><body>hi</body></message>");
        let b = parse("<message xmlns='jabber:client' to='foo@proxy'><body>hi</body></message>");
        let c = parse("<message xmlns='jabber:client' to='foo@proxy'><body>bye</body></message>");

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_clone_is_equal() {
        let a = parse("<message xmlns='jabber:client' to='foo@proxy' from='bar@proxy'><body>hi</body></message>");
        let copy = a.clone();
        assert_eq!(a, copy);
    }

    #[test]
    fn test_from_typed_message() {
        let to: Jid = "foo@proxy".parse().unwrap();
        let mut message = Message::new(Some(to.clone()));
        message.id = Some("m1".to_string());

        let stanza: Stanza = message.into();
        assert_eq!(stanza.kind(), StanzaKind::Message);
        assert_eq!(stanza.to(), Some(&to));
        assert_eq!(stanza.id(), Some("m1"));
    }

    #[test]
    fn test_from_typed_presence_qualified() {
        let from: Jid = "alice@proxy/phone".parse().unwrap();
        let mut presence = Presence::new(PresenceType::None);
        presence.from = Some(from.clone());

        let stanza = <Stanza as From<Presence>>::from(presence);
        assert_eq!(stanza.kind(), StanzaKind::Presence);
        assert_eq!(stanza.from(), Some(&from));
        assert!(stanza.to().is_none());
    }
}
