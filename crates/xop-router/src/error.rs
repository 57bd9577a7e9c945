//! Error types for the XOP router.

use thiserror::Error;

/// XOP router errors.
#[derive(Debug, Error)]
pub enum XopError {
    /// XML parsing error
    #[error("XML parse error: {0}")]
    Xml(#[from] minidom::Error),

    /// Malformed address in a stanza
    #[error("Malformed JID: {0}")]
    Jid(#[from] jid::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A component failed during construction, initialization, processing or shutdown
    #[error("Component {name} failed: {reason}")]
    Component {
        /// Route identity of the component
        name: String,
        /// Error description
        reason: String,
    },

    /// No component is registered under the requested name
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// The router was constructed outside of a Tokio runtime
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),

    /// The router has been shut down
    #[error("Router is shut down")]
    ShutDown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (for IQ error responses)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XopError {
    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new component error.
    pub fn component(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Component {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::BadRequest,
            error_type: StanzaErrorType::Modify,
            text,
        }
    }

    /// Create a stanza error for 'feature-not-implemented'.
    pub fn feature_not_implemented(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::FeatureNotImplemented,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::ServiceUnavailable,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Undefined condition
    UndefinedCondition,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
