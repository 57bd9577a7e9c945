//! Duplicate stanza suppression.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;

use super::PacketInterceptor;
use crate::stanza::{Fingerprint, Stanza, StanzaKind};
use crate::XopError;

/// Default number of presence senders remembered.
pub const DEFAULT_PRESENCE_SENDERS: usize = 4096;

/// Rejects stanzas whose content was seen recently.
///
/// Messages share one bounded fingerprint cache, evicted oldest first.
/// Presences are tracked per sender address with room for a single
/// fingerprint, so only an exact repeat of a sender's latest presence is
/// dropped. The sender table is bounded too; the least recently active sender
/// is forgotten first. Every other kind passes.
#[derive(Debug)]
pub struct DuplicateInterceptor {
    messages: Mutex<LruCache<Fingerprint, ()>>,
    presences: Mutex<LruCache<String, Fingerprint>>,
}

impl DuplicateInterceptor {
    /// Create an interceptor remembering up to `cache_size` message fingerprints
    /// and the latest presence of up to `presence_senders` senders.
    pub fn new(cache_size: usize, presence_senders: usize) -> Self {
        Self {
            messages: Mutex::new(LruCache::new(capacity(cache_size))),
            presences: Mutex::new(LruCache::new(capacity(presence_senders))),
        }
    }

    /// Get the number of presence senders being tracked.
    pub fn tracked_senders(&self) -> usize {
        self.presences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check_message(&self, fingerprint: Fingerprint) -> bool {
        let mut seen = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        // `contains` does not promote, so eviction stays in insertion order
        if seen.contains(&fingerprint) {
            return false;
        }
        seen.put(fingerprint, ());
        true
    }

    fn check_presence(&self, sender: String, fingerprint: Fingerprint) -> bool {
        let mut latest = self.presences.lock().unwrap_or_else(PoisonError::into_inner);
        if latest.get(&sender) == Some(&fingerprint) {
            return false;
        }
        latest.put(sender, fingerprint);
        true
    }
}

impl Default for DuplicateInterceptor {
    fn default() -> Self {
        Self::new(512, DEFAULT_PRESENCE_SENDERS)
    }
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl PacketInterceptor for DuplicateInterceptor {
    fn name(&self) -> &str {
        "duplicate"
    }

    fn intercept(&self, stanza: &Stanza) -> Result<bool, XopError> {
        match stanza.kind() {
            StanzaKind::Message => Ok(self.check_message(stanza.fingerprint())),
            StanzaKind::Presence => match stanza.from() {
                Some(sender) => Ok(self.check_presence(sender.to_string(), stanza.fingerprint())),
                None => Ok(true),
            },
            StanzaKind::Iq | StanzaKind::Other => Ok(true),
        }
    }
}
