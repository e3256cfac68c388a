//! Structured diagnostics for the fetch, rewrite, and relay steps.
//!
//! Core code never logs directly; it reports [`RelayEvent`]s to an injected
//! [`EventSink`]. Production wires [`TracingSink`], tests use
//! [`RecordingSink`] and assert on the recorded sequence.

use crate::classify::ContentClass;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// An outbound request is about to be sent with `profile`
    AttemptStarted {
        profile: &'static str,
        attempt: usize,
    },
    /// The origin answered `403` to `profile`; the next identity is tried
    IdentityRejected {
        profile: &'static str,
        attempt: usize,
    },
    /// The attempt that will be relayed to the client
    UpstreamResponded {
        profile: &'static str,
        attempt: usize,
        status: u16,
        final_url: String,
    },
    /// Network-level failure; no further identities are tried
    UpstreamFailed {
        profile: &'static str,
        attempt: usize,
        reason: String,
    },
    Classified {
        class: ContentClass,
    },
    /// A manifest URL could not be resolved and was emitted unchanged
    UrlLeftUnchanged {
        value: String,
        reason: String,
    },
    ManifestRewritten {
        class: ContentClass,
        rewritten: usize,
        untouched: usize,
    },
    StreamCompleted {
        bytes: u64,
    },
    /// The upstream body failed after bytes were already sent
    StreamAborted {
        bytes: u64,
        reason: String,
    },
    /// The client went away before the upstream body finished
    ClientDisconnected {
        bytes: u64,
    },
}

/// Receiver for [`RelayEvent`]s
pub trait EventSink: Send + Sync {
    fn record(&self, event: RelayEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: RelayEvent) {
        match event {
            RelayEvent::AttemptStarted { profile, attempt } => {
                debug!("Upstream attempt {} with identity '{}'", attempt, profile);
            }
            RelayEvent::IdentityRejected { profile, attempt } => {
                info!(
                    "Upstream rejected identity '{}' (attempt {}), falling back",
                    profile, attempt
                );
            }
            RelayEvent::UpstreamResponded {
                profile,
                attempt,
                status,
                final_url,
            } => {
                info!(
                    "Upstream responded {} via '{}' (attempt {}): {}",
                    status, profile, attempt, final_url
                );
            }
            RelayEvent::UpstreamFailed {
                profile,
                attempt,
                reason,
            } => {
                warn!(
                    "Upstream failed for identity '{}' (attempt {}): {}",
                    profile, attempt, reason
                );
            }
            RelayEvent::Classified { class } => debug!("Classified response as {:?}", class),
            RelayEvent::UrlLeftUnchanged { value, reason } => {
                warn!("Left manifest URL unchanged '{}': {}", value, reason);
            }
            RelayEvent::ManifestRewritten {
                class,
                rewritten,
                untouched,
            } => {
                debug!(
                    "Rewrote {:?} manifest: {} URLs wrapped, {} untouched",
                    class, rewritten, untouched
                );
            }
            RelayEvent::StreamCompleted { bytes } => debug!("Stream completed: {} bytes", bytes),
            RelayEvent::StreamAborted { bytes, reason } => {
                warn!("Upstream stream aborted after {} bytes: {}", bytes, reason);
            }
            RelayEvent::ClientDisconnected { bytes } => {
                info!("Client disconnected after {} bytes", bytes);
            }
        }
    }
}

/// Keeps every event in memory, in arrival order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RelayEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far
    pub fn events(&self) -> Vec<RelayEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: RelayEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}
