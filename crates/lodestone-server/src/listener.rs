use std::sync::Arc;

use lodestone_protocol_core::Packet;
use lodestone_types::GameProfile;

use crate::session::{CloseReason, Session};

/// Hooks for the gameplay layer. Called from connection tasks, so
/// implementations must not block.
pub trait SessionListener: Send + Sync + 'static {
    /// Login finished; the session is now in PLAY with `profile` attached.
    fn on_session_ready(&self, _session: &Arc<Session>, _profile: &GameProfile) {}

    /// A PLAY packet arrived. Returning an error closes the session.
    fn on_packet_received(&self, _session: &Arc<Session>, _packet: Packet) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once per session, whatever the cause of the close.
    fn on_session_closed(&self, _session: &Arc<Session>, _reason: &CloseReason) {}
}

/// A listener that ignores everything.
#[derive(Debug, Default)]
pub struct NoopListener;

impl SessionListener for NoopListener {}
