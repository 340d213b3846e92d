use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use lodestone_protocol_core::Packet;
use lodestone_types::GameProfile;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::listener::SessionListener;
use crate::session::{broadcast, CloseReason, Session, SessionId};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// A player that finished logging in.
pub struct PlayerHandle {
    pub session: Arc<Session>,
    pub profile: GameProfile,
    pub joined_at: Instant,
}

/// The players currently in PLAY, kept up to date through the session hooks.
#[derive(Default)]
pub struct PlayerList {
    players: DashMap<SessionId, PlayerHandle>,
}

impl PlayerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.players
            .iter()
            .map(|p| p.value().profile.name.clone())
            .collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.players
            .iter()
            .map(|p| p.value().session.clone())
            .collect()
    }

    pub fn broadcast(&self, packet: &Packet) {
        broadcast(packet, &self.sessions());
    }

    /// Ping every player. The id is a millisecond timestamp, like vanilla.
    pub fn tick_keep_alive(&self) {
        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        self.broadcast(&Packet::KeepAliveClientbound { id });
    }
}

impl SessionListener for PlayerList {
    fn on_session_ready(&self, session: &Arc<Session>, profile: &GameProfile) {
        info!("{} joined the game", profile.name);
        self.players.insert(
            session.id(),
            PlayerHandle {
                session: session.clone(),
                profile: profile.clone(),
                joined_at: Instant::now(),
            },
        );
    }

    fn on_packet_received(&self, session: &Arc<Session>, packet: Packet) -> anyhow::Result<()> {
        match packet {
            Packet::PluginMessage { channel, data } => {
                debug!(
                    "Plugin message from session {} on {} ({} bytes)",
                    session.id(),
                    channel,
                    data.len()
                );
            }
            other => debug!("Unhandled {:?} from session {}", other.kind(), session.id()),
        }
        Ok(())
    }

    fn on_session_closed(&self, session: &Arc<Session>, _reason: &CloseReason) {
        if let Some((_, player)) = self.players.remove(&session.id()) {
            info!(
                "{} left the game after {}s",
                player.profile.name,
                player.joined_at.elapsed().as_secs()
            );
        }
    }
}

/// Send keep-alives every [`KEEP_ALIVE_INTERVAL`] until `shutdown` flips.
pub async fn run_keep_alive(players: Arc<PlayerList>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => players.tick_keep_alive(),
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;

    fn session(id: SessionId) -> Arc<Session> {
        Session::new(
            id,
            "127.0.0.1:30000".parse().unwrap(),
            SessionSettings {
                player_timeout: Duration::from_secs(30),
                preparing_timeout: Duration::from_secs(10),
            },
            Arc::new(crate::listener::NoopListener),
        )
    }

    #[test]
    fn test_players_follow_session_lifecycle() {
        let list = PlayerList::new();
        let a = session(1);
        let b = session(2);
        list.on_session_ready(&a, &GameProfile::offline("Steve"));
        list.on_session_ready(&b, &GameProfile::offline("Alex"));
        assert_eq!(list.len(), 2);

        list.on_session_closed(
            &a,
            &CloseReason {
                message: "Disconnected".into(),
                was_safe: true,
            },
        );
        assert_eq!(list.names(), vec!["Alex".to_string()]);
    }
}
