use lodestone_protocol_core::Packet;
use lodestone_types::{ServerStatus, StatusPlayers, StatusSample, StatusVersion, TextComponent};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::driver::{unexpected, DriverError, Flow, SessionDriver};
use crate::manager::ServerContext;

/// Players listed in the server list hover.
const SAMPLE_SIZE: usize = 12;

/// The JSON body of a status response.
pub fn build_status(ctx: &ServerContext) -> ServerStatus {
    let players = ctx.online_players();
    let sample = players
        .iter()
        .filter_map(|s| s.identity())
        .take(SAMPLE_SIZE)
        .map(|p| StatusSample {
            name: p.name.clone(),
            id: p.uuid,
        })
        .collect();

    ServerStatus {
        version: StatusVersion {
            name: ctx.version_name.to_string(),
            protocol: ctx.protocol_version,
        },
        players: StatusPlayers {
            max: ctx.config.max_players,
            online: players.len() as u32,
            sample,
        },
        description: TextComponent::plain(&ctx.config.motd),
        favicon: None,
    }
}

impl<R, W> SessionDriver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) async fn handle_status(&mut self, packet: Packet) -> Result<Flow, DriverError> {
        match packet {
            Packet::StatusRequest => {
                if self.status_answered {
                    return Err(DriverError::Protocol("Status request sent twice".into()));
                }
                self.status_answered = true;
                let json = serde_json::to_string(&build_status(&self.ctx))
                    .map_err(|e| DriverError::Handler(e.into()))?;
                self.write(&Packet::StatusResponse { json }).await?;
                Ok(Flow::Continue)
            }
            Packet::PingRequest { payload } => {
                self.write(&Packet::PongResponse { payload }).await?;
                self.session.close("Status ping complete", true);
                Ok(Flow::Stop)
            }
            other => Err(unexpected(self.state, &other)),
        }
    }
}
