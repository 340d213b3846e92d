use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use lodestone_protocol_core::{
    ConnectionError, ConnectionReader, ConnectionWriter, Direction, Packet, PacketError,
    ProtocolState, RawPacket,
};
use lodestone_types::TextComponent;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::login::LoginStage;
use crate::manager::ServerContext;
use crate::session::{Command, Session};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("Read timed out")]
    ReadTimeout,
    #[error("Write timed out")]
    WriteTimeout,
    #[error("{0}")]
    Protocol(String),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Whether the connection task keeps going after a packet or command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) struct SessionDriver<R, W> {
    pub(crate) session: Arc<Session>,
    pub(crate) reader: ConnectionReader<R>,
    pub(crate) writer: ConnectionWriter<W>,
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) state: ProtocolState,
    pub(crate) login: LoginStage,
    pub(crate) status_answered: bool,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<R, W> SessionDriver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Attach a connection task to `session`. Returns `None` if the session
    /// was closed before the socket got here.
    pub(crate) fn new(
        session: Arc<Session>,
        reader: ConnectionReader<R>,
        writer: ConnectionWriter<W>,
        ctx: Arc<ServerContext>,
    ) -> Option<Self> {
        let (tx, commands) = mpsc::unbounded_channel();
        if !session.attach(tx) {
            debug!("Session {} closed before its connection task started", session.id());
            return None;
        }
        Some(Self {
            session,
            reader,
            writer,
            ctx,
            state: ProtocolState::Handshake,
            login: LoginStage::Hello,
            status_answered: false,
            commands,
        })
    }

    pub(crate) async fn run(mut self) {
        debug!(
            "Session {} started for {}",
            self.session.id(),
            self.session.peer_addr()
        );
        if let Err(err) = self.drive().await {
            self.fail(err).await;
        }
        let _ = self.writer.shutdown().await;
        if self.session.is_open() {
            self.session.close("Disconnected", true);
        }
    }

    async fn drive(&mut self) -> Result<(), DriverError> {
        let read_timeout = self.ctx.config.read_timeout();
        let mut deadline = Instant::now() + read_timeout;
        loop {
            tokio::select! {
                read = self.reader.read_packet() => {
                    let Some(raw) = read? else {
                        self.session.close("Disconnected", true);
                        return Ok(());
                    };
                    deadline = Instant::now() + read_timeout;
                    if self.handle_raw(raw).await? == Flow::Stop {
                        return Ok(());
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    if self.handle_command(command).await? == Flow::Stop {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(DriverError::ReadTimeout);
                }
            }
        }
    }

    async fn handle_raw(&mut self, raw: RawPacket) -> Result<Flow, DriverError> {
        if self.session.is_closed() {
            return Ok(Flow::Stop);
        }
        let RawPacket { id, mut body } = raw;
        let packet = self
            .ctx
            .registry
            .decode(self.state, Direction::Serverbound, id, &mut body)?;
        trace!("[{}] <- {:?}", self.state, packet.kind());
        match self.state {
            ProtocolState::Handshake => self.handle_handshake(packet).await,
            ProtocolState::Status => self.handle_status(packet).await,
            ProtocolState::Login => self.handle_login(packet).await,
            ProtocolState::Play => self.handle_play(packet),
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<Flow, DriverError> {
        match command {
            Command::Send(packet) => {
                match self
                    .ctx
                    .registry
                    .encode(self.state, Direction::Clientbound, &packet)
                {
                    Ok(bytes) => self.write_bytes(&bytes).await?,
                    Err(e) => error!(
                        "Dropping packet queued for session {}: {}",
                        self.session.id(),
                        e
                    ),
                }
                Ok(Flow::Continue)
            }
            Command::Disconnect(reason) => self.disconnect(reason).await,
            Command::VerificationComplete(result) => self.complete_verification(result).await,
            Command::Close => Ok(Flow::Stop),
        }
    }

    async fn handle_handshake(&mut self, packet: Packet) -> Result<Flow, DriverError> {
        let (protocol_version, server_address, server_port, next_state) = match packet {
            Packet::Handshake {
                protocol_version,
                server_address,
                server_port,
                next_state,
            } => (protocol_version, server_address, server_port, next_state),
            other => return Err(unexpected(self.state, &other)),
        };
        debug!(
            "Handshake from {}: protocol={}, address={}:{}, next={}",
            self.session.peer_addr(),
            protocol_version,
            server_address,
            server_port,
            next_state
        );

        match ProtocolState::from_handshake_next(next_state) {
            Some(ProtocolState::Status) => {
                self.set_state(ProtocolState::Status);
                Ok(Flow::Continue)
            }
            Some(ProtocolState::Login) => {
                self.set_state(ProtocolState::Login);
                let ours = self.ctx.protocol_version;
                if protocol_version != ours {
                    let reason = if protocol_version < ours {
                        format!("Outdated client! Please use {}", self.ctx.version_name)
                    } else {
                        format!("Outdated server! I'm still on {}", self.ctx.version_name)
                    };
                    return self.disconnect(reason.into()).await;
                }
                Ok(Flow::Continue)
            }
            _ => Err(DriverError::Protocol(format!(
                "Invalid next state {}",
                next_state
            ))),
        }
    }

    fn handle_play(&mut self, packet: Packet) -> Result<Flow, DriverError> {
        if let Packet::KeepAliveServerbound { id } = packet {
            self.session.keep_alive_received(id);
            return Ok(Flow::Continue);
        }
        let listener = self.ctx.listener.clone();
        let session = self.session.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| {
            listener.on_packet_received(&session, packet)
        })) {
            Ok(result) => result?,
            Err(_) => {
                return Err(DriverError::Handler(anyhow::anyhow!(
                    "packet handler panicked"
                )))
            }
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn set_state(&mut self, state: ProtocolState) {
        debug!(
            "Session {}: {} -> {}",
            self.session.id(),
            self.state,
            state
        );
        self.state = state;
        self.session.set_protocol_state(state);
    }

    pub(crate) async fn write(&mut self, packet: &Packet) -> Result<(), DriverError> {
        let bytes = self
            .ctx
            .registry
            .encode(self.state, Direction::Clientbound, packet)?;
        self.write_bytes(&bytes).await?;
        trace!("[{}] -> {:?}", self.state, packet.kind());
        Ok(())
    }

    /// A client that stops reading must not park the task forever, so every
    /// write shares the read timeout.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        let limit = self.ctx.config.read_timeout();
        match tokio::time::timeout(limit, self.writer.write_packet(bytes)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DriverError::WriteTimeout),
        }
    }

    /// Best effort: only LOGIN and PLAY have a disconnect packet.
    async fn send_disconnect(&mut self, reason: &TextComponent) {
        let packet = match self.state {
            ProtocolState::Login => Packet::LoginDisconnect {
                reason: reason.clone(),
            },
            ProtocolState::Play => Packet::Disconnect {
                reason: reason.clone(),
            },
            _ => return,
        };
        if let Err(e) = self.write(&packet).await {
            debug!(
                "Could not send disconnect to {}: {}",
                self.session.peer_addr(),
                e
            );
        }
    }

    pub(crate) async fn disconnect(&mut self, reason: TextComponent) -> Result<Flow, DriverError> {
        self.send_disconnect(&reason).await;
        self.session.close(reason.flatten(), true);
        Ok(Flow::Stop)
    }

    async fn fail(&mut self, err: DriverError) {
        let peer = self.session.peer_addr();
        match &err {
            DriverError::Connection(ConnectionError::Io(e)) => {
                debug!("Connection {} lost: {}", peer, e);
                self.session.close(format!("Connection lost: {}", e), false);
                return;
            }
            DriverError::ReadTimeout => {
                debug!("Connection {} timed out", peer);
                let reason = TextComponent::plain("Timed out");
                self.send_disconnect(&reason).await;
                self.session.close(reason.text, false);
                return;
            }
            DriverError::WriteTimeout => {
                debug!("Connection {} stopped reading", peer);
                self.session.close("Timed out", false);
                return;
            }
            DriverError::Handler(e) => {
                error!("Error handling packet from {}: {:#}", peer, e);
            }
            _ => {
                warn!("Protocol error from {}: {}", peer, err);
            }
        }
        let reason = TextComponent::plain(format!("Internal Exception: {}", err));
        self.send_disconnect(&reason).await;
        self.session.close(reason.text, false);
    }
}

pub(crate) fn unexpected(state: ProtocolState, packet: &Packet) -> DriverError {
    DriverError::Protocol(format!("Unexpected {:?} in {}", packet.kind(), state))
}
