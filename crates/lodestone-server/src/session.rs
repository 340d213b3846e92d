use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use lodestone_protocol_core::{Packet, ProtocolState};
use lodestone_types::{GameProfile, TextComponent};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::config::ServerConfig;
use crate::listener::SessionListener;

pub type SessionId = u64;

/// How long a requested disconnect may stay unhandled before the sweep drops
/// the connection task outright.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Why a session ended. `was_safe` is false for errors and lost connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub message: String,
    pub was_safe: bool,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection task of session {0} has gone away")]
    TransportGone(SessionId),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub player_timeout: Duration,
    pub preparing_timeout: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            player_timeout: config.player_timeout(),
            preparing_timeout: config.preparing_timeout(),
        }
    }
}

/// Messages from the session to its connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Packet),
    Disconnect(TextComponent),
    VerificationComplete(Result<GameProfile, AuthError>),
    Close,
}

enum Transport {
    /// No connection task yet; outbound packets wait here in order.
    Pending(VecDeque<Packet>),
    Active(UnboundedSender<Command>),
    /// The sender is kept so a repeated close can still reach the task.
    Closed(Option<UnboundedSender<Command>>),
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    created_at: Instant,
    settings: SessionSettings,
    state: AtomicU8,
    transport: Mutex<Transport>,
    task: Mutex<Option<AbortHandle>>,
    disconnect_requested: Mutex<Option<(String, Instant)>>,
    identity: OnceLock<GameProfile>,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    last_keep_alive: Mutex<Instant>,
    keep_alive_sent: Mutex<Option<(i64, Instant)>>,
    ping_ms: AtomicU32,
    encrypted: AtomicBool,
    compression_threshold: AtomicI32,
    verifying: AtomicBool,
    listener: Arc<dyn SessionListener>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        settings: SessionSettings,
        listener: Arc<dyn SessionListener>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id,
            peer,
            created_at: now,
            settings,
            state: AtomicU8::new(ProtocolState::Handshake.index() as u8),
            transport: Mutex::new(Transport::Pending(VecDeque::new())),
            task: Mutex::new(None),
            disconnect_requested: Mutex::new(None),
            identity: OnceLock::new(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            last_keep_alive: Mutex::new(now),
            keep_alive_sent: Mutex::new(None),
            ping_ms: AtomicU32::new(0),
            encrypted: AtomicBool::new(false),
            compression_threshold: AtomicI32::new(-1),
            verifying: AtomicBool::new(false),
            listener,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn protocol_state(&self) -> ProtocolState {
        ProtocolState::from_index(self.state.load(Ordering::Acquire) as usize)
            .unwrap_or(ProtocolState::Handshake)
    }

    /// The verified profile, once login has completed.
    pub fn identity(&self) -> Option<&GameProfile> {
        self.identity.get()
    }

    /// Smoothed keep-alive round trip.
    pub fn ping(&self) -> Duration {
        Duration::from_millis(self.ping_ms.load(Ordering::Relaxed) as u64)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().unwrap().clone()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::Acquire)
    }

    pub fn compression_threshold(&self) -> i32 {
        self.compression_threshold.load(Ordering::Acquire)
    }

    /// Queue a packet for delivery. Packets sent before the connection task
    /// picks the session up are delivered first, in order.
    pub fn send(&self, packet: Packet) {
        if self.is_closed() {
            self.signal_close();
            return;
        }
        if let Packet::KeepAliveClientbound { id } = packet {
            *self.keep_alive_sent.lock().unwrap() = Some((id, Instant::now()));
        }
        let mut transport = self.transport.lock().unwrap();
        match &mut *transport {
            Transport::Pending(queue) => queue.push_back(packet),
            Transport::Active(tx) => {
                if tx.send(Command::Send(packet)).is_err() {
                    debug!("Session {} dropped an outbound packet: task gone", self.id);
                }
            }
            Transport::Closed(_) => {}
        }
    }

    pub fn send_all(&self, packets: impl IntoIterator<Item = Packet>) {
        for packet in packets {
            self.send(packet);
        }
    }

    /// Send a disconnect packet (when the state has one) and close.
    pub fn disconnect(self: &Arc<Self>, reason: impl Into<TextComponent>) {
        let reason = reason.into();
        if self.is_closed() {
            self.signal_close();
            return;
        }
        let delivered = match &*self.transport.lock().unwrap() {
            Transport::Active(tx) => tx.send(Command::Disconnect(reason.clone())).is_ok(),
            _ => false,
        };
        if delivered {
            self.disconnect_requested
                .lock()
                .unwrap()
                .get_or_insert_with(|| (reason.flatten(), Instant::now()));
        } else {
            self.close(reason.flatten(), true);
        }
    }

    /// Mark the session closed and notify the listener. Only the first call
    /// has an effect; later ones just poke the connection task again.
    pub fn close(self: &Arc<Self>, reason: impl Into<String>, was_safe: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.signal_close();
            return;
        }

        let reason = CloseReason {
            message: reason.into(),
            was_safe,
        };
        *self.close_reason.lock().unwrap() = Some(reason.clone());

        {
            let mut transport = self.transport.lock().unwrap();
            let tx = match std::mem::replace(&mut *transport, Transport::Closed(None)) {
                Transport::Active(tx) => {
                    let _ = tx.send(Command::Close);
                    Some(tx)
                }
                Transport::Closed(tx) => tx,
                Transport::Pending(_) => None,
            };
            *transport = Transport::Closed(tx);
        }

        match self.identity() {
            Some(profile) => info!(
                "{} ({}) lost connection: {}",
                profile.name, self.peer, reason.message
            ),
            None => debug!(
                "Session {} ({}) closed: {}",
                self.id, self.peer, reason.message
            ),
        }

        self.listener.on_session_closed(self, &reason);
    }

    fn signal_close(&self) {
        if let Transport::Closed(Some(tx)) = &*self.transport.lock().unwrap() {
            let _ = tx.send(Command::Close);
        }
    }

    /// Periodic maintenance from the sweep: checks that the connection task
    /// is still alive, then runs [`check_alive`](Self::check_alive).
    pub fn update(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.is_closed() {
            self.signal_close();
            return Ok(());
        }
        let gone = match &*self.transport.lock().unwrap() {
            Transport::Active(tx) => tx.is_closed(),
            _ => false,
        };
        if gone {
            self.close("Connection lost", false);
            return Err(SessionError::TransportGone(self.id));
        }
        self.check_alive();
        Ok(())
    }

    /// Close sessions that never got a connection task, and disconnect
    /// sessions whose keep-alive has gone stale. A disconnect the connection
    /// task has not acted on within [`DISCONNECT_GRACE`] (a client that stopped
    /// reading blocks its writes) is escalated to a close that aborts the task.
    pub fn check_alive(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let requested = self.disconnect_requested.lock().unwrap().clone();
        if let Some((reason, at)) = requested {
            if at.elapsed() > DISCONNECT_GRACE {
                warn!(
                    "Session {} ({}) did not take its disconnect, dropping the connection",
                    self.id, self.peer
                );
                self.close(reason, false);
                self.abort_task();
            }
            return;
        }
        let unattached = matches!(&*self.transport.lock().unwrap(), Transport::Pending(_));
        if unattached && self.created_at.elapsed() > self.settings.preparing_timeout {
            self.close("Timed out during connection setup", false);
            return;
        }
        let idle = self.last_keep_alive.lock().unwrap().elapsed();
        if idle > self.settings.player_timeout {
            self.disconnect("Timed out");
        }
    }

    fn abort_task(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Still waiting for a connection task, and within the grace period.
    pub fn is_preparing(&self) -> bool {
        matches!(&*self.transport.lock().unwrap(), Transport::Pending(_))
            && self.created_at.elapsed() <= self.settings.preparing_timeout
    }

    pub fn has_channel(&self) -> bool {
        !matches!(&*self.transport.lock().unwrap(), Transport::Pending(_))
    }

    pub fn is_channel_open(&self) -> bool {
        match &*self.transport.lock().unwrap() {
            Transport::Active(tx) => !tx.is_closed(),
            _ => false,
        }
    }

    /// Final cleanup once the session has been dropped from the live set.
    pub fn finish(self: &Arc<Self>) {
        if !self.is_closed() {
            self.close("Connection closed", true);
        }
        debug!("Session {} finished", self.id);
    }

    /// Record activity from the client. Gameplay code may call this for
    /// packets that prove the client is alive.
    pub fn touch_keep_alive(&self) {
        *self.last_keep_alive.lock().unwrap() = Instant::now();
    }

    pub(crate) fn keep_alive_received(&self, id: i64) {
        let sent = {
            let mut slot = self.keep_alive_sent.lock().unwrap();
            match *slot {
                Some((sent_id, at)) if sent_id == id => {
                    *slot = None;
                    Some(at)
                }
                _ => None,
            }
        };
        if let Some(at) = sent {
            let rtt = at.elapsed().as_millis().min(u32::MAX as u128) as u64;
            let old = self.ping_ms.load(Ordering::Relaxed) as u64;
            self.ping_ms
                .store(((old * 3 + rtt) / 4) as u32, Ordering::Relaxed);
        }
        self.touch_keep_alive();
    }

    /// Hand the session to its connection task. Anything queued so far is
    /// forwarded first. Fails if the session was closed in the meantime.
    pub(crate) fn attach(&self, tx: UnboundedSender<Command>) -> bool {
        let mut transport = self.transport.lock().unwrap();
        if self.is_closed() {
            return false;
        }
        if let Transport::Pending(queue) = &mut *transport {
            for packet in queue.drain(..) {
                let _ = tx.send(Command::Send(packet));
            }
        }
        *transport = Transport::Active(tx);
        true
    }

    /// Remember the connection task so a stuck one can be aborted.
    pub(crate) fn set_task(&self, task: AbortHandle) {
        *self.task.lock().unwrap() = Some(task);
    }

    /// Forward a command to the connection task if it is still running.
    pub(crate) fn deliver(&self, command: Command) -> bool {
        match &*self.transport.lock().unwrap() {
            Transport::Active(tx) => tx.send(command).is_ok(),
            _ => false,
        }
    }

    pub(crate) fn set_protocol_state(&self, state: ProtocolState) {
        self.state.store(state.index() as u8, Ordering::Release);
    }

    /// Attach the verified profile. The identity can be set only once.
    pub(crate) fn set_identity(&self, profile: GameProfile) -> bool {
        self.identity.set(profile).is_ok()
    }

    /// Returns false if encryption was already on.
    pub(crate) fn mark_encrypted(&self) -> bool {
        !self.encrypted.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_compression_threshold(&self, threshold: i32) {
        self.compression_threshold.store(threshold, Ordering::Release);
    }

    /// Claim the single verification slot of this session.
    pub(crate) fn begin_verification(&self) -> bool {
        !self.verifying.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_verification(&self) {
        self.verifying.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.protocol_state())
            .field("identity", &self.identity().map(|p| &p.name))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Send a copy of `packet` to every recipient.
pub fn broadcast<'a>(packet: &Packet, recipients: impl IntoIterator<Item = &'a Arc<Session>>) {
    for session in recipients {
        session.send(packet.clone());
    }
}
