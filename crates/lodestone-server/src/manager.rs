use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use lodestone_protocol_core::{
    Connection, ConnectionReader, ConnectionWriter, PacketRegistry, ProtocolAdapter,
    ProtocolState,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthKeys, AuthPool};
use crate::config::{OnlineMode, ServerConfig};
use crate::driver::SessionDriver;
use crate::event_loop::EventLoopGroup;
use crate::listener::SessionListener;
use crate::session::{Session, SessionError, SessionId, SessionSettings};

pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// State shared by every connection task.
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<PacketRegistry>,
    pub protocol_version: i32,
    pub version_name: &'static str,
    pub listener: Arc<dyn SessionListener>,
    pub sessions: Arc<SessionRegistry<Session>>,
    pub(crate) keys: Option<AuthKeys>,
    pub(crate) auth: Option<AuthPool>,
}

impl ServerContext {
    /// Build the registry for `adapter` and, when logins may be
    /// authenticated, the server keypair. `auth` is required unless online
    /// mode is off.
    pub fn new(
        config: Arc<ServerConfig>,
        adapter: &dyn ProtocolAdapter,
        listener: Arc<dyn SessionListener>,
        auth: Option<AuthPool>,
    ) -> anyhow::Result<Self> {
        let registry = adapter
            .build_registry()
            .context("failed to build packet registry")?;
        info!(
            "Registered {} packets for {} (protocol {})",
            registry.len(),
            adapter.version_name(),
            adapter.protocol_version()
        );

        let keys = if config.online_mode == OnlineMode::False {
            None
        } else {
            anyhow::ensure!(
                auth.is_some(),
                "online mode {} needs a session service",
                config.online_mode
            );
            Some(AuthKeys::generate().context("failed to generate server keypair")?)
        };

        Ok(Self {
            config,
            registry: Arc::new(registry),
            protocol_version: adapter.protocol_version(),
            version_name: adapter.version_name(),
            listener,
            sessions: Arc::new(SessionRegistry::new()),
            keys,
            auth,
        })
    }

    /// Sessions that have finished logging in and are still open.
    pub fn online_players(&self) -> Vec<Arc<Session>> {
        self.sessions
            .snapshot()
            .into_iter()
            .filter(|s| s.is_open() && s.protocol_state() == ProtocolState::Play)
            .collect()
    }
}

/// What the sweep needs from a live session.
pub trait Sweepable: Send + Sync + 'static {
    fn session_id(&self) -> SessionId;
    fn check_alive(self: &Arc<Self>);
    fn has_channel(&self) -> bool;
    fn is_channel_open(&self) -> bool;
    fn is_preparing(&self) -> bool;
    fn update(self: &Arc<Self>) -> Result<(), SessionError>;
    fn finish(self: &Arc<Self>);
}

impl Sweepable for Session {
    fn session_id(&self) -> SessionId {
        self.id()
    }

    fn check_alive(self: &Arc<Self>) {
        Session::check_alive(self)
    }

    fn has_channel(&self) -> bool {
        Session::has_channel(self)
    }

    fn is_channel_open(&self) -> bool {
        Session::is_channel_open(self)
    }

    fn is_preparing(&self) -> bool {
        Session::is_preparing(self)
    }

    fn update(self: &Arc<Self>) -> Result<(), SessionError> {
        Session::update(self)
    }

    fn finish(self: &Arc<Self>) {
        Session::finish(self)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
}

enum SweepStep {
    Skipped,
    Updated,
    Removed,
}

/// The live session set.
pub struct SessionRegistry<S> {
    sessions: DashMap<SessionId, Arc<S>>,
}

impl<S: Sweepable> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn insert(&self, session: Arc<S>) {
        self.sessions.insert(session.session_id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<S>> {
        self.sessions.remove(&id).map(|(_, s)| s)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<S>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Point-in-time copy; sessions may come and go while it is used.
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// One maintenance pass over every session. A failure in one session is
    /// logged and never stops the pass.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        for session in self.snapshot() {
            let id = session.session_id();
            match panic::catch_unwind(AssertUnwindSafe(|| self.sweep_one(&session))) {
                Ok(Ok(SweepStep::Updated)) => stats.updated += 1,
                Ok(Ok(SweepStep::Removed)) => stats.removed += 1,
                Ok(Ok(SweepStep::Skipped)) => {}
                Ok(Err(e)) => {
                    warn!("Error updating session {}: {}", id, e);
                    stats.failed += 1;
                }
                Err(_) => {
                    error!("Session {} panicked during update", id);
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    fn sweep_one(&self, session: &Arc<S>) -> Result<SweepStep, SessionError> {
        session.check_alive();
        if !session.has_channel() {
            return Ok(SweepStep::Skipped);
        }
        if !session.is_channel_open() && !session.is_preparing() {
            self.remove(session.session_id());
            session.finish();
            return Ok(SweepStep::Removed);
        }
        session.update()?;
        Ok(SweepStep::Updated)
    }
}

impl<S: Sweepable> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops the sweep thread when dropped.
pub struct SweepHandle {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SweepHandle {
    pub fn stop(mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn signal(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Run `registry.sweep()` every `interval` on a dedicated thread.
pub fn start_sweeper<S: Sweepable>(
    registry: Arc<SessionRegistry<S>>,
    interval: Duration,
) -> std::io::Result<SweepHandle> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let thread = thread::Builder::new()
        .name("connection-sweep".into())
        .spawn(move || {
            runtime.block_on(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let stats = registry.sweep();
                            if stats.removed > 0 || stats.failed > 0 {
                                debug!(
                                    "Sweep: {} updated, {} removed, {} failed",
                                    stats.updated, stats.removed, stats.failed
                                );
                            }
                        }
                        _ = &mut stop_rx => break,
                    }
                }
            });
        })?;
    Ok(SweepHandle {
        stop: Some(stop_tx),
        thread: Some(thread),
    })
}

/// Accepts sockets, creates their sessions and hands them to the event loops.
pub struct ConnectionManager {
    ctx: Arc<ServerContext>,
    loops: EventLoopGroup,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(ctx: Arc<ServerContext>, loops: EventLoopGroup) -> Self {
        Self {
            ctx,
            loops,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.ctx.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("New connection from {}", addr);
                    if let Err(e) = self.accept(socket, addr) {
                        warn!("Failed to set up connection from {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    fn new_session(&self, peer: SocketAddr) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            peer,
            SessionSettings::from(self.ctx.config.as_ref()),
            self.ctx.listener.clone(),
        );
        self.ctx.sessions.insert(session.clone());
        session
    }

    /// Register a freshly accepted socket and start its connection task on
    /// one of the event loops.
    pub fn accept(&self, socket: TcpStream, peer: SocketAddr) -> std::io::Result<Arc<Session>> {
        let _ = socket.set_nodelay(true);
        let socket = socket.into_std()?;
        let session = self.new_session(peer);

        let ctx = self.ctx.clone();
        let task_session = session.clone();
        let task = self.loops.spawn(async move {
            let socket = match TcpStream::from_std(socket) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Could not register socket of {}: {}", peer, e);
                    task_session.close(format!("Internal Exception: {}", e), false);
                    return;
                }
            };
            let (reader, writer) = Connection::new(socket, ctx.config.max_frame_size).into_split();
            if let Some(driver) = SessionDriver::new(task_session, reader, writer, ctx) {
                driver.run().await;
            }
        });
        session.set_task(task.abort_handle());
        Ok(session)
    }

    /// Like [`accept`](Self::accept) for any byte stream, on the current runtime.
    pub fn accept_stream<S>(&self, stream: S, peer: SocketAddr) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = self.new_session(peer);
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = ConnectionReader::new(read_half, self.ctx.config.max_frame_size);
        let writer = ConnectionWriter::new(write_half);
        if let Some(driver) = SessionDriver::new(session.clone(), reader, writer, self.ctx.clone()) {
            let task = tokio::spawn(driver.run());
            session.set_task(task.abort_handle());
        }
        session
    }

    pub fn start_sweeper(&self) -> std::io::Result<SweepHandle> {
        start_sweeper(self.ctx.sessions.clone(), SWEEP_INTERVAL)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.ctx.sessions.snapshot()
    }

    pub fn player_count(&self) -> usize {
        self.ctx.online_players().len()
    }

    /// Disconnect everyone.
    pub fn shutdown(&self) {
        let sessions = self.ctx.sessions.snapshot();
        info!("Disconnecting {} session(s)", sessions.len());
        for session in sessions {
            session.disconnect("Server closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct MockSession {
        id: SessionId,
        channel: bool,
        open: AtomicBool,
        preparing: bool,
        fail: bool,
        panic: bool,
        updates: AtomicUsize,
        finished: AtomicUsize,
    }

    impl MockSession {
        fn live(id: SessionId) -> Self {
            Self {
                id,
                channel: true,
                open: AtomicBool::new(true),
                ..Default::default()
            }
        }
    }

    impl Sweepable for MockSession {
        fn session_id(&self) -> SessionId {
            self.id
        }

        fn check_alive(self: &Arc<Self>) {}

        fn has_channel(&self) -> bool {
            self.channel
        }

        fn is_channel_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn is_preparing(&self) -> bool {
            self.preparing
        }

        fn update(self: &Arc<Self>) -> Result<(), SessionError> {
            if self.panic {
                panic!("session {} blew up", self.id);
            }
            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SessionError::TransportGone(self.id));
            }
            Ok(())
        }

        fn finish(self: &Arc<Self>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_one_failing_session_does_not_stop_the_sweep() {
        let registry = SessionRegistry::new();
        let mut sessions = Vec::new();
        for id in 0..1000 {
            let mut session = MockSession::live(id);
            session.panic = id == 500;
            session.fail = id == 700;
            let session = Arc::new(session);
            registry.insert(session.clone());
            sessions.push(session);
        }

        let stats = registry.sweep();
        assert_eq!(stats.updated, 998);
        assert_eq!(stats.failed, 2);
        for session in &sessions {
            let expected = usize::from(session.id != 500);
            assert_eq!(session.updates.load(Ordering::SeqCst), expected);
        }
        assert_eq!(registry.len(), 1000);
    }

    #[test]
    fn test_closed_sessions_are_removed_and_finished() {
        let registry = SessionRegistry::new();
        let closed = Arc::new(MockSession::live(1));
        closed.open.store(false, Ordering::SeqCst);
        let live = Arc::new(MockSession::live(2));
        registry.insert(closed.clone());
        registry.insert(live.clone());

        let stats = registry.sweep();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.updated, 1);
        assert!(registry.get(1).is_none());
        assert_eq!(closed.finished.load(Ordering::SeqCst), 1);
        assert_eq!(closed.updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sessions_without_channel_are_skipped() {
        let registry = SessionRegistry::new();
        let pending = Arc::new(MockSession {
            id: 3,
            preparing: true,
            ..Default::default()
        });
        registry.insert(pending.clone());
        let stats = registry.sweep();
        assert_eq!(stats, SweepStats::default());
        assert_eq!(registry.len(), 1);
        assert_eq!(pending.updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sweeper_thread_runs_and_stops() {
        let registry = Arc::new(SessionRegistry::new());
        let session = Arc::new(MockSession::live(9));
        registry.insert(session.clone());
        let handle = start_sweeper(registry, Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        handle.stop();
        assert!(session.updates.load(Ordering::SeqCst) >= 2);
    }
}
