use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Whether logins are checked against the session service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineMode {
    True,
    False,
    /// Authenticate everyone except loopback peers.
    Auto,
}

impl OnlineMode {
    pub fn authenticates(self, peer: &SocketAddr) -> bool {
        match self {
            OnlineMode::True => true,
            OnlineMode::False => false,
            OnlineMode::Auto => !peer.ip().is_loopback(),
        }
    }
}

impl<'de> Deserialize<'de> for OnlineMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Accept both `online_mode = true` and `online_mode = "auto"`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flag(true) => Ok(OnlineMode::True),
            Repr::Flag(false) => Ok(OnlineMode::False),
            Repr::Text(text) => match text.to_ascii_lowercase().as_str() {
                "true" => Ok(OnlineMode::True),
                "false" => Ok(OnlineMode::False),
                "auto" => Ok(OnlineMode::Auto),
                other => Err(serde::de::Error::custom(format!(
                    "invalid online_mode {:?}, expected true, false or auto",
                    other
                ))),
            },
        }
    }
}

impl std::fmt::Display for OnlineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OnlineMode::True => "true",
            OnlineMode::False => "false",
            OnlineMode::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Which event-loop implementation owns the sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportBackend {
    /// `per-core` on Linux, `portable` elsewhere.
    Auto,
    /// One work-stealing multi-threaded runtime.
    Portable,
    /// One single-threaded runtime per worker thread.
    PerCore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default = "default_online_mode")]
    pub online_mode: OnlineMode,
    /// Packets at least this long are compressed. Negative disables compression.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: i32,
    /// A connection that sends no bytes for this long is closed.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// A session whose keep-alive is older than this is disconnected.
    #[serde(default = "default_player_timeout_secs")]
    pub player_timeout_secs: u64,
    /// How long an accepted socket may wait for its event loop to pick it up.
    #[serde(default = "default_preparing_timeout_secs")]
    pub preparing_timeout_secs: u64,
    /// Event-loop threads; 0 means one per available core.
    #[serde(default)]
    pub event_loop_threads: usize,
    #[serde(default = "default_transport")]
    pub transport: TransportBackend,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_auth_workers")]
    pub auth_workers: usize,
    #[serde(default = "default_session_server")]
    pub session_server: String,
    /// Pass the client address to the session service, which then rejects
    /// logins coming from a different address than the one that joined.
    #[serde(default)]
    pub prevent_proxy_connections: bool,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    25565
}

fn default_max_players() -> u32 {
    20
}

fn default_motd() -> String {
    "A Lodestone Server".into()
}

fn default_online_mode() -> OnlineMode {
    OnlineMode::True
}

fn default_compression_threshold() -> i32 {
    256
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_player_timeout_secs() -> u64 {
    30
}

fn default_preparing_timeout_secs() -> u64 {
    10
}

fn default_transport() -> TransportBackend {
    TransportBackend::Auto
}

fn default_max_frame_size() -> usize {
    lodestone_protocol_core::DEFAULT_MAX_FRAME_LEN
}

fn default_auth_workers() -> usize {
    4
}

fn default_session_server() -> String {
    "https://sessionserver.mojang.com".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_players: default_max_players(),
            motd: default_motd(),
            online_mode: default_online_mode(),
            compression_threshold: default_compression_threshold(),
            read_timeout_secs: default_read_timeout_secs(),
            player_timeout_secs: default_player_timeout_secs(),
            preparing_timeout_secs: default_preparing_timeout_secs(),
            event_loop_threads: 0,
            transport: default_transport(),
            max_frame_size: default_max_frame_size(),
            auth_workers: default_auth_workers(),
            session_server: default_session_server(),
            prevent_proxy_connections: false,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: ServerConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn player_timeout(&self) -> Duration {
        Duration::from_secs(self.player_timeout_secs)
    }

    pub fn preparing_timeout(&self) -> Duration {
        Duration::from_secs(self.preparing_timeout_secs)
    }

    pub fn event_loop_threads(&self) -> usize {
        if self.event_loop_threads > 0 {
            return self.event_loop_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, 25565);
        assert_eq!(config.online_mode, OnlineMode::True);
        assert_eq!(config.compression_threshold, 256);
        assert_eq!(config.transport, TransportBackend::Auto);
        assert_eq!(config.max_frame_size, 2 * 1024 * 1024);
        assert!(!config.prevent_proxy_connections);
    }

    #[test]
    fn test_online_mode_forms() {
        for (text, expected) in [
            ("online_mode = true", OnlineMode::True),
            ("online_mode = false", OnlineMode::False),
            ("online_mode = \"AUTO\"", OnlineMode::Auto),
            ("online_mode = \"false\"", OnlineMode::False),
        ] {
            let config: ServerConfig = toml::from_str(text).unwrap();
            assert_eq!(config.online_mode, expected, "{}", text);
        }
        assert!(toml::from_str::<ServerConfig>("online_mode = \"maybe\"").is_err());
    }

    #[test]
    fn test_auto_mode_trusts_loopback_only() {
        let local: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let remote: SocketAddr = "203.0.113.9:50000".parse().unwrap();
        assert!(!OnlineMode::Auto.authenticates(&local));
        assert!(OnlineMode::Auto.authenticates(&remote));
        assert!(OnlineMode::True.authenticates(&local));
        assert!(!OnlineMode::False.authenticates(&remote));
    }

    #[test]
    fn test_transport_names() {
        let config: ServerConfig = toml::from_str("transport = \"per-core\"").unwrap();
        assert_eq!(config.transport, TransportBackend::PerCore);
        let config: ServerConfig = toml::from_str("transport = \"portable\"").unwrap();
        assert_eq!(config.transport, TransportBackend::Portable);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 25570\nmotd = \"Hello\"\nevent_loop_threads = 3").unwrap();
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 25570);
        assert_eq!(config.motd, "Hello");
        assert_eq!(config.event_loop_threads(), 3);
        assert_eq!(config.listen_addr(), "0.0.0.0:25570");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/lodestone.toml")).unwrap();
        assert_eq!(config.max_players, 20);
    }
}
