use lodestone_types::{GameProfile, TextComponent};

/// Version-independent packet representation.
/// Version crates register the wire layout of each variant in a
/// [`PacketRegistry`](crate::PacketRegistry).
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // === Handshake (serverbound) ===
    Handshake {
        protocol_version: i32,
        server_address: String,
        server_port: u16,
        next_state: i32,
    },

    // === Status ===
    StatusRequest,
    StatusResponse {
        json: String,
    },
    PingRequest {
        payload: i64,
    },
    PongResponse {
        payload: i64,
    },

    // === Login (serverbound) ===
    LoginStart {
        name: String,
    },
    EncryptionResponse {
        shared_secret: Vec<u8>,
        verify_token: Vec<u8>,
    },

    // === Login (clientbound) ===
    LoginDisconnect {
        reason: TextComponent,
    },
    EncryptionRequest {
        server_id: String,
        public_key: Vec<u8>,
        verify_token: Vec<u8>,
    },
    LoginSuccess {
        profile: GameProfile,
    },
    SetCompression {
        threshold: i32,
    },

    // === Play ===
    KeepAliveClientbound {
        id: i64,
    },
    KeepAliveServerbound {
        id: i64,
    },
    /// Opaque channel payload, both directions.
    PluginMessage {
        channel: String,
        data: Vec<u8>,
    },
    Disconnect {
        reason: TextComponent,
    },
}

/// The type of a [`Packet`], without its fields. Registries map packet IDs
/// to and from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Handshake,
    StatusRequest,
    StatusResponse,
    PingRequest,
    PongResponse,
    LoginStart,
    EncryptionResponse,
    LoginDisconnect,
    EncryptionRequest,
    LoginSuccess,
    SetCompression,
    KeepAliveClientbound,
    KeepAliveServerbound,
    PluginMessage,
    Disconnect,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Handshake { .. } => PacketKind::Handshake,
            Packet::StatusRequest => PacketKind::StatusRequest,
            Packet::StatusResponse { .. } => PacketKind::StatusResponse,
            Packet::PingRequest { .. } => PacketKind::PingRequest,
            Packet::PongResponse { .. } => PacketKind::PongResponse,
            Packet::LoginStart { .. } => PacketKind::LoginStart,
            Packet::EncryptionResponse { .. } => PacketKind::EncryptionResponse,
            Packet::LoginDisconnect { .. } => PacketKind::LoginDisconnect,
            Packet::EncryptionRequest { .. } => PacketKind::EncryptionRequest,
            Packet::LoginSuccess { .. } => PacketKind::LoginSuccess,
            Packet::SetCompression { .. } => PacketKind::SetCompression,
            Packet::KeepAliveClientbound { .. } => PacketKind::KeepAliveClientbound,
            Packet::KeepAliveServerbound { .. } => PacketKind::KeepAliveServerbound,
            Packet::PluginMessage { .. } => PacketKind::PluginMessage,
            Packet::Disconnect { .. } => PacketKind::Disconnect,
        }
    }
}
