use bytes::{BufMut, BytesMut};
use lodestone_protocol_core::*;
use lodestone_types::{GameProfile, TextComponent};
use uuid::Uuid;

use lodestone_protocol_core::Direction::{Clientbound, Serverbound};
use lodestone_protocol_core::ProtocolState::{Handshake, Login, Play, Status};

/// Protocol number announced by 1.12.2 clients.
pub const PROTOCOL_VERSION: i32 = 340;
pub const VERSION_NAME: &str = "1.12.2";

/// Longest player name the login packets carry.
const MAX_NAME_LEN: usize = 16;
/// Shared secret and verify token arrive RSA-encrypted with a 1024-bit key.
const MAX_ENCRYPTED_LEN: usize = 256;
const MAX_CHAT_LEN: usize = 262_144;

pub struct V1_12Adapter;

impl V1_12Adapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for V1_12Adapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for V1_12Adapter {
    fn protocol_version(&self) -> i32 {
        PROTOCOL_VERSION
    }

    fn version_name(&self) -> &'static str {
        VERSION_NAME
    }

    fn register_packets(&self, r: &mut PacketRegistry) -> Result<(), RegistryError> {
        // Handshake
        r.register(Handshake, Serverbound, 0x00, PacketKind::Handshake, decode_handshake, encode_handshake)?;

        // Status
        r.register(Status, Serverbound, 0x00, PacketKind::StatusRequest, decode_status_request, encode_empty)?;
        r.register(Status, Serverbound, 0x01, PacketKind::PingRequest, decode_ping, encode_ping)?;
        r.register(Status, Clientbound, 0x00, PacketKind::StatusResponse, decode_status_response, encode_status_response)?;
        r.register(Status, Clientbound, 0x01, PacketKind::PongResponse, decode_pong, encode_ping)?;

        // Login
        r.register(Login, Serverbound, 0x00, PacketKind::LoginStart, decode_login_start, encode_login_start)?;
        r.register(Login, Serverbound, 0x01, PacketKind::EncryptionResponse, decode_encryption_response, encode_encryption_response)?;
        r.register(Login, Clientbound, 0x00, PacketKind::LoginDisconnect, decode_login_disconnect, encode_disconnect)?;
        r.register(Login, Clientbound, 0x01, PacketKind::EncryptionRequest, decode_encryption_request, encode_encryption_request)?;
        r.register(Login, Clientbound, 0x02, PacketKind::LoginSuccess, decode_login_success, encode_login_success)?;
        r.register(Login, Clientbound, 0x03, PacketKind::SetCompression, decode_set_compression, encode_set_compression)?;

        // Play
        r.register(Play, Serverbound, 0x09, PacketKind::PluginMessage, decode_plugin_message, encode_plugin_message)?;
        r.register(Play, Serverbound, 0x0B, PacketKind::KeepAliveServerbound, decode_keep_alive_serverbound, encode_keep_alive)?;
        r.register(Play, Clientbound, 0x18, PacketKind::PluginMessage, decode_plugin_message, encode_plugin_message)?;
        r.register(Play, Clientbound, 0x1A, PacketKind::Disconnect, decode_play_disconnect, encode_disconnect)?;
        r.register(Play, Clientbound, 0x1F, PacketKind::KeepAliveClientbound, decode_keep_alive_clientbound, encode_keep_alive)?;

        Ok(())
    }
}

fn wrong_kind(expected: PacketKind, packet: &Packet) -> PacketError {
    PacketError::WrongKind {
        expected,
        actual: packet.kind(),
    }
}

fn read_chat(data: &mut BytesMut) -> CodecResult<TextComponent> {
    let json = read_string(data, MAX_CHAT_LEN)?;
    TextComponent::from_json(&json).ok_or(CodecError::Invalid("chat component"))
}

// === Decode functions ===

fn decode_handshake(data: &mut BytesMut) -> CodecResult<Packet> {
    let protocol_version = read_varint(data)?;
    let server_address = read_string(data, 255)?;
    let server_port = read_u16(data)?;
    let next_state = read_varint(data)?;
    Ok(Packet::Handshake {
        protocol_version,
        server_address,
        server_port,
        next_state,
    })
}

fn decode_status_request(_data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::StatusRequest)
}

fn decode_status_response(data: &mut BytesMut) -> CodecResult<Packet> {
    let json = read_string(data, 32767)?;
    Ok(Packet::StatusResponse { json })
}

fn decode_ping(data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::PingRequest {
        payload: read_i64(data)?,
    })
}

fn decode_pong(data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::PongResponse {
        payload: read_i64(data)?,
    })
}

fn decode_login_start(data: &mut BytesMut) -> CodecResult<Packet> {
    let name = read_string(data, MAX_NAME_LEN)?;
    Ok(Packet::LoginStart { name })
}

fn decode_encryption_response(data: &mut BytesMut) -> CodecResult<Packet> {
    let shared_secret = read_byte_array(data, MAX_ENCRYPTED_LEN)?;
    let verify_token = read_byte_array(data, MAX_ENCRYPTED_LEN)?;
    Ok(Packet::EncryptionResponse {
        shared_secret,
        verify_token,
    })
}

fn decode_login_disconnect(data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::LoginDisconnect {
        reason: read_chat(data)?,
    })
}

fn decode_encryption_request(data: &mut BytesMut) -> CodecResult<Packet> {
    let server_id = read_string(data, 20)?;
    let public_key = read_byte_array(data, 1024)?;
    let verify_token = read_byte_array(data, MAX_ENCRYPTED_LEN)?;
    Ok(Packet::EncryptionRequest {
        server_id,
        public_key,
        verify_token,
    })
}

fn decode_login_success(data: &mut BytesMut) -> CodecResult<Packet> {
    // This version sends the UUID as hyphenated text.
    let uuid = read_string(data, 36)?;
    let uuid = Uuid::parse_str(&uuid).map_err(|_| CodecError::Invalid("profile UUID"))?;
    let name = read_string(data, MAX_NAME_LEN)?;
    Ok(Packet::LoginSuccess {
        profile: GameProfile::new(uuid, name),
    })
}

fn decode_set_compression(data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::SetCompression {
        threshold: read_varint(data)?,
    })
}

fn decode_plugin_message(data: &mut BytesMut) -> CodecResult<Packet> {
    let channel = read_string(data, 20)?;
    let data = read_remaining(data);
    Ok(Packet::PluginMessage { channel, data })
}

fn decode_keep_alive_serverbound(data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::KeepAliveServerbound { id: read_i64(data)? })
}

fn decode_keep_alive_clientbound(data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::KeepAliveClientbound { id: read_i64(data)? })
}

fn decode_play_disconnect(data: &mut BytesMut) -> CodecResult<Packet> {
    Ok(Packet::Disconnect {
        reason: read_chat(data)?,
    })
}

// === Encode functions ===

fn encode_handshake(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::Handshake {
            protocol_version,
            server_address,
            server_port,
            next_state,
        } => {
            write_varint(buf, *protocol_version);
            write_string(buf, server_address);
            buf.put_u16(*server_port);
            write_varint(buf, *next_state);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::Handshake, packet)),
    }
}

fn encode_empty(packet: &Packet, _buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::StatusRequest => Ok(()),
        _ => Err(wrong_kind(PacketKind::StatusRequest, packet)),
    }
}

fn encode_status_response(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::StatusResponse { json } => {
            write_string(buf, json);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::StatusResponse, packet)),
    }
}

/// Ping and pong share a layout.
fn encode_ping(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::PingRequest { payload } | Packet::PongResponse { payload } => {
            buf.put_i64(*payload);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::PingRequest, packet)),
    }
}

fn encode_login_start(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::LoginStart { name } => {
            write_string(buf, name);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::LoginStart, packet)),
    }
}

fn encode_encryption_response(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::EncryptionResponse {
            shared_secret,
            verify_token,
        } => {
            write_byte_array(buf, shared_secret);
            write_byte_array(buf, verify_token);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::EncryptionResponse, packet)),
    }
}

/// Login and play disconnects share a layout.
fn encode_disconnect(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::LoginDisconnect { reason } | Packet::Disconnect { reason } => {
            write_string(buf, &reason.to_json());
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::Disconnect, packet)),
    }
}

fn encode_encryption_request(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::EncryptionRequest {
            server_id,
            public_key,
            verify_token,
        } => {
            write_string(buf, server_id);
            write_byte_array(buf, public_key);
            write_byte_array(buf, verify_token);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::EncryptionRequest, packet)),
    }
}

fn encode_login_success(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::LoginSuccess { profile } => {
            write_string(buf, &profile.uuid.hyphenated().to_string());
            write_string(buf, &profile.name);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::LoginSuccess, packet)),
    }
}

fn encode_set_compression(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::SetCompression { threshold } => {
            write_varint(buf, *threshold);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::SetCompression, packet)),
    }
}

fn encode_plugin_message(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::PluginMessage { channel, data } => {
            write_string(buf, channel);
            buf.put_slice(data);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::PluginMessage, packet)),
    }
}

/// Both keep-alive directions carry a single long.
fn encode_keep_alive(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
    match packet {
        Packet::KeepAliveClientbound { id } | Packet::KeepAliveServerbound { id } => {
            buf.put_i64(*id);
            Ok(())
        }
        _ => Err(wrong_kind(PacketKind::KeepAliveClientbound, packet)),
    }
}
