use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use thiserror::Error;

use crate::codec::{write_varint, CodecError};
use crate::{Direction, Packet, PacketKind, ProtocolState};

/// Reads a packet body (everything after the packet ID).
pub type DecodeFn = fn(&mut BytesMut) -> Result<Packet, CodecError>;

/// Writes a packet body (everything after the packet ID).
pub type EncodeFn = fn(&Packet, &mut BytesMut) -> Result<(), PacketError>;

/// Registration mistakes. These are configuration bugs and abort startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Packet id 0x{id:02X} registered twice in {state} ({direction:?})")]
    DuplicateId {
        state: ProtocolState,
        direction: Direction,
        id: i32,
    },
    #[error("{kind:?} registered twice in {state} ({direction:?})")]
    DuplicateKind {
        state: ProtocolState,
        direction: Direction,
        kind: PacketKind,
    },
}

/// Errors turning packets into bytes or back. All of them are fatal for the
/// connection they happen on.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Unknown packet 0x{id:02X} in {state} ({direction:?})")]
    UnknownPacket {
        state: ProtocolState,
        direction: Direction,
        id: i32,
    },
    #[error("{kind:?} cannot be sent in {state} ({direction:?})")]
    NotRegistered {
        state: ProtocolState,
        direction: Direction,
        kind: PacketKind,
    },
    #[error("Malformed {kind:?}: {source}")]
    Malformed {
        kind: PacketKind,
        #[source]
        source: CodecError,
    },
    #[error("{trailing} unread bytes after {kind:?}")]
    TrailingBytes { kind: PacketKind, trailing: usize },
    #[error("Encoder for {expected:?} was given {actual:?}")]
    WrongKind {
        expected: PacketKind,
        actual: PacketKind,
    },
}

/// One registered packet type.
#[derive(Clone, Copy)]
pub struct PacketEntry {
    pub id: i32,
    pub kind: PacketKind,
    pub decode: DecodeFn,
    pub encode: EncodeFn,
}

impl std::fmt::Debug for PacketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Table {
    by_id: HashMap<i32, PacketEntry>,
    by_kind: HashMap<PacketKind, i32>,
}

#[derive(Debug, Default)]
pub struct PacketRegistry {
    // Indexed by [ProtocolState::index()][Direction::index()].
    tables: [[Table; 2]; 4],
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, state: ProtocolState, direction: Direction) -> &Table {
        &self.tables[state.index()][direction.index()]
    }

    /// Register a packet type. Both the ID and the kind must be unused in
    /// this (state, direction) pair.
    pub fn register(
        &mut self,
        state: ProtocolState,
        direction: Direction,
        id: i32,
        kind: PacketKind,
        decode: DecodeFn,
        encode: EncodeFn,
    ) -> Result<(), RegistryError> {
        let table = &mut self.tables[state.index()][direction.index()];
        if table.by_id.contains_key(&id) {
            return Err(RegistryError::DuplicateId {
                state,
                direction,
                id,
            });
        }
        if table.by_kind.contains_key(&kind) {
            return Err(RegistryError::DuplicateKind {
                state,
                direction,
                kind,
            });
        }
        table.by_id.insert(
            id,
            PacketEntry {
                id,
                kind,
                decode,
                encode,
            },
        );
        table.by_kind.insert(kind, id);
        Ok(())
    }

    pub fn lookup(&self, state: ProtocolState, direction: Direction, id: i32) -> Option<&PacketEntry> {
        self.table(state, direction).by_id.get(&id)
    }

    pub fn id_for(&self, state: ProtocolState, direction: Direction, kind: PacketKind) -> Option<i32> {
        self.table(state, direction).by_kind.get(&kind).copied()
    }

    /// All entries of one (state, direction) pair, in no particular order.
    pub fn entries(&self, state: ProtocolState, direction: Direction) -> impl Iterator<Item = &PacketEntry> {
        self.table(state, direction).by_id.values()
    }

    pub fn len(&self) -> usize {
        self.tables
            .iter()
            .flat_map(|pair| pair.iter())
            .map(|table| table.by_id.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the body of packet `id`. The whole body must be consumed.
    pub fn decode(
        &self,
        state: ProtocolState,
        direction: Direction,
        id: i32,
        body: &mut BytesMut,
    ) -> Result<Packet, PacketError> {
        let entry = self
            .lookup(state, direction, id)
            .ok_or(PacketError::UnknownPacket {
                state,
                direction,
                id,
            })?;
        let packet = (entry.decode)(body).map_err(|source| PacketError::Malformed {
            kind: entry.kind,
            source,
        })?;
        if body.has_remaining() {
            return Err(PacketError::TrailingBytes {
                kind: entry.kind,
                trailing: body.remaining(),
            });
        }
        Ok(packet)
    }

    /// Encode `packet` as `[VarInt id][body]`.
    pub fn encode(
        &self,
        state: ProtocolState,
        direction: Direction,
        packet: &Packet,
    ) -> Result<BytesMut, PacketError> {
        let kind = packet.kind();
        let id = self
            .id_for(state, direction, kind)
            .ok_or(PacketError::NotRegistered {
                state,
                direction,
                kind,
            })?;
        let entry = self.table(state, direction).by_id[&id];
        let mut buf = BytesMut::new();
        write_varint(&mut buf, id);
        (entry.encode)(packet, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_i64, read_varint};
    use bytes::BufMut;

    fn decode_ping(buf: &mut BytesMut) -> Result<Packet, CodecError> {
        Ok(Packet::PingRequest {
            payload: read_i64(buf)?,
        })
    }

    fn encode_ping(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
        match packet {
            Packet::PingRequest { payload } => {
                buf.put_i64(*payload);
                Ok(())
            }
            other => Err(PacketError::WrongKind {
                expected: PacketKind::PingRequest,
                actual: other.kind(),
            }),
        }
    }

    fn decode_keep_alive(buf: &mut BytesMut) -> Result<Packet, CodecError> {
        Ok(Packet::KeepAliveServerbound { id: read_i64(buf)? })
    }

    fn encode_keep_alive(packet: &Packet, buf: &mut BytesMut) -> Result<(), PacketError> {
        match packet {
            Packet::KeepAliveServerbound { id } => {
                buf.put_i64(*id);
                Ok(())
            }
            other => Err(PacketError::WrongKind {
                expected: PacketKind::KeepAliveServerbound,
                actual: other.kind(),
            }),
        }
    }

    fn sample() -> PacketRegistry {
        let mut registry = PacketRegistry::new();
        registry
            .register(
                ProtocolState::Status,
                Direction::Serverbound,
                0x01,
                PacketKind::PingRequest,
                decode_ping,
                encode_ping,
            )
            .unwrap();
        registry
            .register(
                ProtocolState::Play,
                Direction::Serverbound,
                0x0B,
                PacketKind::KeepAliveServerbound,
                decode_keep_alive,
                encode_keep_alive,
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_lookup_and_reverse_lookup_agree() {
        let registry = sample();
        for state in ProtocolState::ALL {
            for direction in [Direction::Serverbound, Direction::Clientbound] {
                for entry in registry.entries(state, direction) {
                    assert_eq!(registry.lookup(state, direction, entry.id).unwrap().kind, entry.kind);
                    assert_eq!(registry.id_for(state, direction, entry.kind), Some(entry.id));
                }
            }
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let mut registry = sample();
        let err = registry
            .register(
                ProtocolState::Play,
                Direction::Serverbound,
                0x0B,
                PacketKind::PingRequest,
                decode_ping,
                encode_ping,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId { id: 0x0B, .. }));
    }

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let mut registry = sample();
        let err = registry
            .register(
                ProtocolState::Status,
                Direction::Serverbound,
                0x07,
                PacketKind::PingRequest,
                decode_ping,
                encode_ping,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateKind {
                kind: PacketKind::PingRequest,
                ..
            }
        ));
    }

    #[test]
    fn test_same_id_in_other_direction_is_allowed() {
        let mut registry = sample();
        registry
            .register(
                ProtocolState::Status,
                Direction::Clientbound,
                0x01,
                PacketKind::PingRequest,
                decode_ping,
                encode_ping,
            )
            .unwrap();
    }

    #[test]
    fn test_state_isolation() {
        let registry = sample();
        assert!(registry.lookup(ProtocolState::Play, Direction::Serverbound, 0x0B).is_some());
        assert!(registry.lookup(ProtocolState::Login, Direction::Serverbound, 0x0B).is_none());
        assert!(registry.lookup(ProtocolState::Play, Direction::Clientbound, 0x0B).is_none());

        let mut body = BytesMut::from(&[0u8; 8][..]);
        let err = registry
            .decode(ProtocolState::Login, Direction::Serverbound, 0x0B, &mut body)
            .unwrap_err();
        assert!(matches!(err, PacketError::UnknownPacket { id: 0x0B, .. }));
    }

    #[test]
    fn test_encode_then_decode_through_registry() {
        let registry = sample();
        let packet = Packet::PingRequest { payload: 42 };
        let mut wire = registry
            .encode(ProtocolState::Status, Direction::Serverbound, &packet)
            .unwrap();
        let id = read_varint(&mut wire).unwrap();
        assert_eq!(id, 0x01);
        let decoded = registry
            .decode(ProtocolState::Status, Direction::Serverbound, id, &mut wire)
            .unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_unregistered_kind_cannot_be_encoded() {
        let registry = sample();
        let err = registry
            .encode(
                ProtocolState::Status,
                Direction::Clientbound,
                &Packet::PongResponse { payload: 1 },
            )
            .unwrap_err();
        assert!(matches!(err, PacketError::NotRegistered { .. }));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let registry = sample();
        let mut body = BytesMut::from(&[0u8; 9][..]);
        let err = registry
            .decode(ProtocolState::Status, Direction::Serverbound, 0x01, &mut body)
            .unwrap_err();
        assert!(matches!(err, PacketError::TrailingBytes { trailing: 1, .. }));
    }
}
