/// The state of a protocol connection. Each state has its own packet tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    Handshake,
    Status,
    Login,
    Play,
}

impl ProtocolState {
    pub const ALL: [ProtocolState; 4] = [
        ProtocolState::Handshake,
        ProtocolState::Status,
        ProtocolState::Login,
        ProtocolState::Play,
    ];

    pub fn from_handshake_next(next: i32) -> Option<Self> {
        match next {
            1 => Some(ProtocolState::Status),
            2 => Some(ProtocolState::Login),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProtocolState::Handshake => "HANDSHAKE",
            ProtocolState::Status => "STATUS",
            ProtocolState::Login => "LOGIN",
            ProtocolState::Play => "PLAY",
        };
        f.write_str(name)
    }
}

/// Which way a packet travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Serverbound,
    /// Server to client.
    Clientbound,
}

impl Direction {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_next_state() {
        assert_eq!(ProtocolState::from_handshake_next(1), Some(ProtocolState::Status));
        assert_eq!(ProtocolState::from_handshake_next(2), Some(ProtocolState::Login));
        assert_eq!(ProtocolState::from_handshake_next(3), None);
        assert_eq!(ProtocolState::from_handshake_next(0), None);
    }

    #[test]
    fn test_index_roundtrip() {
        for state in ProtocolState::ALL {
            assert_eq!(ProtocolState::from_index(state.index()), Some(state));
        }
        assert_eq!(ProtocolState::from_index(4), None);
    }
}
