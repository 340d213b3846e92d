pub mod adapter;
pub mod cipher;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod frame;
pub mod packets;
pub mod registry;
pub mod state;

pub use adapter::*;
pub use cipher::Cfb8Cipher;
pub use codec::*;
pub use connection::{Connection, ConnectionError, ConnectionReader, ConnectionWriter, RawPacket};
pub use frame::{decode_frame, encode_frame, FrameError, DEFAULT_MAX_FRAME_LEN};
pub use packets::*;
pub use registry::*;
pub use state::*;
