mod adapter;

pub use adapter::{V1_12Adapter, PROTOCOL_VERSION, VERSION_NAME};
