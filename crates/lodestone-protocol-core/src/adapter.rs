use crate::{PacketRegistry, RegistryError};

/// Trait for version-specific protocol adapters.
/// Each supported protocol version implements this trait and fills a
/// [`PacketRegistry`] with the IDs and wire layouts of that version.
pub trait ProtocolAdapter: Send + Sync {
    /// The protocol version number this adapter handles.
    fn protocol_version(&self) -> i32;

    /// Human-readable release name shown in the server list.
    fn version_name(&self) -> &'static str;

    /// Register every packet of this version.
    fn register_packets(&self, registry: &mut PacketRegistry) -> Result<(), RegistryError>;

    /// Build the complete, read-only registry for this version.
    fn build_registry(&self) -> Result<PacketRegistry, RegistryError> {
        let mut registry = PacketRegistry::new();
        self.register_packets(&mut registry)?;
        Ok(registry)
    }
}
