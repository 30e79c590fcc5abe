//! Buffer construction.

use crate::buffer::MetaBuffer;
use crate::error::Result;
use crate::map::MapKind;
use crate::registry::TagRegistry;
use std::sync::Arc;

/// Creates [`MetaBuffer`]s bound to one tag registry.
///
/// The special-properties tag id is supplied by the caller at
/// construction time; it is obtained from an external vendor-tag
/// location service and identifies the auxiliary blob that packed
/// internal properties are exported under.
pub struct BufferFactory {
    registry: Arc<dyn TagRegistry>,
    special_tag: u32,
}

impl BufferFactory {
    /// Create a factory over `registry`.
    pub fn new(registry: Arc<dyn TagRegistry>, special_tag: u32) -> Self {
        Self {
            registry,
            special_tag,
        }
    }

    /// Create an empty buffer with a process-unique id.
    pub fn create(&self, kind: MapKind) -> Arc<MetaBuffer> {
        let buffer = MetaBuffer::new(self.registry.clone(), self.special_tag, kind);
        tracing::debug!(buffer = buffer.id(), ?kind, "created metadata buffer");
        buffer
    }

    /// Tear a buffer down; refused while references are outstanding
    /// unless forced.
    pub fn destroy(&self, buffer: &Arc<MetaBuffer>, force: bool) -> Result<()> {
        buffer.destroy(force)
    }

    /// The registry buffers from this factory consult.
    pub fn registry(&self) -> &Arc<dyn TagRegistry> {
        &self.registry
    }
}
