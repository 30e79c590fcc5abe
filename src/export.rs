//! Export to an externally owned flat metadata sink.
//!
//! The sink is the boundary to the platform's wire format: Aperture
//! walks a buffer's valid entries and writes each into the sink, while
//! the translation to the flat layout stays on the caller's side.
//! Internal pipeline properties are not written individually; they are
//! packed into one auxiliary blob appended under the special-properties
//! tag the buffer was constructed with.

use crate::buffer::MetaBuffer;
use crate::error::Result;
use crate::iter::EntrySnapshot;
use crate::registry::Visibility;
use std::collections::HashSet;

/// Externally owned flat metadata sink.
pub trait MetadataSink {
    /// Write one tag's payload. Failures are logged by the exporter and
    /// do not stop the remaining tags from being written.
    fn put(&mut self, tag: u32, data: &[u8], count: u32) -> Result<()>;
}

/// Filtering applied while exporting.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// The consumer's visibility class, matched against each tag's
    /// registry visibility when `skip_invisible` is set.
    pub consumer_visibility: Visibility,
    /// Skip tags whose visibility excludes the consumer.
    pub skip_invisible: bool,
    /// Drop internal properties entirely instead of packing them.
    pub skip_internal: bool,
    /// Tags to leave out regardless of visibility.
    pub exclude: HashSet<u32>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            consumer_visibility: Visibility::FRAMEWORK,
            skip_invisible: false,
            skip_internal: false,
            exclude: HashSet::new(),
        }
    }
}

impl MetaBuffer {
    /// Write every eligible valid entry into `sink`.
    ///
    /// Best-effort: a failure for one tag is logged and export continues
    /// with the remaining tags; the aggregate result reflects the first
    /// failure. Internal properties are packed into one blob under the
    /// buffer's special-properties tag, appended only if at least one
    /// was present.
    pub fn export_to(&self, sink: &mut dyn MetadataSink, options: &ExportOptions) -> Result<()> {
        let mut first_err = None;
        let mut internal_props = Vec::new();

        for snap in self.snapshot() {
            if options.exclude.contains(&snap.tag) {
                continue;
            }
            if self.registry().is_internal_property(snap.tag) {
                if !options.skip_internal {
                    internal_props.push(snap);
                }
                continue;
            }
            if options.skip_invisible
                && !self
                    .registry()
                    .visibility(snap.tag)
                    .contains(options.consumer_visibility)
            {
                continue;
            }
            if let Err(err) = sink.put(snap.tag, &snap.bytes, snap.count) {
                tracing::warn!(tag = snap.tag, %err, "export failed for tag, continuing");
                first_err.get_or_insert(err);
            }
        }

        if !internal_props.is_empty() {
            let record_count = internal_props.len() as u32;
            let blob = pack_internal_properties(&internal_props);
            if let Err(err) = sink.put(self.special_tag(), &blob, record_count) {
                tracing::warn!(%err, "export of packed internal properties failed");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Pack internal properties as consecutive
/// `[tag: u32][size: u32][count: u32][payload]` records, little-endian.
fn pack_internal_properties(props: &[EntrySnapshot]) -> Vec<u8> {
    let total: usize = props.iter().map(|p| 12 + p.bytes.len()).sum();
    let mut blob = Vec::with_capacity(total);
    for prop in props {
        blob.extend_from_slice(&prop.tag.to_le_bytes());
        blob.extend_from_slice(&(prop.bytes.len() as u32).to_le_bytes());
        blob.extend_from_slice(&prop.count.to_le_bytes());
        blob.extend_from_slice(&prop.bytes);
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let props = vec![EntrySnapshot {
            tag: 0x300,
            name: "internal.aec.state".into(),
            size: 2,
            count: 1,
            camera_id: None,
            bytes: vec![0xaa, 0xbb],
            borrowed: false,
        }];
        let blob = pack_internal_properties(&props);
        assert_eq!(blob.len(), 14);
        assert_eq!(&blob[0..4], &0x300u32.to_le_bytes());
        assert_eq!(&blob[4..8], &2u32.to_le_bytes());
        assert_eq!(&blob[8..12], &1u32.to_le_bytes());
        assert_eq!(&blob[12..], &[0xaa, 0xbb]);
    }
}
