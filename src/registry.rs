//! Tag registry collaborator interface.
//!
//! The registry maps a stable numeric tag identifier to its static
//! metadata: maximum payload size, dense index, visibility and a
//! human-readable name. Aperture never synthesizes tag metadata itself;
//! it only consumes this lookup interface. Production deployments wrap
//! their platform's tag database behind [`TagRegistry`]; tests and simple
//! deployments can use [`StaticTagRegistry`].

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Visibility bitmask controlling which consumers may observe a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Visibility(pub u32);

impl Visibility {
    /// Visible to the framework consumer.
    pub const FRAMEWORK: Visibility = Visibility(0x1);
    /// Visible to vendor extensions.
    pub const VENDOR: Visibility = Visibility(0x2);
    /// Visible only inside the pipeline.
    pub const INTERNAL: Visibility = Visibility(0x4);
    /// Visible everywhere.
    pub const ALL: Visibility = Visibility(0x7);

    /// Check whether all bits of `other` are present in `self`.
    #[inline]
    pub fn contains(&self, other: Visibility) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two masks.
    #[inline]
    pub fn union(&self, other: Visibility) -> Visibility {
        Visibility(self.0 | other.0)
    }
}

/// Static description of one tag, as registered with a registry.
#[derive(Debug, Clone)]
pub struct TagDescriptor {
    /// Stable numeric identifier.
    pub tag: u32,
    /// Maximum payload size in bytes.
    pub max_size: u32,
    /// Who may observe this tag.
    pub visibility: Visibility,
    /// Internal pipeline property, packed into the auxiliary blob on export.
    pub internal: bool,
    /// Human-readable name (diagnostics only).
    pub name: &'static str,
}

/// Lookup interface for static tag metadata.
///
/// Implementations must be cheap: these methods sit on the per-tag hot
/// path of every set/get/merge operation.
pub trait TagRegistry: Send + Sync {
    /// Maximum payload size in bytes for `tag`.
    fn max_size(&self, tag: u32) -> Result<u32>;

    /// Dense index of `tag`, in `[0, total_known_tag_count)`.
    fn dense_index(&self, tag: u32) -> Result<u32>;

    /// Total number of known tags (sizes the dense map variant).
    fn total_known_tag_count(&self) -> u32;

    /// Whether `tag` is an internal pipeline property.
    fn is_internal_property(&self, tag: u32) -> bool;

    /// Visibility mask for `tag`. Unknown tags are visible nowhere.
    fn visibility(&self, tag: u32) -> Visibility;

    /// Human-readable name for `tag` (diagnostics only).
    fn name(&self, tag: u32) -> &str;
}

/// A slice-backed registry with a fixed tag population.
///
/// Dense indices are assigned in registration order. This is the concrete
/// implementation used by tests and single-process deployments; platform
/// integrations provide their own [`TagRegistry`] over the vendor tag
/// database.
pub struct StaticTagRegistry {
    descriptors: Vec<TagDescriptor>,
    by_tag: HashMap<u32, u32>,
}

impl StaticTagRegistry {
    /// Build a registry from a descriptor list.
    ///
    /// Duplicate tags are rejected; the dense index of each tag is its
    /// position in `descriptors`.
    pub fn new(descriptors: Vec<TagDescriptor>) -> Result<Self> {
        let mut by_tag = HashMap::with_capacity(descriptors.len());
        for (index, desc) in descriptors.iter().enumerate() {
            if by_tag.insert(desc.tag, index as u32).is_some() {
                return Err(Error::InvalidArgument(format!(
                    "duplicate tag {:#x} in registry",
                    desc.tag
                )));
            }
        }
        Ok(Self {
            descriptors,
            by_tag,
        })
    }

    fn descriptor(&self, tag: u32) -> Option<&TagDescriptor> {
        self.by_tag
            .get(&tag)
            .map(|&index| &self.descriptors[index as usize])
    }
}

impl TagRegistry for StaticTagRegistry {
    fn max_size(&self, tag: u32) -> Result<u32> {
        self.descriptor(tag)
            .map(|d| d.max_size)
            .ok_or(Error::OutOfBounds(tag))
    }

    fn dense_index(&self, tag: u32) -> Result<u32> {
        self.by_tag.get(&tag).copied().ok_or(Error::OutOfBounds(tag))
    }

    fn total_known_tag_count(&self) -> u32 {
        self.descriptors.len() as u32
    }

    fn is_internal_property(&self, tag: u32) -> bool {
        self.descriptor(tag).is_some_and(|d| d.internal)
    }

    fn visibility(&self, tag: u32) -> Visibility {
        self.descriptor(tag)
            .map(|d| d.visibility)
            .unwrap_or(Visibility(0))
    }

    fn name(&self, tag: u32) -> &str {
        self.descriptor(tag).map(|d| d.name).unwrap_or("<unknown>")
    }
}
