//! # Aperture
//!
//! Per-frame metadata buffers for camera pipelines.
//!
//! A pipeline stage computes results (exposure, white balance, lens
//! state, statistics) and publishes them as tagged values in a
//! [`MetaBuffer`](buffer::MetaBuffer). Downstream stages and the
//! framework consumer read the same bytes through zero-copy merges
//! instead of per-consumer copies.
//!
//! ## Features
//!
//! - **Two-tier storage**: small values live inline in their entries,
//!   large values are packed into out-of-line region arenas with one
//!   batched allocation per request
//! - **Zero-copy merge**: a merge records entry metadata and a
//!   reference-counted link; the bytes stay with their producer
//! - **Multi-camera combination**: per-camera buffers combine into one
//!   aggregate with camera-scoped lookup through a bounded graph search
//! - **Two map implementations**: dense-indexed and hash-indexed stores
//!   behind one contract, selected per buffer at construction
//!
//! ## Quick Start
//!
//! ```rust
//! use aperture::prelude::*;
//! use std::sync::Arc;
//!
//! // Tag metadata comes from an external registry.
//! let registry = Arc::new(StaticTagRegistry::new(vec![
//!     TagDescriptor {
//!         tag: 0x100,
//!         max_size: 8,
//!         visibility: Visibility::ALL,
//!         internal: false,
//!         name: "sensor.exposure_time",
//!     },
//! ])?);
//!
//! let factory = BufferFactory::new(registry, 0xffff_0000);
//! let producer = factory.create(MapKind::Dense);
//! producer.set_tag(0x100, &33_000u64.to_le_bytes(), 1)?;
//!
//! // Zero-copy merge into the aggregate read downstream.
//! let aggregate = factory.create(MapKind::Dense);
//! aggregate.merge(&producer, false)?;
//! assert_eq!(aggregate.get_tag(0x100)?.bytes, 33_000u64.to_le_bytes());
//! # Ok::<(), aperture::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod entry;
pub mod error;
pub mod export;
pub mod factory;
pub mod iter;
pub mod map;
pub mod region;
pub mod registry;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::buffer::{MetaBuffer, TagValue};
    pub use crate::error::{Error, Result};
    pub use crate::export::{ExportOptions, MetadataSink};
    pub use crate::factory::BufferFactory;
    pub use crate::iter::{EntryCursor, EntrySnapshot};
    pub use crate::map::MapKind;
    pub use crate::registry::{StaticTagRegistry, TagDescriptor, TagRegistry, Visibility};
}

pub use error::{Error, Result};
