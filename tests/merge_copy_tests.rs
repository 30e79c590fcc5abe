//! Integration tests for zero-copy merge and physical copy semantics.

use aperture::prelude::*;
use std::sync::Arc;

const EXPOSURE_TIME: u32 = 0x100; // 8 bytes, inline
const WB_GAINS: u32 = 0x101; // 12 bytes, inline
const LARGE_HISTOGRAM: u32 = 0x200; // 4096 bytes, region
const GYRO_SAMPLES: u32 = 0x201; // 1024 bytes, region
const SPECIAL_TAG: u32 = 0xffff_0000;

fn registry() -> Arc<dyn TagRegistry> {
    Arc::new(
        StaticTagRegistry::new(vec![
            TagDescriptor {
                tag: EXPOSURE_TIME,
                max_size: 8,
                visibility: Visibility::ALL,
                internal: false,
                name: "sensor.exposure_time",
            },
            TagDescriptor {
                tag: WB_GAINS,
                max_size: 12,
                visibility: Visibility::ALL,
                internal: false,
                name: "awb.gains",
            },
            TagDescriptor {
                tag: LARGE_HISTOGRAM,
                max_size: 4096,
                visibility: Visibility::ALL,
                internal: false,
                name: "stats.histogram",
            },
            TagDescriptor {
                tag: GYRO_SAMPLES,
                max_size: 1024,
                visibility: Visibility::ALL,
                internal: false,
                name: "eis.gyro_samples",
            },
        ])
        .unwrap(),
    )
}

fn factory() -> BufferFactory {
    BufferFactory::new(registry(), SPECIAL_TAG)
}

// ============================================================================
// Merge semantics
// ============================================================================

#[test]
fn test_merge_exposes_source_tags() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(EXPOSURE_TIME, &[1; 8], 1).unwrap();
    producer.set_tag(LARGE_HISTOGRAM, &[2; 4096], 1).unwrap();

    aggregate.merge(&producer, false).unwrap();

    assert_eq!(aggregate.get_tag(EXPOSURE_TIME).unwrap().bytes, vec![1; 8]);
    assert_eq!(
        aggregate.get_tag(LARGE_HISTOGRAM).unwrap().bytes,
        vec![2; 4096]
    );
    assert_eq!(
        aggregate.region_count(),
        0,
        "merge must not copy bytes into the destination"
    );
}

#[test]
fn test_merge_aliases_source_until_released() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(WB_GAINS, &[1; 12], 3).unwrap();

    aggregate.merge(&producer, false).unwrap();
    assert_eq!(aggregate.get_tag(WB_GAINS).unwrap().bytes, vec![1; 12]);

    // Mutating the source is visible through the aggregate: the merge
    // was zero-copy.
    producer.set_tag(WB_GAINS, &[9; 12], 3).unwrap();
    assert_eq!(aggregate.get_tag(WB_GAINS).unwrap().bytes, vec![9; 12]);
}

#[test]
fn test_disjoint_merge_preserves_destination() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    aggregate.set_tag(EXPOSURE_TIME, &[0xAA; 8], 1).unwrap();
    producer.set_tag(EXPOSURE_TIME, &[0xBB; 8], 1).unwrap();
    producer.set_tag(WB_GAINS, &[0xCC; 12], 1).unwrap();

    aggregate.merge(&producer, true).unwrap();

    assert_eq!(
        aggregate.get_tag(EXPOSURE_TIME).unwrap().bytes,
        vec![0xAA; 8],
        "disjoint merge must never overwrite a valid destination tag"
    );
    assert_eq!(aggregate.get_tag(WB_GAINS).unwrap().bytes, vec![0xCC; 12]);
}

#[test]
fn test_full_merge_overwrites_destination() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    aggregate.set_tag(EXPOSURE_TIME, &[0xAA; 8], 1).unwrap();
    producer.set_tag(EXPOSURE_TIME, &[0xBB; 8], 1).unwrap();

    aggregate.merge(&producer, false).unwrap();
    assert_eq!(
        aggregate.get_tag(EXPOSURE_TIME).unwrap().bytes,
        vec![0xBB; 8]
    );
}

#[test]
fn test_merge_self_rejected() {
    let buffer = factory().create(MapKind::Dense);
    assert!(matches!(
        buffer.merge(&buffer, false),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_merge_across_map_kinds_not_implemented() {
    let factory = factory();
    let dense = factory.create(MapKind::Dense);
    let hashed = factory.create(MapKind::Hashed);
    hashed.set_tag(EXPOSURE_TIME, &[1; 8], 1).unwrap();

    assert!(matches!(
        dense.merge(&hashed, false),
        Err(Error::NotImplemented(_))
    ));
    assert!(matches!(
        dense.copy_from(&hashed, false),
        Err(Error::NotImplemented(_))
    ));
}

#[test]
fn test_merge_records_link_and_reference_each_time() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(EXPOSURE_TIME, &[1; 8], 1).unwrap();

    aggregate.merge(&producer, false).unwrap();
    assert_eq!(aggregate.link_count(), 1);
    assert_eq!(producer.references(), (0, 0, 1));

    // Re-merging the same source again is entry-idempotent but adds one
    // more link and merge-reference.
    aggregate.merge(&producer, false).unwrap();
    assert_eq!(aggregate.link_count(), 2);
    assert_eq!(producer.references(), (0, 0, 2));
    assert_eq!(aggregate.entry_count(), 1);
}

#[test]
fn test_merge_reference_defers_source_invalidate() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(EXPOSURE_TIME, &[5; 8], 1).unwrap();
    aggregate.merge(&producer, false).unwrap();

    // The merge reference keeps the source's content alive.
    producer.invalidate(false);
    assert!(producer.invalidate_pending());
    assert_eq!(aggregate.get_tag(EXPOSURE_TIME).unwrap().bytes, vec![5; 8]);

    // Releasing the aggregate's borrow triggers the deferred reset.
    aggregate.reset();
    assert!(!producer.invalidate_pending());
    assert_eq!(producer.entry_count(), 0);
    assert!(matches!(
        aggregate.get_tag(EXPOSURE_TIME),
        Err(Error::NoSuchTag(_))
    ));
}

#[test]
fn test_forced_source_reset_hides_merged_tags() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(LARGE_HISTOGRAM, &[3; 4096], 1).unwrap();
    aggregate.merge(&producer, false).unwrap();

    producer.invalidate(true);
    assert!(matches!(
        aggregate.get_tag(LARGE_HISTOGRAM),
        Err(Error::NoSuchTag(_))
    ));
}

#[test]
fn test_hashed_maps_share_merge_semantics() {
    let factory = factory();
    let aggregate = factory.create(MapKind::Hashed);
    let producer = factory.create(MapKind::Hashed);
    producer.set_tag(WB_GAINS, &[1; 12], 1).unwrap();
    aggregate.set_tag(EXPOSURE_TIME, &[2; 8], 1).unwrap();

    aggregate.merge(&producer, true).unwrap();
    assert_eq!(aggregate.entry_count(), 2);

    producer.set_tag(WB_GAINS, &[7; 12], 1).unwrap();
    assert_eq!(aggregate.get_tag(WB_GAINS).unwrap().bytes, vec![7; 12]);
}

// ============================================================================
// Copy semantics
// ============================================================================

#[test]
fn test_copy_is_independent_of_source() {
    let factory = factory();
    let copy = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(EXPOSURE_TIME, &[1; 8], 1).unwrap();
    producer.set_tag(LARGE_HISTOGRAM, &[2; 4096], 16).unwrap();

    copy.copy_from(&producer, false).unwrap();
    assert_eq!(copy.link_count(), 0);
    assert_eq!(producer.references(), (0, 0, 0));

    // Mutate, then destroy the source: the copy must be unaffected.
    producer.set_tag(EXPOSURE_TIME, &[9; 8], 1).unwrap();
    assert_eq!(copy.get_tag(EXPOSURE_TIME).unwrap().bytes, vec![1; 8]);

    producer.destroy(true).unwrap();
    assert_eq!(copy.get_tag(LARGE_HISTOGRAM).unwrap().bytes, vec![2; 4096]);
    assert_eq!(copy.get_tag(LARGE_HISTOGRAM).unwrap().count, 16);
}

#[test]
fn test_copy_batches_out_of_line_payloads_into_one_region() {
    let factory = factory();
    let copy = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(EXPOSURE_TIME, &[1; 8], 1).unwrap();
    producer.set_tag(LARGE_HISTOGRAM, &[2; 4096], 1).unwrap();
    producer.set_tag(GYRO_SAMPLES, &[3; 1024], 1).unwrap();
    assert_eq!(producer.region_count(), 2);

    copy.copy_from(&producer, false).unwrap();
    assert_eq!(
        copy.region_count(),
        1,
        "copy services all out-of-line payloads with one allocation"
    );
    assert_eq!(copy.get_tag(GYRO_SAMPLES).unwrap().bytes, vec![3; 1024]);
}

#[test]
fn test_disjoint_copy_preserves_destination() {
    let factory = factory();
    let copy = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    copy.set_tag(EXPOSURE_TIME, &[0xAA; 8], 1).unwrap();
    producer.set_tag(EXPOSURE_TIME, &[0xBB; 8], 1).unwrap();
    producer.set_tag(WB_GAINS, &[0xCC; 12], 1).unwrap();

    copy.copy_from(&producer, true).unwrap();
    assert_eq!(copy.get_tag(EXPOSURE_TIME).unwrap().bytes, vec![0xAA; 8]);
    assert_eq!(copy.get_tag(WB_GAINS).unwrap().bytes, vec![0xCC; 12]);
}

#[test]
fn test_copy_from_merged_source_materializes_borrowed_bytes() {
    let factory = factory();
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(LARGE_HISTOGRAM, &[4; 4096], 1).unwrap();

    let aggregate = factory.create(MapKind::Dense);
    aggregate.merge(&producer, false).unwrap();

    let copy = factory.create(MapKind::Dense);
    copy.copy_from(&aggregate, false).unwrap();

    // The copy owns real bytes even though the aggregate only borrowed
    // them; mutating the original producer must not show through.
    producer.set_tag(LARGE_HISTOGRAM, &[8; 4096], 1).unwrap();
    assert_eq!(copy.get_tag(LARGE_HISTOGRAM).unwrap().bytes, vec![4; 4096]);
}

#[test]
fn test_copy_overwrites_reuse_existing_region_storage() {
    let factory = factory();
    let copy = factory.create(MapKind::Dense);
    let producer = factory.create(MapKind::Dense);
    producer.set_tag(LARGE_HISTOGRAM, &[1; 4096], 1).unwrap();

    copy.copy_from(&producer, false).unwrap();
    assert_eq!(copy.region_count(), 1);

    // Second copy of the same tag set reuses the storage the first copy
    // allocated instead of growing the region list.
    producer.set_tag(LARGE_HISTOGRAM, &[2; 4096], 1).unwrap();
    copy.copy_from(&producer, false).unwrap();
    assert_eq!(copy.region_count(), 1);
    assert_eq!(copy.get_tag(LARGE_HISTOGRAM).unwrap().bytes, vec![2; 4096]);
}
