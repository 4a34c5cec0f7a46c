use crate::physical::{Partition, TableMeta};
use cells::{cmp_key_to_bound, BoundSide, KeyBound, KeyRange, OwnedKey};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The shard owning `key`.
pub fn shard_for_key(meta: &TableMeta, key: &OwnedKey) -> u64 {
    for partition in &meta.partitions {
        match &partition.end_key {
            None => return partition.shard_id,
            Some(end) if key < end => return partition.shard_id,
            Some(_) => continue,
        }
    }
    // Partitioning always ends with an unbounded partition; reaching here
    // means the shard map is malformed, and the last shard absorbs the key.
    meta.partitions.last().map(|p| p.shard_id).unwrap_or(0)
}

/// Groups point keys by owning shard, preserving request order per shard.
pub fn prune_keys(meta: &TableMeta, keys: &[OwnedKey]) -> BTreeMap<u64, Vec<OwnedKey>> {
    let mut map: BTreeMap<u64, Vec<OwnedKey>> = BTreeMap::new();
    for key in keys {
        map.entry(shard_for_key(meta, key)).or_default().push(key.clone());
    }
    map
}

/// Splits `range` across the shards it touches, clipping each slice to the
/// partition's bounds.
pub fn prune_range(meta: &TableMeta, range: &KeyRange) -> BTreeMap<u64, Vec<KeyRange>> {
    let mut map: BTreeMap<u64, Vec<KeyRange>> = BTreeMap::new();
    let mut start: Option<&OwnedKey> = None;

    for partition in &meta.partitions {
        let clipped = clip(range, start, partition);
        if let Some(clipped) = clipped {
            map.entry(partition.shard_id).or_default().push(clipped);
        }
        start = partition.end_key.as_ref();
        if start.is_none() {
            break;
        }
    }
    map
}

pub fn prune_ranges(meta: &TableMeta, ranges: &[KeyRange]) -> BTreeMap<u64, Vec<KeyRange>> {
    let mut map: BTreeMap<u64, Vec<KeyRange>> = BTreeMap::new();
    for range in ranges {
        for (shard, mut slices) in prune_range(meta, range) {
            map.entry(shard).or_default().append(&mut slices);
        }
    }
    map
}

// Intersects `range` with the partition [start, end). None when empty.
fn clip(range: &KeyRange, start: Option<&OwnedKey>, partition: &Partition) -> Option<KeyRange> {
    let mut from = range.from.clone();
    let mut to = range.to.clone();

    if let Some(start) = start {
        // The partition's start tightens the lower bound when it lies above.
        if cmp_key_to_bound(start.cells(), &from.cells, BoundSide::From) == Ordering::Greater {
            from = KeyBound::inclusive(start.cells().to_vec());
        }
    }
    if let Some(end) = &partition.end_key {
        match cmp_key_to_bound(end.cells(), &to.cells, BoundSide::To) {
            Ordering::Less => to = KeyBound::exclusive(end.cells().to_vec()),
            Ordering::Equal if to.inclusive => to = KeyBound::exclusive(end.cells().to_vec()),
            _ => (),
        }
    }

    let clipped = KeyRange::new(from, to);
    clipped.intersects(&clipped).then_some(clipped)
}
