//! Join-probe runtime functions
//!
//! Perfect layouts address the slot table directly from the key; the
//! baseline layout probes a MurmurHash3-seeded open-addressed key table.
//! A miss is `-1`. The `_nullable` variants translate the null sentinel to a
//! configured in-range key so null keys can participate when the join
//! semantics ask for it.

use super::groupby::{key_hash, KeyWidth};

/// Sentinel stored in unoccupied OneToOne slots
pub const INVALID_SLOT: i32 = -1;

/// Perfect OneToOne probe: `key` in `[min_key, max_key]` addresses
/// `slots[key − min_key]` which holds an inner row id or [`INVALID_SLOT`].
#[inline]
#[must_use]
pub fn hash_join_idx(slots: &[i32], key: i64, min_key: i64, max_key: i64) -> i64 {
    if key < min_key || key > max_key {
        return -1;
    }
    #[allow(clippy::cast_sign_loss)]
    let idx = (key - min_key) as usize;
    i64::from(slots[idx])
}

/// Perfect probe over bucketized keys: the key is normalized by `bucket`
/// before addressing.
#[inline]
#[must_use]
pub fn bucketized_hash_join_idx(
    slots: &[i32],
    key: i64,
    min_key: i64,
    max_key: i64,
    bucket: i64,
) -> i64 {
    if key < min_key || key > max_key {
        return -1;
    }
    #[allow(clippy::cast_sign_loss)]
    let idx = ((key - min_key) / bucket.max(1)) as usize;
    if idx >= slots.len() {
        return -1;
    }
    i64::from(slots[idx])
}

/// Row-id join: the key *is* the inner row id, so no table is consulted.
#[inline]
#[must_use]
pub fn rowid_hash_join_idx(key: i64, min_key: i64, max_key: i64) -> i64 {
    if key < min_key || key > max_key {
        -1
    } else {
        key - min_key
    }
}

/// [`hash_join_idx`] translating the null sentinel to `translated_null`.
#[inline]
#[must_use]
pub fn hash_join_idx_nullable(
    slots: &[i32],
    key: i64,
    min_key: i64,
    max_key: i64,
    null_val: i64,
    translated_null: i64,
) -> i64 {
    let k = if key == null_val { translated_null } else { key };
    hash_join_idx(slots, k, min_key, max_key)
}

/// [`bucketized_hash_join_idx`] translating the null sentinel.
#[inline]
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn bucketized_hash_join_idx_nullable(
    slots: &[i32],
    key: i64,
    min_key: i64,
    max_key: i64,
    bucket: i64,
    null_val: i64,
    translated_null: i64,
) -> i64 {
    let k = if key == null_val { translated_null } else { key };
    bucketized_hash_join_idx(slots, k, min_key, max_key, bucket)
}

/// [`rowid_hash_join_idx`] where a null key always misses.
#[inline]
#[must_use]
pub fn rowid_hash_join_idx_nullable(key: i64, min_key: i64, max_key: i64, null_val: i64) -> i64 {
    if key == null_val {
        -1
    } else {
        rowid_hash_join_idx(key, min_key, max_key)
    }
}

/// OneToMany probe: returns the payload row-id run for `key`, empty on miss.
#[inline]
#[must_use]
pub fn hash_join_idx_payload<'a>(
    offsets: &[i32],
    counts: &[i32],
    payload: &'a [i32],
    key: i64,
    min_key: i64,
    max_key: i64,
) -> &'a [i32] {
    if key < min_key || key > max_key {
        return &[];
    }
    #[allow(clippy::cast_sign_loss)]
    let idx = (key - min_key) as usize;
    #[allow(clippy::cast_sign_loss)]
    let (off, cnt) = (offsets[idx] as usize, counts[idx] as usize);
    &payload[off..off + cnt]
}

/// Baseline probe: open-addressed i64 key table with a parallel id table.
/// Returns the inner row id or `-1`.
#[must_use]
pub fn baseline_join_idx(keys: &[i64], ids: &[i32], key: i64, empty_key: i64) -> i64 {
    if keys.is_empty() {
        return -1;
    }
    #[allow(clippy::cast_possible_truncation)]
    let entry_count = keys.len() as u32;
    let h = key_hash(&[key], KeyWidth::W8) % entry_count;
    let mut probe = h;
    loop {
        let slot_key = keys[probe as usize];
        if slot_key == key {
            return i64::from(ids[probe as usize]);
        }
        if slot_key == empty_key {
            return -1;
        }
        probe = (probe + 1) % entry_count;
        if probe == h {
            return -1;
        }
    }
}
