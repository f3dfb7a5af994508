//! Group-value lookup: linear probing with insertion over a pre-initialized
//! group-by buffer
//!
//! A row-major buffer holds `entry_count` entries of `row_size_quad` 64-bit
//! qwords each: the key region first (compacted to 4-byte keys when the
//! descriptor decides so), then the aggregate slots. The columnar variant
//! stores keys column-major and returns an entry index instead of a slot
//! offset. Probing is MurmurHash3-seeded; insertion claims the first empty
//! entry; a full table returns `None` and the row function records the
//! out-of-slots error code.

use super::check_interrupt;

/// Empty-key sentinel for 8-byte keys
pub const EMPTY_KEY_64: i64 = i64::MIN;
/// Empty-key sentinel for compacted 4-byte keys
pub const EMPTY_KEY_32: i32 = i32::MIN;

/// Probe steps between watchdog polls inside the lookup loop
const WATCHDOG_PROBE_COUNTDOWN: u32 = 100;

/// Physical key width chosen by the memory descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyWidth {
    /// Keys compacted to 4 bytes, two per qword
    W4,
    /// Full 8-byte keys
    W8,
}

impl KeyWidth {
    /// Bytes per key component.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::W4 => 4,
            Self::W8 => 8,
        }
    }

    /// Qwords occupied by a `key_count`-component key region.
    #[must_use]
    pub const fn key_qw_count(self, key_count: usize) -> usize {
        match self {
            Self::W4 => key_count.div_ceil(2),
            Self::W8 => key_count,
        }
    }
}

/// MurmurHash3 x86_32, seed 0, over the packed key bytes.
#[must_use]
pub fn key_hash(key: &[i64], key_width: KeyWidth) -> u32 {
    let mut bytes = Vec::with_capacity(key.len() * key_width.bytes());
    for &k in key {
        match key_width {
            KeyWidth::W4 => {
                #[allow(clippy::cast_possible_truncation)]
                bytes.extend_from_slice(&(k as i32).to_le_bytes());
            }
            KeyWidth::W8 => bytes.extend_from_slice(&k.to_le_bytes()),
        }
    }
    murmur_hash3_32(&bytes, 0)
}

/// MurmurHash3 x86_32 (Austin Appleby's finalizer constants).
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn murmur_hash3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let nblocks = data.len() / 4;
    let mut h1 = seed;

    for i in 0..nblocks {
        let mut k1 = u32::from_le_bytes([
            data[i * 4],
            data[i * 4 + 1],
            data[i * 4 + 2],
            data[i * 4 + 3],
        ]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = &data[nblocks * 4..];
    let mut k1: u32 = 0;
    if tail.len() >= 3 {
        k1 ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        k1 ^= u32::from(tail[0]);
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// Pack a logical key into its storage qwords.
fn pack_key(key: &[i64], key_width: KeyWidth) -> Vec<i64> {
    match key_width {
        KeyWidth::W8 => key.to_vec(),
        KeyWidth::W4 => {
            let mut packed = vec![0i64; KeyWidth::W4.key_qw_count(key.len())];
            for (i, &k) in key.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let half = (k as i32 as u32) as u64;
                let qw = &mut packed[i / 2];
                if i % 2 == 0 {
                    *qw = (*qw as u64 & 0xFFFF_FFFF_0000_0000 | half) as i64;
                } else {
                    *qw = (*qw as u64 & 0x0000_0000_FFFF_FFFF | (half << 32)) as i64;
                }
            }
            // odd key counts leave the high half of the last qword at the
            // empty pattern so emptiness checks stay uniform
            if key.len() % 2 == 1 {
                let qw = &mut packed[key.len() / 2];
                *qw = (*qw as u64 & 0x0000_0000_FFFF_FFFF
                    | ((EMPTY_KEY_32 as u32 as u64) << 32)) as i64;
            }
            packed
        }
    }
}

fn entry_is_empty(groups: &[i64], off: usize, key_width: KeyWidth) -> bool {
    match key_width {
        KeyWidth::W8 => groups[off] == EMPTY_KEY_64,
        KeyWidth::W4 => {
            #[allow(clippy::cast_possible_truncation)]
            let low = groups[off] as i32;
            low == EMPTY_KEY_32
        }
    }
}

/// Probe one entry with a pre-packed key. On an empty entry the key is
/// written and the aggregate region offset returned; on a matching key the
/// offset is returned; on a conflicting key `None`.
fn matching_packed(
    groups: &mut [i64],
    h: u32,
    packed: &[i64],
    key_width: KeyWidth,
    row_size_quad: usize,
) -> Option<usize> {
    let key_qw = packed.len();
    let off = h as usize * row_size_quad;
    if entry_is_empty(groups, off, key_width) {
        groups[off..off + key_qw].copy_from_slice(packed);
        return Some(off + key_qw);
    }
    if groups[off..off + key_qw] == *packed {
        return Some(off + key_qw);
    }
    None
}

/// Probe one entry. See [`get_group_value`] for the full probing loop.
#[must_use]
pub fn get_matching_group_value(
    groups: &mut [i64],
    h: u32,
    key: &[i64],
    key_width: KeyWidth,
    row_size_quad: usize,
) -> Option<usize> {
    let packed = pack_key(key, key_width);
    matching_packed(groups, h, &packed, key_width, row_size_quad)
}

/// Linear probing with insertion over a row-major group-by buffer.
///
/// Returns the qword offset of the matching entry's aggregate region, or
/// `None` when every entry is occupied by a different key (out of slots).
/// Stable: a second call with the same key returns the same offset. The key
/// packs once; the probe loop compares packed qwords.
#[must_use]
pub fn get_group_value(
    groups: &mut [i64],
    entry_count: u32,
    key: &[i64],
    key_width: KeyWidth,
    row_size_quad: usize,
) -> Option<usize> {
    let packed = pack_key(key, key_width);
    let h = key_hash(key, key_width) % entry_count;
    if let Some(off) = matching_packed(groups, h, &packed, key_width, row_size_quad) {
        return Some(off);
    }
    let mut h_probe = (h + 1) % entry_count;
    while h_probe != h {
        if let Some(off) = matching_packed(groups, h_probe, &packed, key_width, row_size_quad) {
            return Some(off);
        }
        h_probe = (h_probe + 1) % entry_count;
    }
    None
}

/// [`get_group_value`] that polls the interrupt flag every
/// `WATCHDOG_PROBE_COUNTDOWN` probe steps. Returns `None` on trip; the
/// caller distinguishes full-table from interrupt by re-checking the flag.
#[must_use]
pub fn get_group_value_with_watchdog(
    groups: &mut [i64],
    entry_count: u32,
    key: &[i64],
    key_width: KeyWidth,
    row_size_quad: usize,
) -> Option<usize> {
    let packed = pack_key(key, key_width);
    let h = key_hash(key, key_width) % entry_count;
    if let Some(off) = matching_packed(groups, h, &packed, key_width, row_size_quad) {
        return Some(off);
    }
    let mut countdown = WATCHDOG_PROBE_COUNTDOWN;
    let mut h_probe = (h + 1) % entry_count;
    while h_probe != h {
        if let Some(off) = matching_packed(groups, h_probe, &packed, key_width, row_size_quad) {
            return Some(off);
        }
        h_probe = (h_probe + 1) % entry_count;
        countdown -= 1;
        if countdown == 0 {
            if check_interrupt() {
                return None;
            }
            countdown = WATCHDOG_PROBE_COUNTDOWN;
        }
    }
    None
}

/// Probe one entry of a columnar key region (8-byte keys, column-major).
fn matching_columnar_entry(
    groups: &mut [i64],
    entry_count: u32,
    e: u32,
    key: &[i64],
) -> Option<u32> {
    let first = groups[e as usize];
    if first == EMPTY_KEY_64 {
        for (j, &k) in key.iter().enumerate() {
            groups[j * entry_count as usize + e as usize] = k;
        }
        return Some(e);
    }
    let matches = key
        .iter()
        .enumerate()
        .all(|(j, &k)| groups[j * entry_count as usize + e as usize] == k);
    matches.then_some(e)
}

/// Linear probing with insertion over a columnar key region; returns the
/// entry index used to address column-major slots.
#[must_use]
pub fn get_group_value_columnar(
    groups: &mut [i64],
    entry_count: u32,
    key: &[i64],
) -> Option<u32> {
    let h = key_hash(key, KeyWidth::W8) % entry_count;
    if let Some(e) = matching_columnar_entry(groups, entry_count, h, key) {
        return Some(e);
    }
    let mut h_probe = (h + 1) % entry_count;
    while h_probe != h {
        if let Some(e) = matching_columnar_entry(groups, entry_count, h_probe, key) {
            return Some(e);
        }
        h_probe = (h_probe + 1) % entry_count;
    }
    None
}

/// Perfect-hash lookup: the key maps directly to its bucket, no collisions.
/// Writes the key on first touch and returns the aggregate region offset.
#[must_use]
pub fn get_group_value_fast(
    groups: &mut [i64],
    key: i64,
    min_key: i64,
    bucket: i64,
    row_size_quad: usize,
) -> usize {
    let mut idx = key - min_key;
    if bucket > 1 {
        idx /= bucket;
    }
    #[allow(clippy::cast_sign_loss)]
    let off = idx as usize * row_size_quad;
    if groups[off] == EMPTY_KEY_64 {
        groups[off] = key;
    }
    off + 1
}

/// Keyless perfect hash: the entry index alone identifies the group; no key
/// is materialized.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn get_group_value_fast_keyless(key: i64, min_key: i64, bucket: i64) -> usize {
    let mut idx = key - min_key;
    if bucket > 1 {
        idx /= bucket;
    }
    idx as usize
}

/// Initialize a row-major group-by buffer: key regions to the empty pattern,
/// aggregate slots to their per-target init values. Keyless buffers have no
/// key region.
pub fn init_group_by_buffer(
    groups: &mut [i64],
    entry_count: u32,
    key_qw_count: usize,
    key_width: KeyWidth,
    init_vals: &[i64],
    keyless: bool,
) {
    let row_size_quad = if keyless { init_vals.len() } else { key_qw_count + init_vals.len() };
    let empty_qw = match key_width {
        KeyWidth::W8 => EMPTY_KEY_64,
        KeyWidth::W4 => {
            let half = EMPTY_KEY_32 as u32 as u64;
            (half | (half << 32)) as i64
        }
    };
    for e in 0..entry_count as usize {
        let base = e * row_size_quad;
        if keyless {
            groups[base..base + init_vals.len()].copy_from_slice(init_vals);
        } else {
            for qw in &mut groups[base..base + key_qw_count] {
                *qw = empty_qw;
            }
            groups[base + key_qw_count..base + row_size_quad].copy_from_slice(init_vals);
        }
    }
}

/// Initialize a columnar buffer: the key region (column-major, 8-byte keys)
/// to the empty sentinel, then each slot column to its init value.
pub fn init_group_by_buffer_columnar(
    groups: &mut [i64],
    entry_count: u32,
    key_count: usize,
    init_vals: &[i64],
) {
    let n = entry_count as usize;
    for qw in &mut groups[..key_count * n] {
        *qw = EMPTY_KEY_64;
    }
    for (j, &iv) in init_vals.iter().enumerate() {
        let base = key_count * n + j * n;
        for qw in &mut groups[base..base + n] {
            *qw = iv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_buffer(entry_count: u32, key_qw: usize, slot_count: usize) -> Vec<i64> {
        let row = key_qw + slot_count;
        let mut groups = vec![0i64; entry_count as usize * row];
        init_group_by_buffer(
            &mut groups,
            entry_count,
            key_qw,
            KeyWidth::W8,
            &vec![0i64; slot_count],
            false,
        );
        groups
    }

    #[test]
    fn test_murmur3_known_vectors() {
        // Reference vectors for MurmurHash3 x86_32
        assert_eq!(murmur_hash3_32(b"", 0), 0);
        assert_eq!(murmur_hash3_32(b"", 1), 0x514E_28B7);
        assert_eq!(murmur_hash3_32(b"hello", 0), 0x248B_FA47);
    }

    #[test]
    fn test_get_group_value_inserts_then_finds() {
        let mut groups = fresh_buffer(8, 1, 2);
        let off1 = get_group_value(&mut groups, 8, &[42], KeyWidth::W8, 3).unwrap();
        let off2 = get_group_value(&mut groups, 8, &[42], KeyWidth::W8, 3).unwrap();
        assert_eq!(off1, off2, "lookup is stable");
        // key materialized one qword before the agg region
        assert_eq!(groups[off1 - 1], 42);
    }

    #[test]
    fn test_get_group_value_distinct_keys_distinct_slots() {
        let mut groups = fresh_buffer(8, 1, 1);
        let a = get_group_value(&mut groups, 8, &[1], KeyWidth::W8, 2).unwrap();
        let b = get_group_value(&mut groups, 8, &[2], KeyWidth::W8, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_group_value_full_table_returns_none() {
        let mut groups = fresh_buffer(2, 1, 1);
        assert!(get_group_value(&mut groups, 2, &[1], KeyWidth::W8, 2).is_some());
        assert!(get_group_value(&mut groups, 2, &[2], KeyWidth::W8, 2).is_some());
        assert!(get_group_value(&mut groups, 2, &[3], KeyWidth::W8, 2).is_none());
    }

    #[test]
    fn test_compacted_keys_preserve_bytes() {
        let entry_count = 16u32;
        let key_qw = KeyWidth::W4.key_qw_count(2);
        let mut groups = fresh_buffer(entry_count, key_qw, 1);
        init_group_by_buffer(&mut groups, entry_count, key_qw, KeyWidth::W4, &[0], false);

        let key = [7i64, -3];
        let off =
            get_group_value(&mut groups, entry_count, &key, KeyWidth::W4, key_qw + 1).unwrap();
        // the 4-byte components are recoverable from the packed qword
        let qw = groups[off - key_qw] as u64;
        #[allow(clippy::cast_possible_truncation)]
        let low = (qw & 0xFFFF_FFFF) as u32 as i32;
        #[allow(clippy::cast_possible_truncation)]
        let high = (qw >> 32) as u32 as i32;
        assert_eq!(low, 7);
        assert_eq!(high, -3);
    }

    #[test]
    fn test_multi_qword_keys() {
        let mut groups = fresh_buffer(8, 2, 1);
        let a = get_group_value(&mut groups, 8, &[1, 2], KeyWidth::W8, 3).unwrap();
        let b = get_group_value(&mut groups, 8, &[1, 3], KeyWidth::W8, 3).unwrap();
        let a2 = get_group_value(&mut groups, 8, &[1, 2], KeyWidth::W8, 3).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_columnar_lookup_round_trip() {
        let entry_count = 8u32;
        let key_count = 2usize;
        let slot_count = 1usize;
        let mut groups = vec![0i64; (key_count + slot_count) * entry_count as usize];
        init_group_by_buffer_columnar(&mut groups, entry_count, key_count, &[0]);

        let e1 = get_group_value_columnar(&mut groups, entry_count, &[10, 20]).unwrap();
        let e2 = get_group_value_columnar(&mut groups, entry_count, &[10, 20]).unwrap();
        assert_eq!(e1, e2);
        assert_eq!(groups[e1 as usize], 10);
        assert_eq!(groups[entry_count as usize + e1 as usize], 20);
    }

    #[test]
    fn test_perfect_hash_fast_path() {
        let mut groups = vec![EMPTY_KEY_64; 10 * 2];
        let off = get_group_value_fast(&mut groups, 7, 3, 1, 2);
        assert_eq!(off, (7 - 3) * 2 + 1);
        assert_eq!(groups[(7 - 3) * 2], 7, "key written on first touch");
    }

    #[test]
    fn test_keyless_fast_path_is_pure_offset() {
        assert_eq!(get_group_value_fast_keyless(7, 3, 1), 4);
        assert_eq!(get_group_value_fast_keyless(30, 0, 10), 3);
    }
}
