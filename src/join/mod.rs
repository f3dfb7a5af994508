//! Join hash table builder
//!
//! Builds probe-side tables from an inner column (or tuple): a perfect
//! layout when the inner key range is dense, otherwise baseline
//! MurmurHash3-seeded linear probing. OneToMany regions are produced by
//! counting per-bucket hits, prefix-summing into offsets, then scattering
//! row ids into the payload. Nullable keys translate to a reserved sentinel
//! one past the valid range.

use crate::error::{Error, Result};
use crate::plan::JoinLayoutHint;
use crate::runtime::groupby::{key_hash, KeyWidth, EMPTY_KEY_64};
use crate::runtime::join as join_rt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Hard ceiling on hash entries (int32 row ids)
const MAX_HASH_ENTRIES: u64 = 2_000_000_000;
/// Key ranges past this build baseline instead of perfect tables
const MAX_PERFECT_RANGE: u64 = 1 << 22;

/// Row-id runs matched by a probe
pub enum JoinMatches<'a> {
    /// Probe miss
    None,
    /// Single inner row
    One(i64),
    /// OneToMany payload run
    Run(&'a [i32]),
}

/// Storage behind a built join table
#[derive(Debug)]
enum JoinStorage {
    PerfectOneToOne {
        slots: Vec<i32>,
        min_key: i64,
        max_key: i64,
    },
    PerfectOneToMany {
        offsets: Vec<i32>,
        counts: Vec<i32>,
        payload: Vec<i32>,
        min_key: i64,
        max_key: i64,
    },
    Baseline {
        keys: Vec<i64>,
        ids: Vec<i32>,
    },
    /// Both sides may duplicate; composite keys, column-major, with
    /// offset/count/payload regions per entry
    ManyToMany {
        keys: Vec<i64>,
        key_count: usize,
        entry_count: u32,
        offsets: Vec<i32>,
        counts: Vec<i32>,
        payload: Vec<i32>,
    },
}

/// An immutable join hash table over one inner column or tuple.
#[derive(Debug)]
pub struct JoinHashTable {
    storage: JoinStorage,
    /// Sentinel null keys were translated to (one past the valid range)
    pub translated_null: Option<i64>,
}

impl JoinHashTable {
    /// Build from decoded inner-key values. Row ids are the value positions.
    ///
    /// `null_sentinel` enables null-key translation; when `None` sentinel
    /// values participate as ordinary keys.
    ///
    /// # Errors
    /// [`Error::NeedsOneToManyHash`] when OneToOne was requested but the
    /// inner keys duplicate; [`Error::TooManyHashEntries`] past the 2B cap.
    pub fn build(
        values: &[i64],
        null_sentinel: Option<i64>,
        layout: JoinLayoutHint,
    ) -> Result<Self> {
        let (mut min_key, mut max_key) = (i64::MAX, i64::MIN);
        for &v in values {
            if Some(v) == null_sentinel {
                continue;
            }
            min_key = min_key.min(v);
            max_key = max_key.max(v);
        }
        if min_key > max_key {
            // all-null or empty inner side
            min_key = 0;
            max_key = -1;
        }

        let has_nulls = null_sentinel.is_some_and(|s| values.contains(&s));
        let translated_null = has_nulls.then(|| max_key + 1);
        let effective_max = translated_null.unwrap_or(max_key);

        let range = if effective_max < min_key {
            0
        } else {
            (effective_max - min_key) as u64 + 1
        };
        if range > MAX_HASH_ENTRIES || values.len() as u64 > MAX_HASH_ENTRIES {
            return Err(Error::TooManyHashEntries(range.max(values.len() as u64)));
        }

        let translate = |v: i64| {
            if Some(v) == null_sentinel {
                translated_null.expect("sentinel seen implies translation")
            } else {
                v
            }
        };

        let storage = if range > 0 && range <= MAX_PERFECT_RANGE {
            Self::build_perfect(values, min_key, effective_max, layout, &translate)?
        } else {
            Self::build_baseline(values, layout, &translate)?
        };
        debug!(
            rows = values.len(),
            range,
            perfect = range <= MAX_PERFECT_RANGE,
            "built join hash table"
        );
        Ok(Self {
            storage,
            translated_null,
        })
    }

    fn build_perfect(
        values: &[i64],
        min_key: i64,
        max_key: i64,
        layout: JoinLayoutHint,
        translate: &impl Fn(i64) -> i64,
    ) -> Result<JoinStorage> {
        #[allow(clippy::cast_sign_loss)]
        let entry_count = (max_key - min_key) as usize + 1;
        match layout {
            JoinLayoutHint::OneToOne => {
                let mut slots = vec![join_rt::INVALID_SLOT; entry_count];
                for (row, &v) in values.iter().enumerate() {
                    #[allow(clippy::cast_sign_loss)]
                    let idx = (translate(v) - min_key) as usize;
                    if slots[idx] != join_rt::INVALID_SLOT {
                        return Err(Error::NeedsOneToManyHash);
                    }
                    slots[idx] = i32::try_from(row)
                        .map_err(|_| Error::TooManyHashEntries(values.len() as u64))?;
                }
                Ok(JoinStorage::PerfectOneToOne {
                    slots,
                    min_key,
                    max_key,
                })
            }
            JoinLayoutHint::OneToMany => {
                // count, prefix-sum into offsets, scatter
                let mut counts = vec![0i32; entry_count];
                for &v in values {
                    #[allow(clippy::cast_sign_loss)]
                    let idx = (translate(v) - min_key) as usize;
                    counts[idx] += 1;
                }
                let mut offsets = vec![0i32; entry_count];
                let mut acc = 0i32;
                for (o, &c) in offsets.iter_mut().zip(&counts) {
                    *o = acc;
                    acc += c;
                }
                let mut cursor = offsets.clone();
                let mut payload = vec![0i32; values.len()];
                for (row, &v) in values.iter().enumerate() {
                    #[allow(clippy::cast_sign_loss)]
                    let idx = (translate(v) - min_key) as usize;
                    #[allow(clippy::cast_sign_loss)]
                    let at = cursor[idx] as usize;
                    payload[at] = i32::try_from(row)
                        .map_err(|_| Error::TooManyHashEntries(values.len() as u64))?;
                    cursor[idx] += 1;
                }
                Ok(JoinStorage::PerfectOneToMany {
                    offsets,
                    counts,
                    payload,
                    min_key,
                    max_key,
                })
            }
        }
    }

    fn build_baseline(
        values: &[i64],
        layout: JoinLayoutHint,
        translate: &impl Fn(i64) -> i64,
    ) -> Result<JoinStorage> {
        if layout == JoinLayoutHint::OneToMany {
            // arbitrary-key one-to-many is the single-key case of the
            // many-to-many generalization
            let translated: Vec<i64> = values.iter().map(|&v| translate(v)).collect();
            return Self::build_many_to_many_storage(&[&translated]);
        }
        let entry_count = (values.len() * 2).next_power_of_two().max(16);
        let mut keys = vec![EMPTY_KEY_64; entry_count];
        let mut ids = vec![join_rt::INVALID_SLOT; entry_count];
        #[allow(clippy::cast_possible_truncation)]
        let n = entry_count as u32;
        for (row, &v) in values.iter().enumerate() {
            let key = translate(v);
            let mut probe = key_hash(&[key], KeyWidth::W8) % n;
            loop {
                let slot = &mut keys[probe as usize];
                if *slot == key {
                    return Err(Error::NeedsOneToManyHash);
                }
                if *slot == EMPTY_KEY_64 {
                    *slot = key;
                    ids[probe as usize] = i32::try_from(row)
                        .map_err(|_| Error::TooManyHashEntries(values.len() as u64))?;
                    break;
                }
                probe = (probe + 1) % n;
            }
        }
        Ok(JoinStorage::Baseline { keys, ids })
    }

    /// Build the ManyToMany generalization over a composite key: both sides
    /// may duplicate, the payload is a per-entry row-id list.
    pub fn build_many_to_many(key_columns: &[&[i64]]) -> Result<Self> {
        Ok(Self {
            storage: Self::build_many_to_many_storage(key_columns)?,
            translated_null: None,
        })
    }

    fn build_many_to_many_storage(key_columns: &[&[i64]]) -> Result<JoinStorage> {
        let key_count = key_columns.len().max(1);
        let rows = key_columns.first().map_or(0, |c| c.len());
        if rows as u64 > MAX_HASH_ENTRIES {
            return Err(Error::TooManyHashEntries(rows as u64));
        }
        let entry_count = (rows * 2).next_power_of_two().max(16);
        #[allow(clippy::cast_possible_truncation)]
        let n = entry_count as u32;

        let mut keys = vec![EMPTY_KEY_64; key_count * entry_count];
        let mut entry_rows: Vec<Vec<i32>> = vec![Vec::new(); entry_count];

        let tuple_at = |row: usize| -> Vec<i64> {
            key_columns.iter().map(|c| c[row]).collect()
        };

        for row in 0..rows {
            let tuple = tuple_at(row);
            let mut probe = key_hash(&tuple, KeyWidth::W8) % n;
            loop {
                let e = probe as usize;
                if keys[e] == EMPTY_KEY_64 {
                    for (j, &k) in tuple.iter().enumerate() {
                        keys[j * entry_count + e] = k;
                    }
                    entry_rows[e].push(i32::try_from(row)
                        .map_err(|_| Error::TooManyHashEntries(rows as u64))?);
                    break;
                }
                let matches = (0..key_count).all(|j| keys[j * entry_count + e] == tuple[j]);
                if matches {
                    entry_rows[e].push(i32::try_from(row)
                        .map_err(|_| Error::TooManyHashEntries(rows as u64))?);
                    break;
                }
                probe = (probe + 1) % n;
            }
        }

        // flatten the per-entry lists into offset/count/payload regions
        let mut offsets = vec![0i32; entry_count];
        let mut counts = vec![0i32; entry_count];
        let mut payload = Vec::with_capacity(rows);
        for (e, rows_list) in entry_rows.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let off = payload.len() as i32;
            #[allow(clippy::cast_possible_truncation)]
            let cnt = rows_list.len() as i32;
            offsets[e] = off;
            counts[e] = cnt;
            payload.extend_from_slice(rows_list);
        }

        Ok(JoinStorage::ManyToMany {
            keys,
            key_count,
            entry_count: n,
            offsets,
            counts,
            payload,
        })
    }

    /// Probe with a single key (nulls already translated by the caller or
    /// via [`Self::probe_nullable`]).
    #[must_use]
    pub fn probe(&self, key: i64) -> JoinMatches<'_> {
        match &self.storage {
            JoinStorage::PerfectOneToOne {
                slots,
                min_key,
                max_key,
            } => {
                let idx = join_rt::hash_join_idx(slots, key, *min_key, *max_key);
                if idx < 0 {
                    JoinMatches::None
                } else {
                    JoinMatches::One(idx)
                }
            }
            JoinStorage::PerfectOneToMany {
                offsets,
                counts,
                payload,
                min_key,
                max_key,
            } => {
                let run =
                    join_rt::hash_join_idx_payload(offsets, counts, payload, key, *min_key, *max_key);
                if run.is_empty() {
                    JoinMatches::None
                } else {
                    JoinMatches::Run(run)
                }
            }
            JoinStorage::Baseline { keys, ids } => {
                let idx = join_rt::baseline_join_idx(keys, ids, key, EMPTY_KEY_64);
                if idx < 0 {
                    JoinMatches::None
                } else {
                    JoinMatches::One(idx)
                }
            }
            JoinStorage::ManyToMany { .. } => self.probe_tuple(&[key]),
        }
    }

    /// Probe translating the null sentinel first.
    #[must_use]
    pub fn probe_nullable(&self, key: i64, null_sentinel: i64) -> JoinMatches<'_> {
        if key == null_sentinel {
            match self.translated_null {
                Some(t) => self.probe(t),
                None => JoinMatches::None,
            }
        } else {
            self.probe(key)
        }
    }

    /// Probe a composite key against a ManyToMany table.
    #[must_use]
    pub fn probe_tuple(&self, tuple: &[i64]) -> JoinMatches<'_> {
        let JoinStorage::ManyToMany {
            keys,
            key_count,
            entry_count,
            offsets,
            counts,
            payload,
        } = &self.storage
        else {
            return JoinMatches::None;
        };
        if tuple.len() != *key_count {
            return JoinMatches::None;
        }
        let n = *entry_count;
        let h = key_hash(tuple, KeyWidth::W8) % n;
        let mut probe = h;
        loop {
            let e = probe as usize;
            if keys[e] == EMPTY_KEY_64 {
                return JoinMatches::None;
            }
            let matches =
                (0..*key_count).all(|j| keys[j * n as usize + e] == tuple[j]);
            if matches {
                #[allow(clippy::cast_sign_loss)]
                let (off, cnt) = (offsets[e] as usize, counts[e] as usize);
                return JoinMatches::Run(&payload[off..off + cnt]);
            }
            probe = (probe + 1) % n;
            if probe == h {
                return JoinMatches::None;
            }
        }
    }
}

/// Join-table cache: one mutex per cache slot, so concurrent builds of
/// different inner columns never serialize on a global lock.
pub struct JoinHashTableCache {
    slots: Vec<Mutex<HashMap<(u32, usize), Arc<JoinHashTable>>>>,
}

impl Default for JoinHashTableCache {
    fn default() -> Self {
        Self::new(16)
    }
}

impl JoinHashTableCache {
    /// Cache with `slot_count` independently locked slots.
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// Cached table for (table id, column), building under the slot mutex
    /// on miss.
    pub fn get_or_build(
        &self,
        table_id: u32,
        column: usize,
        build: impl FnOnce() -> Result<JoinHashTable>,
    ) -> Result<Arc<JoinHashTable>> {
        let slot_idx = (table_id as usize + column) % self.slots.len();
        let mut slot = self.slots[slot_idx].lock();
        if let Some(t) = slot.get(&(table_id, column)) {
            return Ok(Arc::clone(t));
        }
        let built = Arc::new(build()?);
        slot.insert((table_id, column), Arc::clone(&built));
        Ok(built)
    }
}
