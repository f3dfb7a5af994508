//! Terminal sort / limit / offset pass over a reduced result set
//!
//! Three strategies, picked from the order spec and descriptor:
//! - bounded per-buffer heaps merged K-way, when a small LIMIT is present
//!   (the streaming top-N path);
//! - LSB radix sort on a bijective u64 mapping, for a single fixed-width
//!   key with uniform direction;
//! - comparator sort on extracted datums for everything else (strings,
//!   multi-key, mixed directions).

use super::ResultSet;
use crate::descriptor::STREAMING_TOP_N_MAX;
use crate::plan::SortInfo;
use crate::topk::{SortKey, SortOrder, StreamingTopN, TopNEntry};
use crate::types::Datum;
use std::cmp::Ordering;

impl ResultSet {
    /// Apply ORDER BY, then OFFSET/LIMIT, fixing the iteration order.
    pub fn sort_and_limit(&mut self, sort: &SortInfo) {
        let coords = self.entry_coords();

        if sort.order.is_empty() {
            self.set_row_order(apply_window(coords, sort));
            return;
        }

        let n_wanted = sort.limit.map(|l| l + sort.offset);

        // streaming top-N: bounded per-buffer heaps, merged
        if sort.order.len() == 1 {
            if let Some(n) = n_wanted {
                if n <= STREAMING_TOP_N_MAX {
                    let order = self.heap_order(&coords, sort, n);
                    self.set_row_order(apply_window(order, sort));
                    return;
                }
            }
        }

        let order = if let Some(order) = self.radix_order(&coords, sort) {
            order
        } else {
            self.comparator_order(coords, sort)
        };
        self.set_row_order(apply_window(order, sort));
    }

    /// Bounded-heap selection of the best `n` coords (single order key).
    fn heap_order(
        &self,
        coords: &[(usize, usize)],
        sort: &SortInfo,
        n: usize,
    ) -> Vec<(usize, usize)> {
        let entry = sort.order[0];
        let dir = if entry.descending {
            SortOrder::Descending
        } else {
            SortOrder::Ascending
        };

        let mut nulls = Vec::new();
        let mut per_buffer: Vec<StreamingTopN> = Vec::new();
        let mut current_buffer = usize::MAX;

        for &(b, e) in coords {
            match self.sort_key_at(b, e, entry.target_idx) {
                None => nulls.push((b, e)),
                Some(key) => {
                    if b != current_buffer {
                        per_buffer.push(StreamingTopN::new(dir, n));
                        current_buffer = b;
                    }
                    per_buffer
                        .last_mut()
                        .expect("heap pushed above")
                        .offer(TopNEntry {
                            key,
                            buffer: b,
                            entry: e,
                        });
                }
            }
        }

        let mut merged = StreamingTopN::new(dir, n);
        for heap in per_buffer {
            merged.merge(heap);
        }
        let sorted: Vec<(usize, usize)> = merged
            .into_sorted()
            .into_iter()
            .map(|t| (t.buffer, t.entry))
            .collect();

        let mut order = Vec::with_capacity(sorted.len() + nulls.len());
        if entry.nulls_first {
            order.extend(nulls);
            order.extend(sorted);
        } else {
            order.extend(sorted);
            order.extend(nulls);
        }
        order
    }

    /// Radix path: single fixed-width non-string key.
    fn radix_order(
        &self,
        coords: &[(usize, usize)],
        sort: &SortInfo,
    ) -> Option<Vec<(usize, usize)>> {
        if sort.order.len() != 1 {
            return None;
        }
        let entry = sort.order[0];
        let t = self.qmd.targets.get(entry.target_idx)?;
        if t.result_type.ty.is_string() {
            return None;
        }

        let mut nulls = Vec::new();
        let mut keyed: Vec<(u64, (usize, usize))> = Vec::with_capacity(coords.len());
        for &(b, e) in coords {
            match self.sort_key_at(b, e, entry.target_idx) {
                None => nulls.push((b, e)),
                Some(key) => {
                    let mapped = map_to_u64(&key);
                    let mapped = if entry.descending { !mapped } else { mapped };
                    keyed.push((mapped, (b, e)));
                }
            }
        }

        radix_sort_u64(&mut keyed);

        let sorted = keyed.into_iter().map(|(_, c)| c);
        let mut order = Vec::with_capacity(coords.len());
        if entry.nulls_first {
            order.extend(nulls);
            order.extend(sorted);
        } else {
            order.extend(sorted);
            order.extend(nulls);
        }
        Some(order)
    }

    /// Comparator fallback for multi-key / string orderings.
    fn comparator_order(
        &self,
        coords: Vec<(usize, usize)>,
        sort: &SortInfo,
    ) -> Vec<(usize, usize)> {
        let keys: Vec<Vec<Datum>> = coords
            .iter()
            .map(|&(b, e)| {
                sort.order
                    .iter()
                    .map(|o| self.value_at(b, e, o.target_idx))
                    .collect()
            })
            .collect();

        let mut idx: Vec<usize> = (0..coords.len()).collect();
        idx.sort_by(|&a, &b| {
            for (k, o) in sort.order.iter().enumerate() {
                let (da, db) = (&keys[a][k], &keys[b][k]);
                let ord = match (da, db) {
                    (Datum::Null, Datum::Null) => Ordering::Equal,
                    (Datum::Null, _) => {
                        if o.nulls_first {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    }
                    (_, Datum::Null) => {
                        if o.nulls_first {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    }
                    _ => {
                        let base = da.cmp_non_null(db);
                        if o.descending {
                            base.reverse()
                        } else {
                            base
                        }
                    }
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        idx.into_iter().map(|i| coords[i]).collect()
    }

    /// Fixed-width sort key of one target value; `None` for SQL NULL.
    fn sort_key_at(&self, b: usize, e: usize, target: usize) -> Option<SortKey> {
        match self.value_at(b, e, target) {
            Datum::Null | Datum::Str(_) => None,
            Datum::Int(v) => Some(SortKey::int(v)),
            Datum::Double(v) => Some(SortKey::fp(v)),
        }
    }
}

fn apply_window(order: Vec<(usize, usize)>, sort: &SortInfo) -> Vec<(usize, usize)> {
    let start = sort.offset.min(order.len());
    let end = sort
        .limit
        .map_or(order.len(), |l| (start + l).min(order.len()));
    order[start..end].to_vec()
}

/// Order-preserving bijection into u64: sign-bit flip for integers, the
/// IEEE total-order trick for doubles.
fn map_to_u64(key: &SortKey) -> u64 {
    if key.fp {
        let bits = key.v as u64;
        if bits & (1 << 63) != 0 {
            !bits
        } else {
            bits | (1 << 63)
        }
    } else {
        (key.v as u64) ^ (1 << 63)
    }
}

/// LSB radix sort, four 16-bit passes, stable.
fn radix_sort_u64(items: &mut Vec<(u64, (usize, usize))>) {
    const BITS: u32 = 16;
    const BUCKETS: usize = 1 << BITS;
    let mut scratch: Vec<(u64, (usize, usize))> = Vec::with_capacity(items.len());

    for pass in 0..4u32 {
        let shift = pass * BITS;
        let mut counts = vec![0usize; BUCKETS];
        for &(k, _) in items.iter() {
            counts[((k >> shift) as usize) & (BUCKETS - 1)] += 1;
        }
        let mut offsets = vec![0usize; BUCKETS];
        let mut acc = 0;
        for (o, &c) in offsets.iter_mut().zip(&counts) {
            *o = acc;
            acc += c;
        }
        scratch.clear();
        scratch.resize(items.len(), (0, (0, 0)));
        for &(k, c) in items.iter() {
            let bucket = ((k >> shift) as usize) & (BUCKETS - 1);
            scratch[offsets[bucket]] = (k, c);
            offsets[bucket] += 1;
        }
        std::mem::swap(items, &mut scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_mapping_preserves_integer_order() {
        let vals = [i64::MIN + 1, -5, 0, 3, i64::MAX];
        for w in vals.windows(2) {
            assert!(
                map_to_u64(&SortKey::int(w[0])) < map_to_u64(&SortKey::int(w[1])),
                "{} vs {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_u64_mapping_preserves_double_order() {
        let vals = [-1e300, -2.5, -0.0, 0.0, 1.5, 1e300];
        for w in vals.windows(2) {
            assert!(
                map_to_u64(&SortKey::fp(w[0])) <= map_to_u64(&SortKey::fp(w[1])),
                "{} vs {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_radix_sort_is_stable_and_ordered() {
        let mut items: Vec<(u64, (usize, usize))> = vec![
            (30, (0, 0)),
            (10, (0, 1)),
            (30, (0, 2)),
            (20, (0, 3)),
        ];
        radix_sort_u64(&mut items);
        let keys: Vec<u64> = items.iter().map(|&(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30, 30]);
        // equal keys keep input order
        assert_eq!(items[2].1, (0, 0));
        assert_eq!(items[3].1, (0, 2));
    }
}
