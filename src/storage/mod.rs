//! Columnar storage adapter
//!
//! A view over immutable columnar fragments: fragment id, row count,
//! per-column buffers with an encoding descriptor, and per-column min/max
//! metadata the dispatcher uses for predicate skipping. Queries take pinned
//! views through the buffer pool; the adapter itself owns the bytes.

pub mod dictionary;

use crate::runtime;
use crate::types::{SqlType, TypeInfo};
use dictionary::StringDictionary;
use std::collections::HashMap;
use std::sync::Arc;

/// Fragment identity within a table
pub type FragmentId = u32;

/// Physical encoding of a column buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Little-endian fixed-width values
    FixedWidth {
        /// Bytes per value: 1, 2, 4 or 8
        byte_width: usize,
    },
    /// Delta from a fragment-level baseline, fixed-width deltas
    DiffFixedWidth {
        /// Bytes per delta
        byte_width: usize,
        /// Baseline added to every decoded delta
        baseline: i64,
    },
    /// Dictionary-encoded string ids, 4 bytes each
    DictionaryId,
}

impl Encoding {
    /// Bytes per stored value.
    #[must_use]
    pub const fn byte_width(self) -> usize {
        match self {
            Self::FixedWidth { byte_width } | Self::DiffFixedWidth { byte_width, .. } => {
                byte_width
            }
            Self::DictionaryId => 4,
        }
    }
}

/// A contiguous, immutable column byte region plus its encoding.
///
/// Decoding is a pure function from (buffer, row index) to a scalar; the
/// fixed-width decoders in [`crate::runtime`] do the byte work.
#[derive(Debug, Clone)]
pub struct ColumnBuffer {
    /// Column type
    pub ty: TypeInfo,
    /// Physical encoding
    pub encoding: Encoding,
    /// Raw bytes, shared with the buffer pool's zero-copy path
    pub data: Arc<Vec<u8>>,
}

impl ColumnBuffer {
    /// Encode integer-like values (nulls already sentinel-mapped) at the
    /// type's storage width.
    #[must_use]
    pub fn from_i64s(ty: TypeInfo, values: &[i64]) -> Self {
        let byte_width = ty.ty.byte_width().unwrap_or(8);
        let mut data = Vec::with_capacity(values.len() * byte_width);
        for &v in values {
            match byte_width {
                1 => data.extend_from_slice(&(v as i8).to_le_bytes()),
                2 => data.extend_from_slice(&(v as i16).to_le_bytes()),
                4 => data.extend_from_slice(&(v as i32).to_le_bytes()),
                _ => data.extend_from_slice(&v.to_le_bytes()),
            }
        }
        let encoding = if matches!(ty.ty, SqlType::DictText { .. }) {
            Encoding::DictionaryId
        } else {
            Encoding::FixedWidth { byte_width }
        };
        Self {
            ty,
            encoding,
            data: Arc::new(data),
        }
    }

    /// Encode nullable integers, substituting the type's null sentinel.
    #[must_use]
    pub fn from_opt_i64s(ty: TypeInfo, values: &[Option<i64>]) -> Self {
        let sentinel = ty.null_sentinel();
        let mapped: Vec<i64> = values.iter().map(|v| v.unwrap_or(sentinel)).collect();
        Self::from_i64s(ty, &mapped)
    }

    /// Encode doubles.
    #[must_use]
    pub fn from_f64s(ty: TypeInfo, values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for &v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            ty,
            encoding: Encoding::FixedWidth { byte_width: 8 },
            data: Arc::new(data),
        }
    }

    /// Encode 4-byte floats.
    #[must_use]
    pub fn from_f32s(ty: TypeInfo, values: &[f32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for &v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            ty,
            encoding: Encoding::FixedWidth { byte_width: 4 },
            data: Arc::new(data),
        }
    }

    /// Decode row `pos` as a sign-extended i64.
    #[must_use]
    pub fn decode_int(&self, pos: usize) -> i64 {
        match self.encoding {
            Encoding::FixedWidth { byte_width } => {
                runtime::decode_fixed_width_int(&self.data, byte_width, pos)
            }
            Encoding::DiffFixedWidth {
                byte_width,
                baseline,
            } => runtime::decode_diff(&self.data, byte_width, baseline, pos),
            Encoding::DictionaryId => runtime::decode_fixed_width_int(&self.data, 4, pos),
        }
    }

    /// Decode row `pos` as an f64 (f32 storage widens, null sentinel maps).
    #[must_use]
    pub fn decode_fp(&self, pos: usize) -> f64 {
        match self.ty.ty {
            SqlType::Float => {
                let v = runtime::decode_float(&self.data, pos);
                if v == crate::types::NULL_FLOAT {
                    crate::types::NULL_DOUBLE
                } else {
                    f64::from(v)
                }
            }
            _ => runtime::decode_double(&self.data, pos),
        }
    }

    /// Stored rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.data.len() / self.encoding.byte_width()
    }
}

/// Per-column min/max metadata for predicate skipping. Tracked for
/// integer-like columns; floats opt out of skipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnStats {
    /// Minimum non-null value
    pub min: i64,
    /// Maximum non-null value
    pub max: i64,
    /// Whether any null sentinel appears
    pub has_nulls: bool,
}

impl ColumnStats {
    /// Compute stats over sentinel-mapped values.
    #[must_use]
    pub fn compute(values: &[i64], null_sentinel: i64) -> Self {
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        let mut has_nulls = false;
        for &v in values {
            if v == null_sentinel {
                has_nulls = true;
            } else {
                min = min.min(v);
                max = max.max(v);
            }
        }
        if min > max {
            // all-null column; collapse to an empty range
            min = 0;
            max = -1;
        }
        Self { min, max, has_nulls }
    }
}

/// A horizontal slice of a table, immutable for the query's lifetime.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Fragment id, unique within its table
    pub id: FragmentId,
    /// Row count
    pub row_count: usize,
    /// Per-column buffers, schema order
    pub columns: Vec<ColumnBuffer>,
    /// Per-column stats, `None` for columns without skip metadata
    pub stats: Vec<Option<ColumnStats>>,
}

impl Fragment {
    /// Assemble a fragment, computing stats for integer-like columns.
    #[must_use]
    pub fn new(id: FragmentId, columns: Vec<ColumnBuffer>) -> Self {
        let row_count = columns.first().map_or(0, ColumnBuffer::row_count);
        let stats = columns
            .iter()
            .map(|c| {
                c.ty.ty.is_integral().then(|| {
                    let sentinel = c.ty.null_sentinel();
                    let values: Vec<i64> = (0..c.row_count()).map(|i| c.decode_int(i)).collect();
                    ColumnStats::compute(&values, sentinel)
                })
            })
            .collect();
        Self {
            id,
            row_count,
            columns,
            stats,
        }
    }
}

/// One table: schema, fragments, and per-column dictionaries.
#[derive(Debug, Clone)]
pub struct TableData {
    /// Table id
    pub id: crate::plan::TableId,
    /// Column types, defining the per-fragment column order
    pub schema: Vec<TypeInfo>,
    /// Fragments in scan order
    pub fragments: Vec<Arc<Fragment>>,
    /// Dictionaries for dictionary-encoded columns, by column index
    pub dictionaries: HashMap<usize, Arc<StringDictionary>>,
}

impl TableData {
    /// Table with one or more fragments.
    #[must_use]
    pub fn new(id: crate::plan::TableId, schema: Vec<TypeInfo>, fragments: Vec<Fragment>) -> Self {
        Self {
            id,
            schema,
            fragments: fragments.into_iter().map(Arc::new).collect(),
            dictionaries: HashMap::new(),
        }
    }

    /// Attach a dictionary to a column.
    #[must_use]
    pub fn with_dictionary(mut self, column: usize, dict: Arc<StringDictionary>) -> Self {
        self.dictionaries.insert(column, dict);
        self
    }

    /// Total row count across fragments.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.fragments.iter().map(|f| f.row_count).sum()
    }
}

/// The in-memory schema + data provider handed to the dispatcher.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<crate::plan::TableId, TableData>,
}

impl Catalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table.
    pub fn add_table(&mut self, table: TableData) {
        self.tables.insert(table.id, table);
    }

    /// Look up a table.
    #[must_use]
    pub fn table(&self, id: crate::plan::TableId) -> Option<&TableData> {
        self.tables.get(&id)
    }

    /// Zero-copy fetch of one column chunk's bytes, keyed
    /// (table, column, fragment). This is the data-provider contract the
    /// buffer pool's disk tier consumes.
    #[must_use]
    pub fn fetch_chunk(
        &self,
        table: crate::plan::TableId,
        column: usize,
        fragment: FragmentId,
    ) -> Option<Arc<Vec<u8>>> {
        let t = self.tables.get(&table)?;
        let f = t.fragments.iter().find(|f| f.id == fragment)?;
        f.columns.get(column).map(|c| Arc::clone(&c.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_round_trip_narrow_widths() {
        let col = ColumnBuffer::from_i64s(TypeInfo::new(SqlType::SmallInt), &[-300, 0, 299]);
        assert_eq!(col.decode_int(0), -300);
        assert_eq!(col.decode_int(2), 299);
        assert_eq!(col.row_count(), 3);
    }

    #[test]
    fn test_nullable_column_uses_sentinel() {
        let ty = TypeInfo::nullable(SqlType::Int);
        let col = ColumnBuffer::from_opt_i64s(ty, &[Some(5), None, Some(7)]);
        assert_eq!(col.decode_int(1), ty.null_sentinel());
    }

    #[test]
    fn test_float_column_widens_and_maps_null() {
        let ty = TypeInfo::nullable(SqlType::Float);
        let col = ColumnBuffer::from_f32s(ty, &[1.5, crate::types::NULL_FLOAT]);
        assert!((col.decode_fp(0) - 1.5).abs() < f64::EPSILON);
        assert_eq!(col.decode_fp(1), crate::types::NULL_DOUBLE);
    }

    #[test]
    fn test_diff_encoding_decodes_through_baseline() {
        let col = ColumnBuffer {
            ty: TypeInfo::new(SqlType::BigInt),
            encoding: Encoding::DiffFixedWidth {
                byte_width: 2,
                baseline: 100_000,
            },
            data: Arc::new(
                [-5i16, 0, 5]
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
            ),
        };
        assert_eq!(col.decode_int(0), 99_995);
        assert_eq!(col.decode_int(2), 100_005);
    }

    #[test]
    fn test_fragment_stats_skip_nulls() {
        let ty = TypeInfo::nullable(SqlType::Int);
        let col = ColumnBuffer::from_opt_i64s(ty, &[Some(3), None, Some(9), Some(-2)]);
        let frag = Fragment::new(0, vec![col]);
        let stats = frag.stats[0].unwrap();
        assert_eq!(stats.min, -2);
        assert_eq!(stats.max, 9);
        assert!(stats.has_nulls);
    }

    #[test]
    fn test_catalog_chunk_fetch() {
        let ty = TypeInfo::new(SqlType::Int);
        let col = ColumnBuffer::from_i64s(ty, &[1, 2, 3]);
        let table = TableData::new(7, vec![ty], vec![Fragment::new(0, vec![col])]);
        let mut catalog = Catalog::new();
        catalog.add_table(table);

        assert!(catalog.fetch_chunk(7, 0, 0).is_some());
        assert!(catalog.fetch_chunk(7, 1, 0).is_none());
        assert!(catalog.fetch_chunk(8, 0, 0).is_none());
        assert_eq!(catalog.table(7).unwrap().row_count(), 3);
    }
}
