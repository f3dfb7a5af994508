//! Columnar exchange: result sets to Arrow record batches
//!
//! Lossless for fixed-width types (integers widen to Int64, floats to
//! Float64, decimals travel as raw mantissas); dictionary-encoded strings
//! translate through their dictionary handle into Utf8.

use super::ResultSet;
use crate::error::{Error, Result};
use crate::types::{Datum, SqlType};
use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Convert a result set to an Arrow record batch.
///
/// # Errors
/// [`Error::Exchange`] when batch assembly fails (schema/column mismatch).
pub fn to_record_batch(rs: &ResultSet) -> Result<RecordBatch> {
    let rows = rs.rows();
    let mut fields = Vec::with_capacity(rs.qmd.targets.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(rs.qmd.targets.len());

    for (t_idx, t) in rs.qmd.targets.iter().enumerate() {
        let column: Vec<&Datum> = rows.iter().map(|r| &r[t_idx]).collect();
        let (dt, array): (DataType, ArrayRef) = match t.result_type.ty {
            SqlType::Boolean => {
                let vals: Vec<Option<bool>> = column
                    .iter()
                    .map(|d| match d {
                        Datum::Int(v) => Some(*v != 0),
                        _ => None,
                    })
                    .collect();
                (DataType::Boolean, Arc::new(BooleanArray::from(vals)))
            }
            SqlType::Float | SqlType::Double => {
                let vals: Vec<Option<f64>> = column
                    .iter()
                    .map(|d| match d {
                        Datum::Double(v) => Some(*v),
                        #[allow(clippy::cast_precision_loss)]
                        Datum::Int(v) => Some(*v as f64),
                        _ => None,
                    })
                    .collect();
                (DataType::Float64, Arc::new(Float64Array::from(vals)))
            }
            SqlType::Char(_) | SqlType::Text | SqlType::DictText { .. } => {
                let vals: Vec<Option<&str>> = column
                    .iter()
                    .map(|d| match d {
                        Datum::Str(s) => Some(s.as_str()),
                        _ => None,
                    })
                    .collect();
                (DataType::Utf8, Arc::new(StringArray::from(vals)))
            }
            _ => {
                let vals: Vec<Option<i64>> = column
                    .iter()
                    .map(|d| match d {
                        Datum::Int(v) => Some(*v),
                        _ => None,
                    })
                    .collect();
                (DataType::Int64, Arc::new(Int64Array::from(vals)))
            }
        };
        fields.push(Field::new(t.name.as_str(), dt, true));
        columns.push(array);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| Error::Exchange(format!("failed to assemble record batch: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::QueryMemoryDescriptor;
    use crate::ir::Expr;
    use crate::plan::{ExecutionUnit, Target};
    use crate::result::OutputBuffer;
    use crate::storage::{ColumnBuffer, Fragment, TableData};
    use crate::types::TypeInfo;
    use crate::SystemConfig;
    use std::collections::HashMap;

    #[test]
    fn test_projection_round_trips_to_int64() {
        let ty = TypeInfo::new(SqlType::Int);
        let values = [7i64, -3, 12];
        let col = ColumnBuffer::from_i64s(ty, &values);
        let table = TableData::new(1, vec![ty], vec![Fragment::new(0, vec![col])]);
        let unit = ExecutionUnit::scan(1)
            .with_target(Target::projected("x", Expr::col(0, 0, ty)));
        let qmd = Arc::new(
            QueryMemoryDescriptor::choose(&unit, &[&table], &SystemConfig::default(), 1 << 26)
                .unwrap(),
        );

        let mut buf = OutputBuffer::new(&qmd);
        for (i, &v) in values.iter().enumerate() {
            let idx = buf.slot_index(&qmd, i, 0);
            buf.data[idx] = v;
        }
        buf.matched = values.len() as u64;

        let rs = ResultSet::new(qmd, vec![buf], HashMap::new());
        let batch = to_record_batch(&rs).unwrap();
        assert_eq!(batch.num_rows(), 3);
        let out = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(out.values(), &values[..]);
    }
}
