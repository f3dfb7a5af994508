//! Scalar type system and null-sentinel conventions
//!
//! Every value that flows through a kernel is normalized to a 64-bit slot:
//! integers sign-extend, floats are bit-cast (f32 widened to f64 first at the
//! expression layer), dictionary-encoded strings travel as their i32 id.
//! Nulls are inline sentinels compared in the hot path, never an external
//! validity bitmap.
//!
//! References:
//! - `HeavyDB` (2017): inline null sentinel layout for vectorized kernels

/// Element type for array columns (kept flat so `SqlType` stays `Copy`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    /// 1-byte signed integer element
    TinyInt,
    /// 2-byte signed integer element
    SmallInt,
    /// 4-byte signed integer element
    Int,
    /// 8-byte signed integer element
    BigInt,
    /// 4-byte float element
    Float,
    /// 8-byte float element
    Double,
}

/// Scalar SQL types understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    /// Boolean stored as one signed byte
    Boolean,
    /// 1-byte signed integer
    TinyInt,
    /// 2-byte signed integer
    SmallInt,
    /// 4-byte signed integer
    Int,
    /// 8-byte signed integer
    BigInt,
    /// 4-byte IEEE float
    Float,
    /// 8-byte IEEE float
    Double,
    /// Fixed-point decimal: i64 mantissa plus scale
    Decimal {
        /// Total significant digits
        precision: u8,
        /// Digits right of the point
        scale: u8,
    },
    /// Days-since-epoch date stored as i64
    Date,
    /// Seconds-since-midnight time stored as i64
    Time,
    /// Epoch timestamp stored as i64
    Timestamp,
    /// Interval in epoch units stored as i64
    Interval,
    /// Fixed-length character string
    Char(u16),
    /// Variable-length text, raw bytes
    Text,
    /// Variable-length text, dictionary-encoded as an i32 id
    DictText {
        /// Owning dictionary id
        dict_id: u32,
    },
    /// Fixed-length array of a numeric element type
    FixedArray {
        /// Element type
        elem: ElemType,
        /// Element count
        len: u32,
    },
    /// Variable-length array of a numeric element type
    VarArray {
        /// Element type
        elem: ElemType,
    },
}

impl SqlType {
    /// Logical byte width of one value, `None` for variable-length types.
    #[must_use]
    pub const fn byte_width(self) -> Option<usize> {
        match self {
            Self::Boolean | Self::TinyInt => Some(1),
            Self::SmallInt => Some(2),
            Self::Int | Self::Float | Self::DictText { .. } => Some(4),
            Self::BigInt
            | Self::Double
            | Self::Decimal { .. }
            | Self::Date
            | Self::Time
            | Self::Timestamp
            | Self::Interval => Some(8),
            Self::FixedArray { elem, len } => Some(elem_width(elem) * len as usize),
            Self::Char(_) | Self::Text | Self::VarArray { .. } => None,
        }
    }

    /// Integer-like: decoded through the fixed-width int decoder.
    #[must_use]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::Boolean
                | Self::TinyInt
                | Self::SmallInt
                | Self::Int
                | Self::BigInt
                | Self::Decimal { .. }
                | Self::Date
                | Self::Time
                | Self::Timestamp
                | Self::Interval
                | Self::DictText { .. }
        )
    }

    /// Floating-point (f32 or f64)
    #[must_use]
    pub const fn is_fp(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// String-typed (raw or dictionary-encoded)
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(self, Self::Char(_) | Self::Text | Self::DictText { .. })
    }

    /// Variable-length payload (raw text, var arrays)
    #[must_use]
    pub const fn is_varlen(self) -> bool {
        self.byte_width().is_none()
    }

    /// Fixed-point decimal
    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(self, Self::Decimal { .. })
    }
}

const fn elem_width(elem: ElemType) -> usize {
    match elem {
        ElemType::TinyInt => 1,
        ElemType::SmallInt => 2,
        ElemType::Int | ElemType::Float => 4,
        ElemType::BigInt | ElemType::Double => 8,
    }
}

/// A scalar type plus its nullability flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    /// Scalar kind
    pub ty: SqlType,
    /// Whether the column/expression may produce nulls
    pub nullable: bool,
}

impl TypeInfo {
    /// Non-nullable type
    #[must_use]
    pub const fn new(ty: SqlType) -> Self {
        Self { ty, nullable: false }
    }

    /// Nullable type
    #[must_use]
    pub const fn nullable(ty: SqlType) -> Self {
        Self { ty, nullable: true }
    }

    /// The inline null sentinel for this type, as a 64-bit slot value.
    ///
    /// Integer-like types use the minimum of their storage width; floats use
    /// the bit pattern of the type minimum. Non-nullable types still have a
    /// well-defined sentinel so keyless-hash eligibility can reason about the
    /// "empty" value.
    #[must_use]
    pub fn null_sentinel(self) -> i64 {
        if self.ty.is_fp() {
            inline_fp_null_value(self.ty)
        } else {
            inline_int_null_value(self.ty)
        }
    }
}

/// Inline null sentinel for an integer-like type, sign-extended to i64.
#[must_use]
pub fn inline_int_null_value(ty: SqlType) -> i64 {
    match ty {
        SqlType::Boolean | SqlType::TinyInt => i64::from(i8::MIN),
        SqlType::SmallInt => i64::from(i16::MIN),
        SqlType::Int | SqlType::DictText { .. } => i64::from(i32::MIN),
        _ => i64::MIN,
    }
}

/// Inline null sentinel for a floating-point type, as slot bits.
///
/// f32 columns widen to f64 at the expression layer, so both map to the
/// `f64::MIN` bit pattern in a 64-bit slot.
#[must_use]
pub fn inline_fp_null_value(ty: SqlType) -> i64 {
    match ty {
        SqlType::Float | SqlType::Double => f64::MIN.to_bits() as i64,
        _ => i64::MIN,
    }
}

/// The f32-width null sentinel used when decoding a 4-byte float column.
pub const NULL_FLOAT: f32 = f32::MIN;
/// The f64-width null sentinel.
pub const NULL_DOUBLE: f64 = f64::MIN;

/// A materialized scalar value, produced by result-set iteration
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// SQL NULL
    Null,
    /// Any integer-like value (booleans as 0/1, dates as epoch)
    Int(i64),
    /// Any floating-point value
    Double(f64),
    /// A string value (already dictionary-translated)
    Str(String),
}

impl Datum {
    /// Total order used by the comparator sort fallback; `Null` sorts
    /// according to the caller's nulls-first flag, handled at the sort site.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cmp_non_null(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Double(a), Self::Double(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Self::Int(a), Self::Double(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Self::Double(a), Self::Int(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Int(_) | Self::Double(_), Self::Str(_)) => Ordering::Less,
            (Self::Str(_), _) => Ordering::Greater,
        }
    }
}
