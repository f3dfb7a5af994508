//! Runtime intrinsic library
//!
//! The flat function surface that generated row functions call: fixed-width
//! decoders, null-aware arithmetic and comparisons, decimal scaling,
//! aggregate-slot updates, and error-code recording. Null propagation is
//! sentinel comparison in-line, with no validity bitmaps in the hot path. The
//! same contracts are emitted as WGSL source for the GPU variant (see
//! `crate::codegen::wgsl`), which carries the 32-bit renditions.
//!
//! Per-row failures never unwind: they are recorded as persistent `i32`
//! codes in the kernel's error-code slot and surfaced after the kernel
//! completes.
//!
//! References:
//! - `HeavyDB` (2017): runtime function library linked into JIT'd kernels
//! - Neumann (2011): compiled query execution

pub mod distinct;
pub mod groupby;
pub mod hll;
pub mod join;

use std::sync::atomic::{AtomicBool, Ordering};

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// No error
pub const ERR_NONE: i32 = 0;
/// Division by zero
pub const ERR_DIV_BY_ZERO: i32 = 1;
/// Integer overflow or underflow
pub const ERR_OVERFLOW_OR_UNDERFLOW: i32 = 2;
/// Group-by buffer out of slots
pub const ERR_OUT_OF_SLOTS: i32 = 3;
/// Watchdog interrupt tripped
pub const ERR_INTERRUPTED: i32 = 4;
/// SINGLE_VALUE aggregate saw multiple distinct values
pub const ERR_SINGLE_VALUE_FOUND_MULTIPLE_VALUES: i32 = 15;

/// Record an error code into a kernel's error slot. Codes > 0 are persistent:
/// once set, later codes never overwrite them (including later errors: the
/// first failure wins).
#[inline]
pub fn record_error_code(code: i32, error_slot: &mut i32) {
    if *error_slot == ERR_NONE {
        *error_slot = code;
    }
}

// ---------------------------------------------------------------------------
// Interrupt flag
// ---------------------------------------------------------------------------

static INTERRUPT: AtomicBool = AtomicBool::new(false);

/// Raise or clear the process-wide interrupt flag.
pub fn set_interrupt(on: bool) {
    INTERRUPT.store(on, Ordering::SeqCst);
}

/// Poll the process-wide interrupt flag. Called by row functions every
/// [`INTERRUPT_CHECK_MASK`]+1 rows and inside long probe loops.
#[inline]
#[must_use]
pub fn check_interrupt() -> bool {
    INTERRUPT.load(Ordering::Relaxed)
}

/// Row functions poll the interrupt flag when `row_index & MASK == 0`.
pub const INTERRUPT_CHECK_MASK: u64 = 0xFFFF;

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

/// Decode a fixed-width signed integer from a column buffer.
///
/// `byte_width` must be 1, 2, 4 or 8; values sign-extend to i64.
#[inline]
#[must_use]
pub fn decode_fixed_width_int(bytes: &[u8], byte_width: usize, pos: usize) -> i64 {
    let off = pos * byte_width;
    match byte_width {
        1 => i64::from(bytes[off] as i8),
        2 => i64::from(i16::from_le_bytes([bytes[off], bytes[off + 1]])),
        4 => i64::from(i32::from_le_bytes([
            bytes[off],
            bytes[off + 1],
            bytes[off + 2],
            bytes[off + 3],
        ])),
        8 => i64::from_le_bytes([
            bytes[off],
            bytes[off + 1],
            bytes[off + 2],
            bytes[off + 3],
            bytes[off + 4],
            bytes[off + 5],
            bytes[off + 6],
            bytes[off + 7],
        ]),
        _ => i64::MIN + 1,
    }
}

/// Decode a delta-encoded fixed-width integer: stored value + baseline.
#[inline]
#[must_use]
pub fn decode_diff(bytes: &[u8], byte_width: usize, baseline: i64, pos: usize) -> i64 {
    decode_fixed_width_int(bytes, byte_width, pos).wrapping_add(baseline)
}

/// Decode a 4-byte float.
#[inline]
#[must_use]
pub fn decode_float(bytes: &[u8], pos: usize) -> f32 {
    let off = pos * 4;
    f32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

/// Decode an 8-byte double.
#[inline]
#[must_use]
pub fn decode_double(bytes: &[u8], pos: usize) -> f64 {
    let off = pos * 8;
    f64::from_le_bytes([
        bytes[off],
        bytes[off + 1],
        bytes[off + 2],
        bytes[off + 3],
        bytes[off + 4],
        bytes[off + 5],
        bytes[off + 6],
        bytes[off + 7],
    ])
}

// ---------------------------------------------------------------------------
// Null-aware arithmetic
//
// Three variants per operator: both-nullable, lhs-nullable, rhs-nullable.
// The null sentinel is an argument, so one i64 family serves every integer
// width (narrower columns pass their own sentinel). Wrapping semantics;
// overflow detection lives in the checked aggregate/division paths.
// ---------------------------------------------------------------------------

macro_rules! def_arith_nullable_i64 {
    ($name:ident, $name_lhs:ident, $name_rhs:ident, $op:ident) => {
        /// Both operands nullable.
        #[inline]
        #[must_use]
        pub fn $name(lhs: i64, rhs: i64, null_val: i64) -> i64 {
            if lhs == null_val || rhs == null_val {
                null_val
            } else {
                lhs.$op(rhs)
            }
        }

        /// Only the left operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_lhs(lhs: i64, rhs: i64, null_val: i64) -> i64 {
            if lhs == null_val {
                null_val
            } else {
                lhs.$op(rhs)
            }
        }

        /// Only the right operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_rhs(lhs: i64, rhs: i64, null_val: i64) -> i64 {
            if rhs == null_val {
                null_val
            } else {
                lhs.$op(rhs)
            }
        }
    };
}

def_arith_nullable_i64!(add_i64_nullable, add_i64_nullable_lhs, add_i64_nullable_rhs, wrapping_add);
def_arith_nullable_i64!(sub_i64_nullable, sub_i64_nullable_lhs, sub_i64_nullable_rhs, wrapping_sub);
def_arith_nullable_i64!(mul_i64_nullable, mul_i64_nullable_lhs, mul_i64_nullable_rhs, wrapping_mul);

/// Nullable integer division. The caller must have guarded `rhs != 0`; the
/// generated row function records [`ERR_DIV_BY_ZERO`] before reaching here.
#[inline]
#[must_use]
pub fn div_i64_nullable(lhs: i64, rhs: i64, null_val: i64) -> i64 {
    if lhs == null_val || rhs == null_val {
        null_val
    } else {
        lhs.wrapping_div(rhs)
    }
}

/// Nullable integer modulus; caller guards `rhs != 0`.
#[inline]
#[must_use]
pub fn mod_i64_nullable(lhs: i64, rhs: i64, null_val: i64) -> i64 {
    if lhs == null_val || rhs == null_val {
        null_val
    } else {
        lhs.wrapping_rem(rhs)
    }
}

macro_rules! def_cmp_nullable_i64 {
    ($name:ident, $name_lhs:ident, $name_rhs:ident, $op:tt) => {
        /// Both operands nullable; returns 0/1 or the boolean null sentinel.
        #[inline]
        #[must_use]
        pub fn $name(lhs: i64, rhs: i64, null_val: i64, null_bool_val: i64) -> i64 {
            if lhs == null_val || rhs == null_val {
                null_bool_val
            } else {
                i64::from(lhs $op rhs)
            }
        }

        /// Only the left operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_lhs(lhs: i64, rhs: i64, null_val: i64, null_bool_val: i64) -> i64 {
            if lhs == null_val {
                null_bool_val
            } else {
                i64::from(lhs $op rhs)
            }
        }

        /// Only the right operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_rhs(lhs: i64, rhs: i64, null_val: i64, null_bool_val: i64) -> i64 {
            if rhs == null_val {
                null_bool_val
            } else {
                i64::from(lhs $op rhs)
            }
        }
    };
}

def_cmp_nullable_i64!(eq_i64_nullable, eq_i64_nullable_lhs, eq_i64_nullable_rhs, ==);
def_cmp_nullable_i64!(ne_i64_nullable, ne_i64_nullable_lhs, ne_i64_nullable_rhs, !=);
def_cmp_nullable_i64!(lt_i64_nullable, lt_i64_nullable_lhs, lt_i64_nullable_rhs, <);
def_cmp_nullable_i64!(le_i64_nullable, le_i64_nullable_lhs, le_i64_nullable_rhs, <=);
def_cmp_nullable_i64!(gt_i64_nullable, gt_i64_nullable_lhs, gt_i64_nullable_rhs, >);
def_cmp_nullable_i64!(ge_i64_nullable, ge_i64_nullable_lhs, ge_i64_nullable_rhs, >=);

macro_rules! def_arith_nullable_f64 {
    ($name:ident, $name_lhs:ident, $name_rhs:ident, $op:tt) => {
        /// Both operands nullable. The sentinel compares exactly; arithmetic
        /// on real values can never produce it because it is the type
        /// minimum.
        #[inline]
        #[must_use]
        pub fn $name(lhs: f64, rhs: f64, null_val: f64) -> f64 {
            if lhs == null_val || rhs == null_val {
                null_val
            } else {
                lhs $op rhs
            }
        }

        /// Only the left operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_lhs(lhs: f64, rhs: f64, null_val: f64) -> f64 {
            if lhs == null_val {
                null_val
            } else {
                lhs $op rhs
            }
        }

        /// Only the right operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_rhs(lhs: f64, rhs: f64, null_val: f64) -> f64 {
            if rhs == null_val {
                null_val
            } else {
                lhs $op rhs
            }
        }
    };
}

def_arith_nullable_f64!(add_f64_nullable, add_f64_nullable_lhs, add_f64_nullable_rhs, +);
def_arith_nullable_f64!(sub_f64_nullable, sub_f64_nullable_lhs, sub_f64_nullable_rhs, -);
def_arith_nullable_f64!(mul_f64_nullable, mul_f64_nullable_lhs, mul_f64_nullable_rhs, *);
def_arith_nullable_f64!(div_f64_nullable, div_f64_nullable_lhs, div_f64_nullable_rhs, /);

macro_rules! def_cmp_nullable_f64 {
    ($name:ident, $name_lhs:ident, $name_rhs:ident, $op:tt) => {
        /// Both operands nullable; returns 0/1 or the boolean null sentinel.
        #[inline]
        #[must_use]
        pub fn $name(lhs: f64, rhs: f64, null_val: f64, null_bool_val: i64) -> i64 {
            if lhs == null_val || rhs == null_val {
                null_bool_val
            } else {
                i64::from(lhs $op rhs)
            }
        }

        /// Only the left operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_lhs(lhs: f64, rhs: f64, null_val: f64, null_bool_val: i64) -> i64 {
            if lhs == null_val {
                null_bool_val
            } else {
                i64::from(lhs $op rhs)
            }
        }

        /// Only the right operand may be null.
        #[inline]
        #[must_use]
        pub fn $name_rhs(lhs: f64, rhs: f64, null_val: f64, null_bool_val: i64) -> i64 {
            if rhs == null_val {
                null_bool_val
            } else {
                i64::from(lhs $op rhs)
            }
        }
    };
}

def_cmp_nullable_f64!(eq_f64_nullable, eq_f64_nullable_lhs, eq_f64_nullable_rhs, ==);
def_cmp_nullable_f64!(ne_f64_nullable, ne_f64_nullable_lhs, ne_f64_nullable_rhs, !=);
def_cmp_nullable_f64!(lt_f64_nullable, lt_f64_nullable_lhs, lt_f64_nullable_rhs, <);
def_cmp_nullable_f64!(le_f64_nullable, le_f64_nullable_lhs, le_f64_nullable_rhs, <=);
def_cmp_nullable_f64!(gt_f64_nullable, gt_f64_nullable_lhs, gt_f64_nullable_rhs, >);
def_cmp_nullable_f64!(ge_f64_nullable, ge_f64_nullable_lhs, ge_f64_nullable_rhs, >=);

/// Safe infinite division: ±inf on an exact zero divisor, null on 0/0.
#[inline]
#[must_use]
pub fn safe_inf_div_f64(lhs: f64, rhs: f64, null_val: f64) -> f64 {
    if lhs == null_val || rhs == null_val {
        return null_val;
    }
    if rhs == 0.0 {
        if lhs == 0.0 {
            return null_val;
        }
        return if lhs > 0.0 {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
    }
    lhs / rhs
}

// ---------------------------------------------------------------------------
// Decimal scaling
//
// Rounding is half-away-from-zero; the null sentinel passes through.
// ---------------------------------------------------------------------------

/// Multiply a decimal mantissa by a power-of-ten scale factor.
#[inline]
#[must_use]
pub fn scale_decimal_up(val: i64, scale: i64, null_val: i64) -> i64 {
    if val == null_val {
        null_val
    } else {
        val.wrapping_mul(scale)
    }
}

/// Divide a decimal mantissa by a power-of-ten scale factor, rounding half
/// away from zero.
#[inline]
#[must_use]
pub fn scale_decimal_down(val: i64, scale: i64, null_val: i64) -> i64 {
    if val == null_val {
        return null_val;
    }
    let half = scale / 2;
    if val >= 0 {
        (val + half) / scale
    } else {
        (val - half) / scale
    }
}

/// Floor to a scale boundary: largest multiple of `scale` ≤ `val`.
#[inline]
#[must_use]
pub fn decimal_floor(val: i64, scale: i64, null_val: i64) -> i64 {
    if val == null_val {
        return null_val;
    }
    if val >= 0 {
        (val / scale) * scale
    } else if val % scale == 0 {
        val
    } else {
        (val / scale - 1) * scale
    }
}

/// Ceil to a scale boundary: smallest multiple of `scale` ≥ `val`.
#[inline]
#[must_use]
pub fn decimal_ceil(val: i64, scale: i64, null_val: i64) -> i64 {
    if val == null_val {
        return null_val;
    }
    let floored = decimal_floor(val, scale, null_val);
    if floored == val {
        val
    } else {
        floored + scale
    }
}

// ---------------------------------------------------------------------------
// Aggregate-slot updates
//
// Slots are 64-bit; floating-point aggregators reinterpret the slot bits.
// On CPU a slot is owned by exactly one thread, so no atomics here; the GPU
// renditions (`agg_*_shared` in generated WGSL) use shared memory + atomics.
// The `_skip_val` variants implement null-transparent aggregation: slots
// initialize to the skip value and the first real update replaces it.
// ---------------------------------------------------------------------------

/// COUNT: increments, ignores the value.
#[inline]
pub fn agg_count(slot: &mut i64, _val: i64) {
    *slot += 1;
}

/// COUNT with null skipping.
#[inline]
pub fn agg_count_skip_val(slot: &mut i64, val: i64, skip_val: i64) {
    if val != skip_val {
        agg_count(slot, val);
    }
}

/// SUM with overflow detection. Returns an error code, [`ERR_NONE`] on
/// success; the slot is unchanged on overflow.
#[inline]
#[must_use]
pub fn agg_sum(slot: &mut i64, val: i64) -> i32 {
    match slot.checked_add(val) {
        Some(v) => {
            *slot = v;
            ERR_NONE
        }
        None => ERR_OVERFLOW_OR_UNDERFLOW,
    }
}

/// SUM with null skipping: a slot still holding the skip value is replaced
/// rather than added to, so an all-null group stays null.
#[inline]
#[must_use]
pub fn agg_sum_skip_val(slot: &mut i64, val: i64, skip_val: i64) -> i32 {
    if val == skip_val {
        return ERR_NONE;
    }
    if *slot == skip_val {
        *slot = val;
        ERR_NONE
    } else {
        agg_sum(slot, val)
    }
}

/// MIN
#[inline]
pub fn agg_min(slot: &mut i64, val: i64) {
    *slot = (*slot).min(val);
}

/// MIN with null skipping.
#[inline]
pub fn agg_min_skip_val(slot: &mut i64, val: i64, skip_val: i64) {
    if val != skip_val {
        *slot = if *slot == skip_val { val } else { (*slot).min(val) };
    }
}

/// MAX
#[inline]
pub fn agg_max(slot: &mut i64, val: i64) {
    *slot = (*slot).max(val);
}

/// MAX with null skipping.
#[inline]
pub fn agg_max_skip_val(slot: &mut i64, val: i64, skip_val: i64) {
    if val != skip_val {
        *slot = if *slot == skip_val { val } else { (*slot).max(val) };
    }
}

/// ID / SAMPLE: unconditional overwrite (first write wins is enforced by the
/// generated write-once diamond, not here).
#[inline]
pub fn agg_id(slot: &mut i64, val: i64) {
    *slot = val;
}

/// SINGLE_VALUE: like [`agg_id`] but a second distinct value is an error.
/// `empty_val` is the slot's initialization sentinel.
#[inline]
#[must_use]
pub fn agg_single_value(slot: &mut i64, val: i64, empty_val: i64) -> i32 {
    if *slot == empty_val {
        *slot = val;
        ERR_NONE
    } else if *slot == val {
        ERR_NONE
    } else {
        ERR_SINGLE_VALUE_FOUND_MULTIPLE_VALUES
    }
}

/// SUM over doubles, slot bits reinterpreted.
#[inline]
pub fn agg_sum_double(slot: &mut i64, val: f64) {
    let cur = f64::from_bits(*slot as u64);
    *slot = (cur + val).to_bits() as i64;
}

/// SUM over doubles with null skipping.
#[inline]
pub fn agg_sum_double_skip_val(slot: &mut i64, val: f64, skip_val: f64) {
    if val != skip_val {
        let cur = f64::from_bits(*slot as u64);
        if cur == skip_val {
            *slot = val.to_bits() as i64;
        } else {
            *slot = (cur + val).to_bits() as i64;
        }
    }
}

/// MIN over doubles.
#[inline]
pub fn agg_min_double(slot: &mut i64, val: f64) {
    let cur = f64::from_bits(*slot as u64);
    *slot = cur.min(val).to_bits() as i64;
}

/// MIN over doubles with null skipping.
#[inline]
pub fn agg_min_double_skip_val(slot: &mut i64, val: f64, skip_val: f64) {
    if val != skip_val {
        let cur = f64::from_bits(*slot as u64);
        *slot = if cur == skip_val {
            val.to_bits() as i64
        } else {
            cur.min(val).to_bits() as i64
        };
    }
}

/// MAX over doubles.
#[inline]
pub fn agg_max_double(slot: &mut i64, val: f64) {
    let cur = f64::from_bits(*slot as u64);
    *slot = cur.max(val).to_bits() as i64;
}

/// MAX over doubles with null skipping.
#[inline]
pub fn agg_max_double_skip_val(slot: &mut i64, val: f64, skip_val: f64) {
    if val != skip_val {
        let cur = f64::from_bits(*slot as u64);
        *slot = if cur == skip_val {
            val.to_bits() as i64
        } else {
            cur.max(val).to_bits() as i64
        };
    }
}

/// ID over doubles.
#[inline]
pub fn agg_id_double(slot: &mut i64, val: f64) {
    *slot = val.to_bits() as i64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{inline_int_null_value, SqlType};

    #[test]
    fn test_decode_fixed_width_sign_extension() {
        let bytes_1 = [0xFFu8];
        assert_eq!(decode_fixed_width_int(&bytes_1, 1, 0), -1);

        let bytes_2 = (-300i16).to_le_bytes();
        assert_eq!(decode_fixed_width_int(&bytes_2, 2, 0), -300);

        let bytes_4 = (i32::MIN).to_le_bytes();
        assert_eq!(decode_fixed_width_int(&bytes_4, 4, 0), i64::from(i32::MIN));

        let bytes_8 = (1i64 << 40).to_le_bytes();
        assert_eq!(decode_fixed_width_int(&bytes_8, 8, 0), 1i64 << 40);
    }

    #[test]
    fn test_decode_diff_applies_baseline() {
        let bytes = [5u8, 250u8];
        assert_eq!(decode_diff(&bytes, 1, 1000, 0), 1005);
        assert_eq!(decode_diff(&bytes, 1, 1000, 1), 994); // 250 as i8 = -6
    }

    #[test]
    fn test_decode_floats() {
        let f = 3.5f32.to_le_bytes();
        assert!((decode_float(&f, 0) - 3.5).abs() < f32::EPSILON);
        let d = (-2.25f64).to_le_bytes();
        assert!((decode_double(&d, 0) + 2.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_null_propagation_both_nullable() {
        let null = inline_int_null_value(SqlType::Int);
        assert_eq!(add_i64_nullable(null, 3, null), null);
        assert_eq!(add_i64_nullable(3, null, null), null);
        assert_eq!(add_i64_nullable(3, 4, null), 7);
    }

    #[test]
    fn test_null_propagation_one_sided_variants() {
        let null = inline_int_null_value(SqlType::BigInt);
        // lhs variant only inspects the left side
        assert_eq!(add_i64_nullable_lhs(null, 3, null), null);
        assert_eq!(mul_i64_nullable_rhs(2, null, null), null);
        // the restricted variant does not null-check the other side
        assert_eq!(sub_i64_nullable_rhs(10, 4, null), 6);
    }

    #[test]
    fn test_cmp_nullable_returns_bool_sentinel() {
        let null = inline_int_null_value(SqlType::Int);
        let null_bool = inline_int_null_value(SqlType::Boolean);
        assert_eq!(lt_i64_nullable(null, 3, null, null_bool), null_bool);
        assert_eq!(lt_i64_nullable(2, 3, null, null_bool), 1);
        assert_eq!(ge_i64_nullable(2, 3, null, null_bool), 0);
    }

    #[test]
    fn test_safe_inf_div() {
        let null = f64::MIN;
        assert_eq!(safe_inf_div_f64(4.0, 2.0, null), 2.0);
        assert_eq!(safe_inf_div_f64(1.0, 0.0, null), f64::INFINITY);
        assert_eq!(safe_inf_div_f64(-1.0, 0.0, null), f64::NEG_INFINITY);
        assert_eq!(safe_inf_div_f64(0.0, 0.0, null), null);
        assert_eq!(safe_inf_div_f64(null, 2.0, null), null);
    }

    #[test]
    fn test_scale_decimal_down_rounds_half_away_from_zero() {
        let null = i64::MIN;
        assert_eq!(scale_decimal_down(150, 100, null), 2);
        assert_eq!(scale_decimal_down(149, 100, null), 1);
        assert_eq!(scale_decimal_down(-150, 100, null), -2);
        assert_eq!(scale_decimal_down(-149, 100, null), -1);
        assert_eq!(scale_decimal_down(null, 100, null), null);
    }

    #[test]
    fn test_decimal_ceil_floor_difference_is_zero_or_scale() {
        let null = i64::MIN;
        for val in [-250i64, -200, -1, 0, 1, 99, 100, 101, 250] {
            let diff =
                decimal_ceil(val, 100, null) - decimal_floor(val, 100, null);
            assert!(
                diff == 0 || diff == 100,
                "val={val} diff={diff}"
            );
        }
    }

    #[test]
    fn test_agg_sum_overflow_leaves_slot_unchanged() {
        let mut slot = i64::MAX - 1;
        assert_eq!(agg_sum(&mut slot, 10), ERR_OVERFLOW_OR_UNDERFLOW);
        assert_eq!(slot, i64::MAX - 1);
    }

    #[test]
    fn test_agg_sum_skip_val_replaces_sentinel() {
        let null = inline_int_null_value(SqlType::Int);
        let mut slot = null;
        assert_eq!(agg_sum_skip_val(&mut slot, null, null), ERR_NONE);
        assert_eq!(slot, null, "all-null group stays null");
        assert_eq!(agg_sum_skip_val(&mut slot, 10, null), ERR_NONE);
        assert_eq!(slot, 10);
        assert_eq!(agg_sum_skip_val(&mut slot, 20, null), ERR_NONE);
        assert_eq!(slot, 30);
    }

    #[test]
    fn test_agg_count_skip_val_counts_non_null_only() {
        let null = inline_int_null_value(SqlType::Int);
        let mut slot = 0i64;
        for v in [10, null, 20, null, 30] {
            agg_count_skip_val(&mut slot, v, null);
        }
        assert_eq!(slot, 3);
    }

    #[test]
    fn test_agg_min_max_skip_val() {
        let null = inline_int_null_value(SqlType::BigInt);
        let mut mn = null;
        let mut mx = null;
        for v in [5i64, null, 2, 8] {
            agg_min_skip_val(&mut mn, v, null);
            agg_max_skip_val(&mut mx, v, null);
        }
        assert_eq!(mn, 2);
        assert_eq!(mx, 8);
    }

    #[test]
    fn test_agg_double_reinterprets_slot_bits() {
        let mut slot = 0f64.to_bits() as i64;
        agg_sum_double(&mut slot, 1.5);
        agg_sum_double(&mut slot, 2.5);
        assert_eq!(f64::from_bits(slot as u64), 4.0);
    }

    #[test]
    fn test_agg_single_value_detects_conflict() {
        let empty = i64::MIN;
        let mut slot = empty;
        assert_eq!(agg_single_value(&mut slot, 7, empty), ERR_NONE);
        assert_eq!(agg_single_value(&mut slot, 7, empty), ERR_NONE);
        assert_eq!(
            agg_single_value(&mut slot, 8, empty),
            ERR_SINGLE_VALUE_FOUND_MULTIPLE_VALUES
        );
    }

    #[test]
    fn test_record_error_code_is_persistent() {
        let mut slot = ERR_NONE;
        record_error_code(ERR_DIV_BY_ZERO, &mut slot);
        record_error_code(ERR_OUT_OF_SLOTS, &mut slot);
        assert_eq!(slot, ERR_DIV_BY_ZERO, "first persistent code wins");
    }

    #[test]
    fn test_interrupt_flag_roundtrip() {
        set_interrupt(true);
        assert!(check_interrupt());
        set_interrupt(false);
        assert!(!check_interrupt());
    }
}
