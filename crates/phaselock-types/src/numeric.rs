//! The numeric contract used by every lattice computation.
//!
//! [`NumericValue`] is the single capability interface the engine is
//! written against. It fixes three things:
//!
//! - **Precision**: each implementation documents its mantissa. `f64` is
//!   IEEE-754 binary64; [`Decimal`] is a 96-bit integer mantissa with up to
//!   28 fractional digits.
//! - **Determinism**: every operation is a pure function of its inputs.
//!   The engine evaluates expressions in a fixed order, so two nodes using
//!   the same implementation produce bit-identical trajectories.
//! - **Rounding**: `f64` rounds to nearest, ties to even (hardware
//!   default). [`Decimal`] rounds half to even at its scale limit
//!   (banker's rounding). Conversions out of range saturate instead of
//!   panicking.
//!
//! Canonical serialization is fixed-width and normalizes equal values to
//! identical bytes (`-0.0` encodes as `0.0`, every `NaN` encodes the same,
//! and decimals drop trailing zeros before encoding).

use core::fmt::Debug;
use core::ops::{Add, Div, Mul, Neg, Sub};

use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum number of series terms used by the decimal arctangent.
const DECIMAL_ATAN_MAX_TERMS: u32 = 64;

/// Real scalar capability required by the lattice engine.
///
/// The trait's own methods are total: none panics, and operations that
/// have no mathematical result (square root of a negative, overflow) fall
/// back to a documented saturating value. The arithmetic operators keep the
/// type's native overflow behavior, which for `Decimal` is a panic. The
/// lattice keeps operands in range by clamping magnitudes to the
/// saturation limit and by refusing negative gains at config validation.
pub trait NumericValue:
    Copy
    + Debug
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// Width in bytes of [`write_canonical`](Self::write_canonical) output.
    const CANONICAL_WIDTH: usize;

    /// Additive identity.
    fn zero() -> Self;

    /// Multiplicative identity.
    fn one() -> Self;

    /// The constant pi at the implementation's precision.
    fn pi() -> Self;

    /// Convert from `f64`. Non-finite input maps to zero; out-of-range
    /// input saturates.
    fn from_f64(value: f64) -> Self;

    /// Convert to `f64`, rounding to nearest.
    fn to_f64(self) -> f64;

    /// Whether the value is a finite number.
    fn is_finite(self) -> bool;

    /// Absolute value.
    fn abs(self) -> Self;

    /// Square root; negative input yields zero.
    fn sqrt(self) -> Self;

    /// Natural exponential; overflow saturates to the largest value.
    fn exp(self) -> Self;

    /// Sine of an angle in radians.
    fn sin(self) -> Self;

    /// Cosine of an angle in radians.
    fn cos(self) -> Self;

    /// Four-quadrant arctangent of `self / x`, in `[-pi, pi]`.
    fn atan2(self, x: Self) -> Self;

    /// Smallest integer value not less than `self`.
    fn ceil(self) -> Self;

    /// Round to the nearest integer, ties to even.
    fn round_ties_even(self) -> Self;

    /// Append the canonical fixed-width big-endian encoding to `out`.
    fn write_canonical(self, out: &mut Vec<u8>);

    /// Decode a value written by [`write_canonical`](Self::write_canonical).
    ///
    /// Returns `None` if `bytes` has the wrong length.
    fn read_canonical(bytes: &[u8]) -> Option<Self>;

    /// The larger of two values (`self` when incomparable).
    fn max_of(self, other: Self) -> Self {
        if other > self { other } else { self }
    }

    /// The smaller of two values (`self` when incomparable).
    fn min_of(self, other: Self) -> Self {
        if other < self { other } else { self }
    }

    /// Two times pi.
    #[allow(clippy::arithmetic_side_effects)]
    fn two_pi() -> Self {
        Self::pi() + Self::pi()
    }
}

// ---------------------------------------------------------------------------
// f64: IEEE-754 binary64
// ---------------------------------------------------------------------------

impl NumericValue for f64 {
    const CANONICAL_WIDTH: usize = 8;

    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn pi() -> Self {
        core::f64::consts::PI
    }

    fn from_f64(value: f64) -> Self {
        if value.is_finite() { value } else { 0.0 }
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn is_finite(self) -> bool {
        Self::is_finite(self)
    }

    fn abs(self) -> Self {
        Self::abs(self)
    }

    fn sqrt(self) -> Self {
        if self > 0.0 { Self::sqrt(self) } else { 0.0 }
    }

    fn exp(self) -> Self {
        let value = Self::exp(self);
        if value.is_finite() { value } else { Self::MAX }
    }

    fn sin(self) -> Self {
        Self::sin(self)
    }

    fn cos(self) -> Self {
        Self::cos(self)
    }

    fn atan2(self, x: Self) -> Self {
        Self::atan2(self, x)
    }

    fn ceil(self) -> Self {
        Self::ceil(self)
    }

    fn round_ties_even(self) -> Self {
        Self::round_ties_even(self)
    }

    fn write_canonical(self, out: &mut Vec<u8>) {
        let bits = if self.is_nan() {
            Self::NAN.to_bits()
        } else if self == 0.0 {
            0.0_f64.to_bits()
        } else {
            self.to_bits()
        };
        out.extend_from_slice(&bits.to_be_bytes());
    }

    fn read_canonical(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(Self::from_bits(u64::from_be_bytes(raw)))
    }
}

// ---------------------------------------------------------------------------
// Decimal: 96-bit mantissa, 28 fractional digits
// ---------------------------------------------------------------------------

impl NumericValue for Decimal {
    const CANONICAL_WIDTH: usize = 16;

    fn zero() -> Self {
        Self::ZERO
    }

    fn one() -> Self {
        Self::ONE
    }

    fn pi() -> Self {
        Self::PI
    }

    fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Self::ZERO;
        }
        <Self as FromPrimitive>::from_f64(value).unwrap_or(if value > 0.0 {
            Self::MAX
        } else {
            Self::MIN
        })
    }

    fn to_f64(self) -> f64 {
        <Self as ToPrimitive>::to_f64(&self).unwrap_or(0.0)
    }

    fn is_finite(self) -> bool {
        true
    }

    fn abs(self) -> Self {
        Self::abs(&self)
    }

    fn sqrt(self) -> Self {
        MathematicalOps::sqrt(&self).unwrap_or(Self::ZERO)
    }

    fn exp(self) -> Self {
        MathematicalOps::checked_exp(&self).unwrap_or(if self.is_sign_negative() {
            Self::ZERO
        } else {
            Self::MAX
        })
    }

    fn sin(self) -> Self {
        MathematicalOps::checked_sin(&self).unwrap_or(Self::ZERO)
    }

    fn cos(self) -> Self {
        MathematicalOps::checked_cos(&self).unwrap_or(Self::ONE)
    }

    fn atan2(self, x: Self) -> Self {
        decimal_atan2(self, x)
    }

    fn ceil(self) -> Self {
        Self::ceil(&self)
    }

    fn round_ties_even(self) -> Self {
        self.round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointNearestEven)
    }

    fn write_canonical(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.normalize().serialize());
    }

    fn read_canonical(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 16] = bytes.try_into().ok()?;
        Some(Self::deserialize(raw))
    }
}

/// Four-quadrant arctangent for [`Decimal`].
#[allow(clippy::arithmetic_side_effects)]
fn decimal_atan2(y: Decimal, x: Decimal) -> Decimal {
    if x.is_zero() {
        return if y.is_zero() {
            Decimal::ZERO
        } else if y.is_sign_negative() {
            -Decimal::HALF_PI
        } else {
            Decimal::HALF_PI
        };
    }

    // A quotient that overflows means x is negligible next to y.
    let Some(ratio) = y.checked_div(x) else {
        return if y.is_sign_negative() {
            -Decimal::HALF_PI
        } else {
            Decimal::HALF_PI
        };
    };

    let base = decimal_atan(ratio);
    if x.is_sign_positive() {
        base
    } else if y.is_sign_negative() {
        base - Decimal::PI
    } else {
        base + Decimal::PI
    }
}

/// Arctangent for [`Decimal`] via argument reduction and a Taylor series.
///
/// `|x| > 1` is reflected through `pi/2 - atan(1/x)`, then the argument is
/// halved twice with `atan(x) = 2 atan(x / (1 + sqrt(1 + x^2)))` so the
/// series converges in about twenty terms.
#[allow(clippy::arithmetic_side_effects)]
fn decimal_atan(x: Decimal) -> Decimal {
    let negative = x.is_sign_negative();
    let magnitude = x.abs();
    let reflect = magnitude > Decimal::ONE;
    let mut y = if reflect {
        Decimal::ONE.checked_div(magnitude).unwrap_or(Decimal::ZERO)
    } else {
        magnitude
    };

    for _ in 0..2 {
        let radius = MathematicalOps::sqrt(&(Decimal::ONE + y * y)).unwrap_or(Decimal::ONE);
        y = y.checked_div(Decimal::ONE + radius).unwrap_or(Decimal::ZERO);
    }

    let y_squared = y * y;
    let mut term = y;
    let mut sum = y;
    for n in 1..DECIMAL_ATAN_MAX_TERMS {
        term = -(term * y_squared);
        let denominator = Decimal::from(n.saturating_mul(2).saturating_add(1));
        let contribution = term.checked_div(denominator).unwrap_or(Decimal::ZERO);
        if contribution.is_zero() {
            break;
        }
        sum += contribution;
    }

    let mut angle = sum * Decimal::from(4_u32);
    if reflect {
        angle = Decimal::HALF_PI - angle;
    }
    if negative { -angle } else { angle }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn f64_canonical_bytes_normalize_signed_zero() {
        let mut pos = Vec::new();
        let mut neg = Vec::new();
        NumericValue::write_canonical(0.0_f64, &mut pos);
        NumericValue::write_canonical(-0.0_f64, &mut neg);
        assert_eq!(pos, neg);
        assert_eq!(pos.len(), <f64 as NumericValue>::CANONICAL_WIDTH);
    }

    #[test]
    fn f64_canonical_round_trip() {
        let value = -1.234_567_890_123_f64;
        let mut buf = Vec::new();
        NumericValue::write_canonical(value, &mut buf);
        let back = <f64 as NumericValue>::read_canonical(&buf).unwrap();
        assert_eq!(back.to_bits(), value.to_bits());
    }

    #[test]
    fn f64_read_rejects_wrong_width() {
        assert!(<f64 as NumericValue>::read_canonical(&[0u8; 7]).is_none());
    }

    #[test]
    fn f64_sqrt_of_negative_is_zero() {
        assert_eq!(NumericValue::sqrt(-4.0_f64), 0.0);
    }

    #[test]
    fn f64_exp_saturates() {
        assert_eq!(NumericValue::exp(1.0e6_f64), f64::MAX);
    }

    #[test]
    fn f64_from_non_finite_is_zero() {
        assert_eq!(<f64 as NumericValue>::from_f64(f64::NAN), 0.0);
        assert_eq!(<f64 as NumericValue>::from_f64(f64::INFINITY), 0.0);
    }

    #[test]
    fn decimal_canonical_bytes_ignore_scale() {
        let a = Decimal::new(100, 2); // 1.00
        let b = Decimal::ONE;
        let mut left = Vec::new();
        let mut right = Vec::new();
        a.write_canonical(&mut left);
        b.write_canonical(&mut right);
        assert_eq!(left, right);
        assert_eq!(left.len(), <Decimal as NumericValue>::CANONICAL_WIDTH);
    }

    #[test]
    fn decimal_canonical_round_trip() {
        let value = Decimal::new(-31_415_926_535, 10);
        let mut buf = Vec::new();
        value.write_canonical(&mut buf);
        assert_eq!(<Decimal as NumericValue>::read_canonical(&buf).unwrap(), value);
    }

    #[test]
    fn decimal_atan2_matches_f64_in_every_quadrant() {
        let cases = [
            (1.0, 1.0),
            (1.0, -1.0),
            (-1.0, -1.0),
            (-1.0, 1.0),
            (0.3, 2.5),
            (2.5, 0.3),
            (-0.0001, -4.0),
        ];
        for (y, x) in cases {
            let expected = f64::atan2(y, x);
            let got = NumericValue::atan2(
                <Decimal as NumericValue>::from_f64(y),
                <Decimal as NumericValue>::from_f64(x),
            );
            assert!(
                close(NumericValue::to_f64(got), expected, 1e-12),
                "atan2({y}, {x}) = {got}, expected {expected}"
            );
        }
    }

    #[test]
    fn decimal_atan2_axes() {
        let one = Decimal::ONE;
        let zero = Decimal::ZERO;
        assert_eq!(NumericValue::atan2(one, zero), Decimal::HALF_PI);
        assert_eq!(NumericValue::atan2(-one, zero), -Decimal::HALF_PI);
        assert_eq!(NumericValue::atan2(zero, zero), Decimal::ZERO);
        assert_eq!(NumericValue::atan2(zero, -one), Decimal::PI);
    }

    #[test]
    fn decimal_round_ties_even() {
        assert_eq!(
            NumericValue::round_ties_even(Decimal::new(25, 1)),
            Decimal::from(2_u32)
        );
        assert_eq!(
            NumericValue::round_ties_even(Decimal::new(35, 1)),
            Decimal::from(4_u32)
        );
    }

    #[test]
    fn max_and_min_of() {
        assert_eq!(NumericValue::max_of(1.0_f64, 2.0), 2.0);
        assert_eq!(NumericValue::min_of(1.0_f64, 2.0), 1.0);
    }
}
