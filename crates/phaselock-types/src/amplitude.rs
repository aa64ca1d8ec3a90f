//! Complex amplitudes over any [`NumericValue`].
//!
//! Only the operations the integrator needs are provided. Division is
//! always guarded: the divisor's magnitude is floored to an epsilon so a
//! collapsing slot can never produce an infinity.

use core::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::numeric::NumericValue;

/// A complex number `re + i*im`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(bound = "N: NumericValue")]
pub struct Amplitude<N> {
    /// Real part.
    pub re: N,
    /// Imaginary part.
    pub im: N,
}

#[allow(clippy::arithmetic_side_effects)]
impl<N: NumericValue> Amplitude<N> {
    /// Construct from real and imaginary parts.
    pub const fn new(re: N, im: N) -> Self {
        Self { re, im }
    }

    /// The zero amplitude.
    pub fn zero() -> Self {
        Self::new(N::zero(), N::zero())
    }

    /// Construct from magnitude and phase angle.
    pub fn from_polar(magnitude: N, phase: N) -> Self {
        Self::new(magnitude * phase.cos(), magnitude * phase.sin())
    }

    /// Squared magnitude `re^2 + im^2`.
    pub fn norm_sqr(self) -> N {
        self.re * self.re + self.im * self.im
    }

    /// Magnitude `|A|`.
    pub fn magnitude(self) -> N {
        self.norm_sqr().sqrt()
    }

    /// Argument of the amplitude in `[-pi, pi]`.
    pub fn phase(self) -> N {
        self.im.atan2(self.re)
    }

    /// Multiply both parts by a real factor.
    pub fn scale(self, factor: N) -> Self {
        Self::new(self.re * factor, self.im * factor)
    }

    /// Multiply by `i`: `(re, im) -> (-im, re)`.
    pub fn mul_i(self) -> Self {
        Self::new(-self.im, self.re)
    }

    /// Whether both parts are finite.
    pub fn is_finite(self) -> bool {
        self.re.is_finite() && self.im.is_finite()
    }

    /// Divide `self` by `divisor`, flooring the divisor's magnitude.
    ///
    /// When `|divisor| < epsilon` the divisor is rescaled to magnitude
    /// `epsilon` along its own direction (or along the real axis if it is
    /// exactly zero). Returns the quotient and whether the floor applied.
    pub fn div_floored(self, divisor: Self, epsilon: N) -> (Self, bool) {
        let magnitude = divisor.magnitude();
        let (divisor, floored) = if magnitude < epsilon {
            let replacement = if magnitude > N::zero() {
                divisor.scale(epsilon / magnitude)
            } else {
                Self::new(epsilon, N::zero())
            };
            (replacement, true)
        } else {
            (divisor, false)
        };

        let denominator = divisor.norm_sqr();
        let re = (self.re * divisor.re + self.im * divisor.im) / denominator;
        let im = (self.im * divisor.re - self.re * divisor.im) / denominator;
        (Self::new(re, im), floored)
    }

    /// Append the canonical bytes of `re` then `im`.
    pub fn write_canonical(self, out: &mut Vec<u8>) {
        self.re.write_canonical(out);
        self.im.write_canonical(out);
    }
}

#[allow(clippy::arithmetic_side_effects)]
impl<N: NumericValue> Add for Amplitude<N> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.re + rhs.re, self.im + rhs.im)
    }
}

#[allow(clippy::arithmetic_side_effects)]
impl<N: NumericValue> Sub for Amplitude<N> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.re - rhs.re, self.im - rhs.im)
    }
}

#[allow(clippy::arithmetic_side_effects)]
impl<N: NumericValue> Mul for Amplitude<N> {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl<N: NumericValue> Neg for Amplitude<N> {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.re, -self.im)
    }
}
