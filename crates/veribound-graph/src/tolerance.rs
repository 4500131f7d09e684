// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Floating-point comparison conventions shared by every bound computation.
//!
//! All comparisons against zero and all equality checks in the verifier go
//! through these helpers so that the comparison tolerance is applied
//! uniformly. The default tolerance matches the engine-wide comparison
//! epsilon; call sites that expose a configurable tolerance use the
//! `_within` variants.

/// Default epsilon for floating-point comparisons.
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// `a == b` within `eps`.
#[inline]
pub fn are_equal_within(a: f64, b: f64, eps: f64) -> bool {
    (a - b).abs() <= eps
}

/// `a == b` within the default epsilon.
#[inline]
pub fn are_equal(a: f64, b: f64) -> bool {
    are_equal_within(a, b, DEFAULT_EPSILON)
}

/// `x > 0` beyond the default epsilon.
#[inline]
pub fn is_positive(x: f64) -> bool {
    x > DEFAULT_EPSILON
}

/// `x < 0` beyond the default epsilon.
#[inline]
pub fn is_negative(x: f64) -> bool {
    x < -DEFAULT_EPSILON
}

/// `x == 0` within the default epsilon.
#[inline]
pub fn is_zero(x: f64) -> bool {
    x.abs() <= DEFAULT_EPSILON
}

/// `a <= b` within `eps`.
#[inline]
pub fn lte_within(a: f64, b: f64, eps: f64) -> bool {
    a <= b + eps
}

/// `a >= b` within `eps`.
#[inline]
pub fn gte_within(a: f64, b: f64, eps: f64) -> bool {
    a >= b - eps
}

/// `a <= b` within the default epsilon.
#[inline]
pub fn lte(a: f64, b: f64) -> bool {
    lte_within(a, b, DEFAULT_EPSILON)
}

/// `a >= b` within the default epsilon.
#[inline]
pub fn gte(a: f64, b: f64) -> bool {
    gte_within(a, b, DEFAULT_EPSILON)
}

/// Round to the nearest integer, ties away from zero.
#[inline]
pub fn round(x: f64) -> f64 {
    x.round()
}

/// Logistic function.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Derivative of the logistic function.
#[inline]
pub fn sigmoid_derivative(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_honor_tolerance() {
        assert!(are_equal(1.0, 1.0 + 1e-9));
        assert!(!are_equal(1.0, 1.0 + 1e-3));
        assert!(!is_positive(1e-9));
        assert!(is_positive(1e-3));
        assert!(!is_negative(-1e-9));
        assert!(is_negative(-1e-3));
        assert!(lte(1.0 + 1e-9, 1.0));
        assert!(gte(1.0 - 1e-9, 1.0));
    }

    #[test]
    fn sigmoid_midpoint_and_symmetry() {
        assert!(are_equal(sigmoid(0.0), 0.5));
        assert!(are_equal(sigmoid(3.0) + sigmoid(-3.0), 1.0));
        assert!(are_equal(sigmoid_derivative(0.0), 0.25));
    }
}
