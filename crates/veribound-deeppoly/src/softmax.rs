// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Affine softmax envelopes.
//!
//! For an output `k` of `softmax(x)` over a source box `[l, u]`, each
//! function below produces one face of an affine envelope: the bound
//! function's value at the source midpoints and its partial derivatives
//! there. The LP relaxation assembles the face as
//! `y ~ bound(m) + sum_i d_i * (x_i - m_i)`.
//!
//! Two decomposition families are available (selectable via
//! [`crate::SoftmaxBoundKind`]):
//!
//! * **Log-sum-exp**: `softmax_k(x) = exp(-log(1 + sum_{j != k}
//!   exp(x_j - x_k)))`. The lower face is the tangent at the midpoints of a
//!   convex under-approximation obtained by replacing each exponential with
//!   its chord over the box. The `lse2` variant works in the un-shifted
//!   logit space instead and behaves better once outputs are bounded away
//!   from zero. The upper face linearizes the concave log-probability and
//!   carries it through the exponential with a chord anchored at the output
//!   interval, so it needs the current output bounds.
//! * **Exponential-reciprocal**: `softmax_k(x) = exp(x_k) * 1/sum_j
//!   exp(x_j)`, bounded via a McCormick product of the two factors, each
//!   factor bounded affinely on the box.
//!
//! Every face is sound for the given box; soundness is exercised by the
//! grid tests at the bottom of this module.

use veribound_graph::tolerance;

fn softmax_at(mids: &[f64], k: usize) -> f64 {
    let max = mids.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let total: f64 = mids.iter().map(|x| (x - max).exp()).sum();
    (mids[k] - max).exp() / total
}

/// Chord slope of `exp` over `[a, b]`, degenerating to the derivative on a
/// point interval.
fn exp_chord_slope(a: f64, b: f64) -> f64 {
    if tolerance::are_equal(a, b) {
        a.exp()
    } else {
        (b.exp() - a.exp()) / (b - a)
    }
}

/// Chord value of `exp` over `[a, b]` at `t`.
fn exp_chord_at(a: f64, b: f64, t: f64) -> f64 {
    a.exp() + exp_chord_slope(a, b) * (t - a)
}

/// Denominator of the shifted-logit under-approximation at the midpoints:
/// `1 + sum_{j != k} chord(exp, [l_j - u_k, u_j - l_k])(m_j - m_k)`.
fn shifted_chord_denominator(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize) -> f64 {
    let mut sum = 1.0;
    for j in 0..mids.len() {
        if j != k {
            let a = lbs[j] - ubs[k];
            let b = ubs[j] - lbs[k];
            sum += exp_chord_at(a, b, mids[j] - mids[k]);
        }
    }
    sum
}

/// Denominator of the raw-logit chord approximation at the midpoints:
/// `sum_j chord(exp, [l_j, u_j])(m_j)`.
fn raw_chord_denominator(mids: &[f64], lbs: &[f64], ubs: &[f64]) -> f64 {
    mids.iter()
        .zip(lbs.iter().zip(ubs.iter()))
        .map(|(&m, (&l, &u))| exp_chord_at(l, u, m))
        .sum()
}

/// Lower LSE face value at the midpoints.
pub fn lse_lower_bound(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize) -> f64 {
    1.0 / shifted_chord_denominator(mids, lbs, ubs, k)
}

/// Partial derivative of the lower LSE face at the midpoints.
pub fn d_lse_lower_bound(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize, i: usize) -> f64 {
    let denominator = shifted_chord_denominator(mids, lbs, ubs, k);
    if i == k {
        let mut slopes = 0.0;
        for j in 0..mids.len() {
            if j != k {
                slopes += exp_chord_slope(lbs[j] - ubs[k], ubs[j] - lbs[k]);
            }
        }
        slopes / (denominator * denominator)
    } else {
        -exp_chord_slope(lbs[i] - ubs[k], ubs[i] - lbs[k]) / (denominator * denominator)
    }
}

/// Lower LSE2 face value at the midpoints: `exp(m_k) / sum_j
/// chord(exp)(m_j)`.
pub fn lse_lower_bound2(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize) -> f64 {
    mids[k].exp() / raw_chord_denominator(mids, lbs, ubs)
}

/// Partial derivative of the lower LSE2 face at the midpoints.
pub fn d_lse_lower_bound2(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize, i: usize) -> f64 {
    let denominator = raw_chord_denominator(mids, lbs, ubs);
    let value = mids[k].exp() / denominator;
    let slope = exp_chord_slope(lbs[i], ubs[i]);
    let kronecker = if i == k { 1.0 } else { 0.0 };
    value * (kronecker - slope / denominator)
}

/// Chord slope of `exp` between the output interval endpoints in log
/// space; zero on a point interval.
fn output_chord_slope(ylb: f64, yub: f64) -> f64 {
    if tolerance::are_equal(ylb, yub) {
        0.0
    } else {
        (yub - ylb) / (yub.ln() - ylb.ln())
    }
}

/// Upper LSE face value at the midpoints. Output-interval-aware: the
/// concave log-probability `x_k - lse(x)` is linearized at the midpoints
/// and carried through `exp` with the chord anchored at the current output
/// bounds `[target_lbs[k], target_ubs[k]]` (which must be positive).
pub fn lse_upper_bound(mids: &[f64], target_lbs: &[f64], target_ubs: &[f64], k: usize) -> f64 {
    let ylb = target_lbs[k].max(f64::MIN_POSITIVE);
    let yub = target_ubs[k].max(ylb);
    let log_probability = softmax_at(mids, k).ln();
    // Anchored at the upper endpoint so a collapsed output interval
    // degenerates to the sound constant `yub`.
    yub + output_chord_slope(ylb, yub) * (log_probability - yub.ln())
}

/// Partial derivative of the upper LSE face at the midpoints.
pub fn d_lse_upper_bound(
    mids: &[f64],
    target_lbs: &[f64],
    target_ubs: &[f64],
    k: usize,
    i: usize,
) -> f64 {
    let ylb = target_lbs[k].max(f64::MIN_POSITIVE);
    let yub = target_ubs[k].max(ylb);
    let probability = softmax_at(mids, i);
    let kronecker = if i == k { 1.0 } else { 0.0 };
    output_chord_slope(ylb, yub) * (kronecker - probability)
}

/// Lower ER face value at the midpoints: McCormick lower product of
/// `exp(x_k)` (tangent at the midpoint) and the reciprocal denominator
/// (exponential tangent through the chord approximation).
pub fn er_lower_bound(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize) -> f64 {
    let reciprocal_lb = 1.0 / ubs.iter().map(|&u| u.exp()).sum::<f64>();
    let numerator_lb = lbs[k].exp();
    let denominator = raw_chord_denominator(mids, lbs, ubs);
    reciprocal_lb * mids[k].exp() + numerator_lb / denominator - numerator_lb * reciprocal_lb
}

/// Partial derivative of the lower ER face at the midpoints.
pub fn d_er_lower_bound(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize, i: usize) -> f64 {
    let reciprocal_lb = 1.0 / ubs.iter().map(|&u| u.exp()).sum::<f64>();
    let numerator_lb = lbs[k].exp();
    let denominator = raw_chord_denominator(mids, lbs, ubs);
    let slope = exp_chord_slope(lbs[i], ubs[i]);
    let mut derivative = -numerator_lb * slope / (denominator * denominator);
    if i == k {
        derivative += reciprocal_lb * mids[k].exp();
    }
    derivative
}

/// Upper ER face value at the midpoints: McCormick upper product with the
/// numerator bounded by its chord and the reciprocal carried through `exp`
/// with a chord over the reciprocal's own interval.
pub fn er_upper_bound(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize) -> f64 {
    let reciprocal_lb = 1.0 / ubs.iter().map(|&u| u.exp()).sum::<f64>();
    let reciprocal_ub = 1.0 / lbs.iter().map(|&l| l.exp()).sum::<f64>();
    let numerator_lb = lbs[k].exp();
    let slope = output_chord_slope(reciprocal_lb, reciprocal_ub);
    let log_reciprocal_mid = -mids.iter().map(|&m| m.exp()).sum::<f64>().ln();
    // Anchored at the upper endpoint; see `lse_upper_bound`.
    let reciprocal_face = reciprocal_ub + slope * (log_reciprocal_mid - reciprocal_ub.ln());
    reciprocal_ub * exp_chord_at(lbs[k], ubs[k], mids[k]) + numerator_lb * reciprocal_face
        - numerator_lb * reciprocal_ub
}

/// Partial derivative of the upper ER face at the midpoints.
pub fn d_er_upper_bound(mids: &[f64], lbs: &[f64], ubs: &[f64], k: usize, i: usize) -> f64 {
    let reciprocal_lb = 1.0 / ubs.iter().map(|&u| u.exp()).sum::<f64>();
    let reciprocal_ub = 1.0 / lbs.iter().map(|&l| l.exp()).sum::<f64>();
    let numerator_lb = lbs[k].exp();
    let slope = output_chord_slope(reciprocal_lb, reciprocal_ub);
    let probability = softmax_at(mids, i);
    let mut derivative = -numerator_lb * slope * probability;
    if i == k {
        derivative += reciprocal_ub * exp_chord_slope(lbs[k], ubs[k]);
    }
    derivative
}

#[cfg(test)]
mod tests {
    use super::*;
    use veribound_graph::interval::{softmax_linear_lower_bound, softmax_linear_upper_bound};

    const LBS: [f64; 3] = [0.0, -5.0, -1.0];
    const UBS: [f64; 3] = [2.0, 5.0, 1.0];

    fn mids() -> Vec<f64> {
        LBS.iter().zip(UBS.iter()).map(|(l, u)| (l + u) / 2.0).collect()
    }

    /// Evaluate one affine face at `point`.
    fn face_at(
        point: &[f64],
        mids: &[f64],
        value: f64,
        derivative: impl Fn(usize) -> f64,
    ) -> f64 {
        let mut result = value;
        for (i, (&x, &m)) in point.iter().zip(mids.iter()).enumerate() {
            result += derivative(i) * (x - m);
        }
        result
    }

    fn softmax_value(point: &[f64], k: usize) -> f64 {
        let total: f64 = point.iter().map(|x| x.exp()).sum();
        point[k].exp() / total
    }

    /// Deterministic grid over the box.
    fn grid_points() -> Vec<Vec<f64>> {
        let steps = [0.0, 0.25, 0.5, 0.75, 1.0];
        let mut points = Vec::new();
        for &s0 in &steps {
            for &s1 in &steps {
                for &s2 in &steps {
                    points.push(vec![
                        LBS[0] + s0 * (UBS[0] - LBS[0]),
                        LBS[1] + s1 * (UBS[1] - LBS[1]),
                        LBS[2] + s2 * (UBS[2] - LBS[2]),
                    ]);
                }
            }
        }
        points
    }

    #[test]
    fn lse_lower_faces_stay_below_softmax() {
        let mids = mids();
        for k in 0..3 {
            let value = lse_lower_bound(&mids, &LBS, &UBS, k);
            let value2 = lse_lower_bound2(&mids, &LBS, &UBS, k);
            for point in grid_points() {
                let truth = softmax_value(&point, k);
                let face = face_at(&point, &mids, value, |i| {
                    d_lse_lower_bound(&mids, &LBS, &UBS, k, i)
                });
                let face2 = face_at(&point, &mids, value2, |i| {
                    d_lse_lower_bound2(&mids, &LBS, &UBS, k, i)
                });
                assert!(face <= truth + 1e-7, "lse1 face {} above {}", face, truth);
                assert!(face2 <= truth + 1e-7, "lse2 face {} above {}", face2, truth);
            }
        }
    }

    #[test]
    fn lse_upper_face_stays_above_softmax() {
        let mids = mids();
        for k in 0..3 {
            let target_lbs: Vec<f64> = (0..3)
                .map(|i| softmax_linear_lower_bound(&LBS, &UBS, i))
                .collect();
            let target_ubs: Vec<f64> = (0..3)
                .map(|i| softmax_linear_upper_bound(&LBS, &UBS, i))
                .collect();
            let value = lse_upper_bound(&mids, &target_lbs, &target_ubs, k);
            for point in grid_points() {
                let truth = softmax_value(&point, k);
                let face = face_at(&point, &mids, value, |i| {
                    d_lse_upper_bound(&mids, &target_lbs, &target_ubs, k, i)
                });
                assert!(face >= truth - 1e-7, "upper face {} below {}", face, truth);
            }
        }
    }

    #[test]
    fn er_faces_bracket_softmax() {
        let mids = mids();
        for k in 0..3 {
            let lower = er_lower_bound(&mids, &LBS, &UBS, k);
            let upper = er_upper_bound(&mids, &LBS, &UBS, k);
            for point in grid_points() {
                let truth = softmax_value(&point, k);
                let lower_face = face_at(&point, &mids, lower, |i| {
                    d_er_lower_bound(&mids, &LBS, &UBS, k, i)
                });
                let upper_face = face_at(&point, &mids, upper, |i| {
                    d_er_upper_bound(&mids, &LBS, &UBS, k, i)
                });
                assert!(lower_face <= truth + 1e-7);
                assert!(upper_face >= truth - 1e-7);
            }
        }
    }

    #[test]
    fn point_interval_degenerates_to_exact_value() {
        let point = [1.0, -0.5, 0.25];
        for k in 0..3 {
            let value = lse_lower_bound(&point, &point, &point, k);
            assert!(tolerance::are_equal_within(
                value,
                softmax_value(&point, k),
                1e-9
            ));
        }
    }
}
