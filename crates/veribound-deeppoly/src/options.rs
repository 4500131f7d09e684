// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Configuration of the symbolic engine.

use ahash::AHashMap;

/// Which symbolic relaxation family the engine applies to the
/// phase-unfixed piecewise-linear activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolicBoundMode {
    /// The standard adaptive envelopes ("sbt").
    #[default]
    Standard,
    /// Envelopes steered by per-layer coefficients in `[0, 1]`
    /// ("parameterised-sbt"); see [`AnalysisOptions::layer_parameters`].
    Parameterised,
}

/// Which decomposition family produces the softmax envelopes in the LP
/// relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoftmaxBoundKind {
    /// Log-sum-exp decomposition (with the LSE2 variant past the
    /// threshold).
    #[default]
    LogSumExp,
    /// Exponential-reciprocal decomposition.
    ExponentialReciprocal,
}

/// Options for one [`crate::DeepPolyAnalysis`] run.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub mode: SymbolicBoundMode,

    /// Per-layer envelope coefficients for the parameterised mode. Each
    /// coefficient must lie in `[0, 1]`; envelopes remain sound for any
    /// value in that range. ReLU/LeakyReLU use one coefficient, Sign and
    /// Bilinear use two.
    pub layer_parameters: AHashMap<usize, Vec<f64>>,

    /// Rounding slack applied when a residual layer's contribution is
    /// concretized from its interval bounds.
    pub symbolic_rounding_slack: f64,

    /// Persist the output layer's symbolic expressions in terms of every
    /// layer the back-substitution passes through.
    pub store_output_bounds: bool,

    /// Persist each layer's symbolic expressions in terms of its main
    /// immediate predecessor.
    pub store_predecessor_bounds: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            mode: SymbolicBoundMode::Standard,
            layer_parameters: AHashMap::new(),
            symbolic_rounding_slack: 1e-8,
            store_output_bounds: false,
            store_predecessor_bounds: false,
        }
    }
}
