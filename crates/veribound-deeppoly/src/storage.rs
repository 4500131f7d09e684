// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Optional persistence of symbolic expressions computed during a run.
//!
//! Downstream reasoning (e.g. multi-neuron constraint selection) sometimes
//! wants the raw affine expressions rather than the concretized bounds.
//! When requested through the analysis options, the engine snapshots them
//! here. Eliminated neurons are projected out before storage: their
//! constant value is folded into the bias terms.

use ahash::AHashMap;
use ndarray::Array2;

/// One affine double bound: for each target neuron `j`,
/// `sum_k lb[k, j] * ref_k + lower_bias[j] <= neuron_j` and symmetrically
/// for the upper side. Rows range over the neurons of the layer the
/// expression refers to.
#[derive(Debug, Clone)]
pub struct SymbolicBounds {
    pub lb: Array2<f64>,
    pub ub: Array2<f64>,
    pub lower_bias: Vec<f64>,
    pub upper_bias: Vec<f64>,
}

impl SymbolicBounds {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            lb: Array2::zeros((rows, cols)),
            ub: Array2::zeros((rows, cols)),
            lower_bias: vec![0.0; cols],
            upper_bias: vec![0.0; cols],
        }
    }
}

/// Symbolic expressions collected over one analysis run, keyed by the layer
/// the expression is *in terms of* (output store) or the layer the
/// expression *describes* (predecessor store).
#[derive(Debug, Clone, Default)]
pub struct SymbolicBoundsStore {
    bounds: AHashMap<usize, SymbolicBounds>,
}

impl SymbolicBoundsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: usize, bounds: SymbolicBounds) {
        self.bounds.insert(layer, bounds);
    }

    pub fn get(&self, layer: usize) -> Option<&SymbolicBounds> {
        self.bounds.get(&layer)
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn clear(&mut self) {
        self.bounds.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &SymbolicBounds)> {
        self.bounds.iter().map(|(layer, bounds)| (*layer, bounds))
    }
}
