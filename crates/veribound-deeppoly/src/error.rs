// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the symbolic engine.

use veribound_graph::{GraphError, LayerKind};

pub type Result<T> = std::result::Result<T, DeepPolyError>;

/// Errors raised by symbolic bound propagation.
///
/// Structural variants abort the verification run. An empty interval
/// surfacing through [`DeepPolyError::Graph`] is the recoverable
/// "infeasible" outcome; check with [`DeepPolyError::is_infeasible`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeepPolyError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Layer kind {0} is not supported by the symbolic engine")]
    UnsupportedLayer(LayerKind),

    #[error("Activation layer {layer} mixes sources from different layers")]
    MixedSourceLayers { layer: usize },

    #[error("Bilinear neuron {neuron} of layer {layer} needs exactly two sources")]
    BilinearArity { layer: usize, neuron: usize },

    #[error("Parameter vector for layer {layer} has {actual} entries, expected {expected}")]
    ParameterArity {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Parameter {value} for layer {layer} lies outside [0, 1]")]
    ParameterRange { layer: usize, value: f64 },
}

impl DeepPolyError {
    /// True when the error means "the query region is infeasible" rather
    /// than a structural defect.
    pub fn is_infeasible(&self) -> bool {
        matches!(self, DeepPolyError::Graph(e) if e.is_infeasible())
    }
}
