// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for layer-graph operations.

use crate::types::LayerKind;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised by the layer-graph data model.
///
/// Every variant except [`GraphError::EmptyInterval`] is structural: the
/// graph was built or queried inconsistently and the verification run must
/// abort. `EmptyInterval` is the recoverable outcome a caller interprets as
/// "the query region is infeasible".
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    #[error("Layer not found: {0}")]
    LayerNotFound(usize),

    #[error("Layer {0} already exists")]
    DuplicateLayer(usize),

    #[error("Neuron {neuron} out of range for layer {layer} (size {size})")]
    NeuronOutOfRange {
        layer: usize,
        neuron: usize,
        size: usize,
    },

    #[error("Unknown variable: {0}")]
    UnknownVariable(usize),

    #[error("Dependency {src} -> {dst} does not respect topological order")]
    InvalidDependency { src: usize, dst: usize },

    #[error("No weights registered from layer {src} into layer {dst}")]
    MissingWeights { src: usize, dst: usize },

    #[error("Layer {layer} source width mismatch: declared {declared}, got {actual}")]
    WidthMismatch {
        layer: usize,
        declared: usize,
        actual: usize,
    },

    #[error("Neuron {neuron} of layer {layer} has no activation source")]
    MissingActivationSource { layer: usize, neuron: usize },

    #[error("Operation not supported for layer kind {0}")]
    UnsupportedLayer(LayerKind),

    #[error("Empty interval on neuron {neuron} of layer {layer}: [{lb}, {ub}]")]
    EmptyInterval {
        layer: usize,
        neuron: usize,
        lb: f64,
        ub: f64,
    },

    #[error("Layer {0} has no assignment; set input assignments before evaluating")]
    MissingAssignment(usize),

    #[error("Layer {0} has no simulation samples")]
    MissingSimulations(usize),

    #[error("Graph has no input layer")]
    NoInputLayer,
}

impl GraphError {
    /// True when the error is the recoverable "region is infeasible"
    /// outcome rather than a structural defect.
    pub fn is_infeasible(&self) -> bool {
        matches!(self, GraphError::EmptyInterval { .. })
    }
}
