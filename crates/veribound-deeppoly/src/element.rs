// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Abstract elements: the per-layer record a propagation run keeps.
//!
//! An element holds whatever the back-substitution of *later* layers needs
//! from this layer: its kind, width, and (for activation layers) the
//! affine envelopes over its source layer built when the layer was
//! processed. Weighted-sum layers substitute through their weight matrices
//! directly, so their element carries no extra data. Elements are created
//! during a run and discarded with it; the engine owns all symbolic working
//! memory and only lends it to element execution.

use crate::envelope::ActivationEnvelopes;
use veribound_graph::LayerKind;

/// Kind-specific payload of an element.
#[derive(Debug, Clone)]
pub enum ElementBody {
    /// The reference layer (or another input layer): nothing to
    /// substitute through.
    Input,
    /// Substitution runs through the layer's weight matrices and biases.
    WeightedSum,
    /// Substitution runs through the stored envelopes, with the sign-aware
    /// branch choosing a face per coefficient.
    Activation(ActivationEnvelopes),
}

/// Per-layer record of one analysis run.
#[derive(Debug, Clone)]
pub struct AbstractElement {
    pub layer_index: usize,
    pub kind: LayerKind,
    pub size: usize,
    pub body: ElementBody,
    /// Concrete bound snapshot taken right after this layer was processed;
    /// residual concretization reads these rather than chasing the live
    /// layer state.
    pub lb: Vec<f64>,
    pub ub: Vec<f64>,
}

impl AbstractElement {
    pub fn has_predecessor(&self) -> bool {
        !matches!(self.body, ElementBody::Input)
    }
}
