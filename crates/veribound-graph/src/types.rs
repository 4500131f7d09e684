// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core type definitions shared across the verifier.

use parking_lot::Mutex;

/// The role of a layer in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    // Linear layers
    Input,
    WeightedSum,

    // Activation functions
    Relu,
    AbsoluteValue,
    Max,
    Sign,
    LeakyRelu,
    Sigmoid,
    Round,
    Softmax,
    Bilinear,
}

impl LayerKind {
    /// True for every kind that computes an activation over explicit
    /// per-neuron sources (everything except `Input` and `WeightedSum`).
    pub fn is_activation(self) -> bool {
        !matches!(self, LayerKind::Input | LayerKind::WeightedSum)
    }

    /// True for the piecewise-linear activations whose phase can be split
    /// into finitely many linear branches.
    pub fn is_piecewise_linear(self) -> bool {
        matches!(
            self,
            LayerKind::Relu | LayerKind::LeakyRelu | LayerKind::AbsoluteValue | LayerKind::Sign
        )
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LayerKind::Input => "Input",
            LayerKind::WeightedSum => "WeightedSum",
            LayerKind::Relu => "ReLU",
            LayerKind::AbsoluteValue => "AbsoluteValue",
            LayerKind::Max => "Max",
            LayerKind::Sign => "Sign",
            LayerKind::LeakyRelu => "LeakyReLU",
            LayerKind::Sigmoid => "Sigmoid",
            LayerKind::Round => "Round",
            LayerKind::Softmax => "Softmax",
            LayerKind::Bilinear => "Bilinear",
        };
        write!(f, "{}", name)
    }
}

/// Address of a single neuron: (layer index, neuron index within the layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeuronRef {
    pub layer: usize,
    pub neuron: usize,
}

impl NeuronRef {
    pub fn new(layer: usize, neuron: usize) -> Self {
        Self { layer, neuron }
    }
}

impl std::fmt::Display for NeuronRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.layer, self.neuron)
    }
}

/// Which side of an interval a bound update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundKind {
    Lower,
    Upper,
}

/// A single bound refinement on an externally visible variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tightening {
    pub variable: usize,
    pub value: f64,
    pub kind: BoundKind,
}

impl Tightening {
    pub fn lower(variable: usize, value: f64) -> Self {
        Self {
            variable,
            value,
            kind: BoundKind::Lower,
        }
    }

    pub fn upper(variable: usize, value: f64) -> Self {
        Self {
            variable,
            value,
            kind: BoundKind::Upper,
        }
    }
}

/// An externally supplied affine inequality over arbitrary neurons.
///
/// With kind `Upper` the constraint reads `sum(coeff * neuron) <= value`,
/// with `Lower` it reads `sum(coeff * neuron) >= value`. The LP relaxation
/// includes a polygonal tightening only when every referenced neuron's layer
/// lies inside the emitted horizon; eliminated neurons fold into the
/// constant side.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonalTightening {
    pub terms: Vec<(NeuronRef, f64)>,
    pub value: f64,
    pub kind: BoundKind,
}

impl PolygonalTightening {
    pub fn upper(terms: Vec<(NeuronRef, f64)>, value: f64) -> Self {
        Self {
            terms,
            value,
            kind: BoundKind::Upper,
        }
    }

    pub fn lower(terms: Vec<(NeuronRef, f64)>, value: f64) -> Self {
        Self {
            terms,
            value,
            kind: BoundKind::Lower,
        }
    }
}

/// Consumer of bound refinements.
///
/// The verifier that owns the layer graph registers a listener; every bound
/// accepted by the tighteners is forwarded through it. Notifications are
/// serialized: concurrent tighteners call this under their shared mutex.
pub trait TighteningListener: Send + Sync {
    fn receive_tighter_bound(&self, tightening: Tightening);
}

/// Listener that records every notification. Useful in tests and for batch
/// consumers that drain tightenings after a pass.
#[derive(Debug, Default)]
pub struct CollectingListener {
    received: Mutex<Vec<Tightening>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything received so far.
    pub fn drain(&self) -> Vec<Tightening> {
        std::mem::take(&mut *self.received.lock())
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }
}

impl TighteningListener for CollectingListener {
    fn receive_tighter_bound(&self, tightening: Tightening) {
        self.received.lock().push(tightening);
    }
}

/// Listener that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl TighteningListener for NullListener {
    fn receive_tighter_bound(&self, _tightening: Tightening) {}
}
