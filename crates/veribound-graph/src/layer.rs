// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! A single layer of the computation graph.
//!
//! A layer is a fixed-size vector of neurons sharing one [`LayerKind`].
//! Weighted-sum layers hold one dense weight matrix per source layer (rows =
//! source neurons, columns = own neurons) and a bias vector; activation
//! layers hold per-neuron source lists instead. Interval bounds are
//! refine-only: `set_lb`/`set_ub` ignore non-tightening updates and report
//! an empty interval as an error.

use ahash::AHashMap;
use ndarray::Array2;

use crate::error::{GraphError, Result};
use crate::tolerance;
use crate::types::{LayerKind, NeuronRef};

/// One layer of the network graph. See the module docs for the data layout.
#[derive(Debug, Clone)]
pub struct Layer {
    index: usize,
    kind: LayerKind,
    size: usize,

    /// Source layer index -> declared width of that source.
    source_layers: AHashMap<usize, usize>,
    /// Source layer index -> (source width x own size) weight matrix.
    weights: AHashMap<usize, Array2<f64>>,
    bias: Vec<f64>,

    /// Per-neuron activation sources, in registration order.
    activation_sources: Vec<Vec<NeuronRef>>,

    lb: Vec<f64>,
    ub: Vec<f64>,

    neuron_to_variable: AHashMap<usize, usize>,
    variable_to_neuron: AHashMap<usize, usize>,
    eliminated: AHashMap<usize, f64>,

    /// LeakyReLU slope; unused by other kinds.
    alpha: f64,

    assignment: Option<Vec<f64>>,
    /// Per-neuron rows of simulation samples; all rows share one length.
    simulations: Option<Vec<Vec<f64>>>,
}

impl Layer {
    pub fn new(index: usize, kind: LayerKind, size: usize) -> Self {
        Self {
            index,
            kind,
            size,
            source_layers: AHashMap::new(),
            weights: AHashMap::new(),
            bias: vec![0.0; size],
            activation_sources: vec![Vec::new(); size],
            lb: vec![f64::NEG_INFINITY; size],
            ub: vec![f64::INFINITY; size],
            neuron_to_variable: AHashMap::new(),
            variable_to_neuron: AHashMap::new(),
            eliminated: AHashMap::new(),
            alpha: 0.0,
            assignment: None,
            simulations: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }

    fn check_neuron(&self, neuron: usize) -> Result<()> {
        if neuron >= self.size {
            return Err(GraphError::NeuronOutOfRange {
                layer: self.index,
                neuron,
                size: self.size,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// Register `src` (of width `src_size`) as a source of this layer.
    /// Weighted-sum layers get a zero weight matrix to fill in.
    pub fn add_source_layer(&mut self, src: usize, src_size: usize) {
        self.source_layers.insert(src, src_size);
        if self.kind == LayerKind::WeightedSum {
            self.weights
                .entry(src)
                .or_insert_with(|| Array2::zeros((src_size, self.size)));
        }
    }

    /// Drop `src` as a source, along with its weights.
    pub fn remove_source_layer(&mut self, src: usize) {
        self.source_layers.remove(&src);
        self.weights.remove(&src);
    }

    /// Source layer index -> declared width.
    pub fn source_layers(&self) -> &AHashMap<usize, usize> {
        &self.source_layers
    }

    /// Source layer indices in ascending order.
    pub fn sorted_source_layers(&self) -> Vec<usize> {
        let mut sources: Vec<usize> = self.source_layers.keys().copied().collect();
        sources.sort_unstable();
        sources
    }

    pub fn set_weight(&mut self, src: usize, src_neuron: usize, neuron: usize, weight: f64) -> Result<()> {
        self.check_neuron(neuron)?;
        let matrix = self
            .weights
            .get_mut(&src)
            .ok_or(GraphError::MissingWeights {
                src,
                dst: self.index,
            })?;
        if src_neuron >= matrix.nrows() {
            return Err(GraphError::NeuronOutOfRange {
                layer: src,
                neuron: src_neuron,
                size: matrix.nrows(),
            });
        }
        matrix[[src_neuron, neuron]] = weight;
        Ok(())
    }

    pub fn weight(&self, src: usize, src_neuron: usize, neuron: usize) -> Result<f64> {
        let matrix = self.weights.get(&src).ok_or(GraphError::MissingWeights {
            src,
            dst: self.index,
        })?;
        Ok(matrix[[src_neuron, neuron]])
    }

    /// The full weight matrix from `src` (source width x own size).
    pub fn weight_matrix(&self, src: usize) -> Result<&Array2<f64>> {
        self.weights.get(&src).ok_or(GraphError::MissingWeights {
            src,
            dst: self.index,
        })
    }

    /// Weight matrix with negative entries zeroed.
    pub fn positive_weights(&self, src: usize) -> Result<Array2<f64>> {
        Ok(self.weight_matrix(src)?.mapv(|w| if w > 0.0 { w } else { 0.0 }))
    }

    /// Weight matrix with positive entries zeroed.
    pub fn negative_weights(&self, src: usize) -> Result<Array2<f64>> {
        Ok(self.weight_matrix(src)?.mapv(|w| if w < 0.0 { w } else { 0.0 }))
    }

    pub fn set_bias(&mut self, neuron: usize, bias: f64) -> Result<()> {
        self.check_neuron(neuron)?;
        self.bias[neuron] = bias;
        Ok(())
    }

    pub fn bias(&self, neuron: usize) -> f64 {
        self.bias[neuron]
    }

    pub fn biases(&self) -> &[f64] {
        &self.bias
    }

    pub fn add_activation_source(&mut self, src: NeuronRef, neuron: usize) -> Result<()> {
        self.check_neuron(neuron)?;
        self.activation_sources[neuron].push(src);
        Ok(())
    }

    /// Activation sources of `neuron`, in registration order.
    pub fn activation_sources(&self, neuron: usize) -> &[NeuronRef] {
        &self.activation_sources[neuron]
    }

    /// First activation source of `neuron`; errors when none is registered.
    pub fn first_activation_source(&self, neuron: usize) -> Result<NeuronRef> {
        self.activation_sources[neuron]
            .first()
            .copied()
            .ok_or(GraphError::MissingActivationSource {
                layer: self.index,
                neuron,
            })
    }

    // ------------------------------------------------------------------
    // Variables and elimination
    // ------------------------------------------------------------------

    pub fn set_neuron_variable(&mut self, neuron: usize, variable: usize) -> Result<()> {
        self.check_neuron(neuron)?;
        self.neuron_to_variable.insert(neuron, variable);
        self.variable_to_neuron.insert(variable, neuron);
        Ok(())
    }

    pub fn neuron_has_variable(&self, neuron: usize) -> bool {
        self.neuron_to_variable.contains_key(&neuron)
    }

    pub fn neuron_to_variable(&self, neuron: usize) -> Result<usize> {
        self.neuron_to_variable
            .get(&neuron)
            .copied()
            .ok_or(GraphError::NeuronOutOfRange {
                layer: self.index,
                neuron,
                size: self.size,
            })
    }

    pub fn variable_to_neuron(&self, variable: usize) -> Result<usize> {
        self.variable_to_neuron
            .get(&variable)
            .copied()
            .ok_or(GraphError::UnknownVariable(variable))
    }

    /// Pin `neuron` to `value`: it leaves the variable maps and produces the
    /// constant everywhere it is referenced.
    pub fn eliminate_neuron(&mut self, neuron: usize, value: f64) -> Result<()> {
        self.check_neuron(neuron)?;
        if let Some(variable) = self.neuron_to_variable.remove(&neuron) {
            self.variable_to_neuron.remove(&variable);
        }
        self.eliminated.insert(neuron, value);
        self.lb[neuron] = value;
        self.ub[neuron] = value;
        Ok(())
    }

    pub fn neuron_eliminated(&self, neuron: usize) -> bool {
        self.eliminated.contains_key(&neuron)
    }

    pub fn eliminated_value(&self, neuron: usize) -> Option<f64> {
        self.eliminated.get(&neuron).copied()
    }

    // ------------------------------------------------------------------
    // Bounds
    // ------------------------------------------------------------------

    pub fn lb(&self, neuron: usize) -> f64 {
        self.lb[neuron]
    }

    pub fn ub(&self, neuron: usize) -> f64 {
        self.ub[neuron]
    }

    pub fn lbs(&self) -> &[f64] {
        &self.lb
    }

    pub fn ubs(&self) -> &[f64] {
        &self.ub
    }

    /// Refine the lower bound of `neuron`. Returns `Ok(true)` when the bound
    /// was tightened, `Ok(false)` when the update was not a tightening (it
    /// is then ignored), and an error when the tightened interval is empty
    /// beyond the comparison tolerance.
    pub fn set_lb(&mut self, neuron: usize, value: f64) -> Result<bool> {
        self.check_neuron(neuron)?;
        if value <= self.lb[neuron] {
            return Ok(false);
        }
        if !tolerance::lte(value, self.ub[neuron]) {
            return Err(GraphError::EmptyInterval {
                layer: self.index,
                neuron,
                lb: value,
                ub: self.ub[neuron],
            });
        }
        self.lb[neuron] = value;
        Ok(true)
    }

    /// Refine the upper bound of `neuron`; mirror of [`Layer::set_lb`].
    pub fn set_ub(&mut self, neuron: usize, value: f64) -> Result<bool> {
        self.check_neuron(neuron)?;
        if value >= self.ub[neuron] {
            return Ok(false);
        }
        if !tolerance::gte(value, self.lb[neuron]) {
            return Err(GraphError::EmptyInterval {
                layer: self.index,
                neuron,
                lb: self.lb[neuron],
                ub: value,
            });
        }
        self.ub[neuron] = value;
        Ok(true)
    }

    /// Overwrite both bounds without the refine-only check. Reserved for
    /// seeding a freshly built graph from the verifier's bound store.
    pub fn overwrite_bounds(&mut self, neuron: usize, lb: f64, ub: f64) -> Result<()> {
        self.check_neuron(neuron)?;
        self.lb[neuron] = lb;
        self.ub[neuron] = ub;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assignment and simulations
    // ------------------------------------------------------------------

    pub fn set_assignment(&mut self, values: Vec<f64>) -> Result<()> {
        if values.len() != self.size {
            return Err(GraphError::WidthMismatch {
                layer: self.index,
                declared: self.size,
                actual: values.len(),
            });
        }
        self.assignment = Some(values);
        Ok(())
    }

    pub fn assignment(&self) -> Option<&[f64]> {
        self.assignment.as_deref()
    }

    pub(crate) fn assignment_mut(&mut self) -> &mut Option<Vec<f64>> {
        &mut self.assignment
    }

    pub fn set_simulations(&mut self, samples: Vec<Vec<f64>>) -> Result<()> {
        if samples.len() != self.size {
            return Err(GraphError::WidthMismatch {
                layer: self.index,
                declared: self.size,
                actual: samples.len(),
            });
        }
        self.simulations = Some(samples);
        Ok(())
    }

    pub fn simulations(&self) -> Option<&Vec<Vec<f64>>> {
        self.simulations.as_ref()
    }

    pub(crate) fn simulations_mut(&mut self) -> &mut Option<Vec<Vec<f64>>> {
        &mut self.simulations
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Layer {} ({}), size {}:", self.index, self.kind, self.size)?;
        for i in 0..self.size {
            if let Some(value) = self.eliminated_value(i) {
                writeln!(f, "  neuron {}: eliminated at {}", i, value)?;
            } else {
                writeln!(f, "  neuron {}: [{}, {}]", i, self.lb[i], self.ub[i])?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted_layer() -> Layer {
        let mut layer = Layer::new(1, LayerKind::WeightedSum, 2);
        layer.add_source_layer(0, 3);
        layer
    }

    #[test]
    fn weights_are_indexed_source_row_target_column() {
        let mut layer = weighted_layer();
        layer.set_weight(0, 2, 1, -3.5).unwrap();
        assert_eq!(layer.weight(0, 2, 1).unwrap(), -3.5);
        assert_eq!(layer.weight(0, 0, 0).unwrap(), 0.0);
        assert_eq!(layer.weight_matrix(0).unwrap().dim(), (3, 2));
    }

    #[test]
    fn positive_negative_split_covers_matrix() {
        let mut layer = weighted_layer();
        layer.set_weight(0, 0, 0, 2.0).unwrap();
        layer.set_weight(0, 1, 0, -1.0).unwrap();
        let pos = layer.positive_weights(0).unwrap();
        let neg = layer.negative_weights(0).unwrap();
        assert_eq!(pos[[0, 0]], 2.0);
        assert_eq!(pos[[1, 0]], 0.0);
        assert_eq!(neg[[1, 0]], -1.0);
        assert_eq!(&pos + &neg, *layer.weight_matrix(0).unwrap());
    }

    #[test]
    fn bounds_refine_monotonically() {
        let mut layer = Layer::new(0, LayerKind::Input, 1);
        layer.overwrite_bounds(0, -10.0, 10.0).unwrap();
        assert!(layer.set_lb(0, -5.0).unwrap());
        assert!(!layer.set_lb(0, -7.0).unwrap()); // loosening ignored
        assert_eq!(layer.lb(0), -5.0);
        assert!(layer.set_ub(0, 3.0).unwrap());
        assert!(!layer.set_ub(0, 4.0).unwrap());
        assert_eq!(layer.ub(0), 3.0);
    }

    #[test]
    fn crossing_bounds_reports_empty_interval() {
        let mut layer = Layer::new(0, LayerKind::Input, 1);
        layer.overwrite_bounds(0, -1.0, 1.0).unwrap();
        let err = layer.set_lb(0, 2.0).unwrap_err();
        assert!(err.is_infeasible());
    }

    #[test]
    fn elimination_removes_variable_and_pins_bounds() {
        let mut layer = Layer::new(2, LayerKind::Relu, 2);
        layer.set_neuron_variable(0, 7).unwrap();
        layer.set_neuron_variable(1, 8).unwrap();
        layer.eliminate_neuron(0, 0.25).unwrap();
        assert!(layer.neuron_eliminated(0));
        assert_eq!(layer.eliminated_value(0), Some(0.25));
        assert!(!layer.neuron_has_variable(0));
        assert!(layer.variable_to_neuron(7).is_err());
        assert_eq!(layer.lb(0), 0.25);
        assert_eq!(layer.ub(0), 0.25);
        // the sibling neuron is untouched
        assert_eq!(layer.neuron_to_variable(1).unwrap(), 8);
    }

    #[test]
    fn variable_round_trip() {
        let mut layer = Layer::new(3, LayerKind::Sigmoid, 4);
        for neuron in 0..4 {
            layer.set_neuron_variable(neuron, 10 + neuron).unwrap();
        }
        for neuron in 0..4 {
            let variable = layer.neuron_to_variable(neuron).unwrap();
            assert_eq!(layer.variable_to_neuron(variable).unwrap(), neuron);
        }
    }
}
