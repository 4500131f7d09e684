// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Encoding a layer graph (or a neighborhood of it) as an LP whose
//! feasible region over-approximates the network's input/output relation.
//!
//! Two horizons are supported: the forward prefix `[0, last_layer]`, and a
//! backward ball grown over successor edges from a target layer up to a
//! configured depth. In the backward case, variables for neurons outside
//! the ball are created on demand with the layer's current bounds; variable
//! creation is idempotent via the oracle's contains-variable query.
//!
//! Every activation emits its fixed-phase equality when the source bounds
//! force a phase, and its relaxation inequalities otherwise. When per-layer
//! steering coefficients are supplied, the piecewise-linear activations
//! emit the parameterised variants instead.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::AHashMap;

use veribound_deeppoly::softmax::{
    d_er_lower_bound, d_er_upper_bound, d_lse_lower_bound, d_lse_lower_bound2, d_lse_upper_bound,
    er_lower_bound, er_upper_bound, lse_lower_bound, lse_lower_bound2, lse_upper_bound,
};
use veribound_deeppoly::SoftmaxBoundKind;
use veribound_graph::eval::softmax_output_index;
use veribound_graph::interval::{
    bilinear_corner_interval, softmax_linear_lower_bound, softmax_linear_upper_bound,
};
use veribound_graph::{
    tolerance, BoundKind, Layer, LayerGraph, LayerKind, NeuronRef, PolygonalTightening,
};

use crate::error::{LpError, Result};
use crate::oracle::{variable_name, LpOracle, Term};

/// Configuration of the relaxation encoding.
#[derive(Debug, Clone)]
pub struct RelaxationOptions {
    pub softmax_bound_kind: SoftmaxBoundKind,
    /// Steering coefficients for the parameterised piecewise-linear
    /// relaxations, keyed by layer index; layers without an entry use the
    /// standard relaxation.
    pub layer_parameters: AHashMap<usize, Vec<f64>>,
    /// Radius of the backward ball.
    pub backward_depth: usize,
    /// Threshold on softmax output lower bounds past which the LSE2 lower
    /// face replaces the LSE one.
    pub lse2_threshold: f64,
    /// Widening applied to softmax source intervals before computing
    /// envelope faces.
    pub comparison_epsilon: f64,
}

impl Default for RelaxationOptions {
    fn default() -> Self {
        Self {
            softmax_bound_kind: SoftmaxBoundKind::default(),
            layer_parameters: AHashMap::new(),
            backward_depth: 2,
            lse2_threshold: 1e-2,
            comparison_epsilon: tolerance::DEFAULT_EPSILON,
        }
    }
}

/// Emits LP variables and constraints for a graph under one horizon.
pub struct RelaxationBuilder<'g> {
    graph: &'g LayerGraph,
    options: &'g RelaxationOptions,
}

impl<'g> RelaxationBuilder<'g> {
    pub fn new(graph: &'g LayerGraph, options: &'g RelaxationOptions) -> Self {
        Self { graph, options }
    }

    /// Encode the forward prefix `[0, last_layer]`.
    pub fn build_forward(
        &self,
        oracle: &mut dyn LpOracle,
        last_layer: usize,
        polygonal: &[PolygonalTightening],
    ) -> Result<()> {
        for (index, layer) in self.graph.layers() {
            if index > last_layer {
                continue;
            }
            self.add_layer(oracle, layer, false)?;
        }
        self.add_polygonal(oracle, 0, last_layer, polygonal)
    }

    /// Encode the backward ball grown from `first_layer` over successor
    /// edges, up to the configured depth.
    pub fn build_backward(
        &self,
        oracle: &mut dyn LpOracle,
        first_layer: usize,
        polygonal: &[PolygonalTightening],
    ) -> Result<()> {
        let mut heap = BinaryHeap::new();
        let mut layer_to_depth: AHashMap<usize, usize> = AHashMap::new();
        heap.push(Reverse(first_layer));
        layer_to_depth.insert(first_layer, 0);
        let mut last_added = first_layer;
        while let Some(Reverse(current)) = heap.pop() {
            let depth = layer_to_depth[&current];
            if depth > self.options.backward_depth {
                continue;
            }
            let layer = self.graph.layer(current)?;
            self.add_layer(oracle, layer, true)?;
            last_added = last_added.max(current);
            for successor in self.graph.successors(current) {
                if !layer_to_depth.contains_key(&successor) {
                    layer_to_depth.insert(successor, depth + 1);
                    heap.push(Reverse(successor));
                }
            }
        }
        self.add_polygonal(oracle, first_layer, last_added, polygonal)
    }

    /// Emit one layer's variables and constraints.
    pub fn add_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        match layer.kind() {
            LayerKind::Input => self.add_input_layer(oracle, layer),
            LayerKind::WeightedSum => self.add_weighted_sum_layer(oracle, layer, create_variables),
            LayerKind::Relu => match self.parameters_for(layer, 1)? {
                Some(coefficients) => {
                    self.add_relu_layer_parameterised(oracle, layer, create_variables, coefficients)
                }
                None => self.add_relu_layer(oracle, layer, create_variables),
            },
            LayerKind::LeakyRelu => match self.parameters_for(layer, 1)? {
                Some(coefficients) => self.add_leaky_relu_layer_parameterised(
                    oracle,
                    layer,
                    create_variables,
                    coefficients,
                ),
                None => self.add_leaky_relu_layer(oracle, layer, create_variables),
            },
            LayerKind::Sign => match self.parameters_for(layer, 2)? {
                Some(coefficients) => {
                    self.add_sign_layer_parameterised(oracle, layer, create_variables, coefficients)
                }
                None => self.add_sign_layer(oracle, layer, create_variables),
            },
            LayerKind::Bilinear => match self.parameters_for(layer, 2)? {
                Some(coefficients) => self.add_bilinear_layer_parameterised(
                    oracle,
                    layer,
                    create_variables,
                    coefficients,
                ),
                None => self.add_bilinear_layer(oracle, layer, create_variables),
            },
            LayerKind::AbsoluteValue => {
                self.add_absolute_value_layer(oracle, layer, create_variables)
            }
            LayerKind::Round => self.add_round_layer(oracle, layer, create_variables),
            LayerKind::Sigmoid => self.add_sigmoid_layer(oracle, layer, create_variables),
            LayerKind::Max => self.add_max_layer(oracle, layer, create_variables),
            LayerKind::Softmax => self.add_softmax_layer(oracle, layer, create_variables),
        }
    }

    fn parameters_for(&self, layer: &Layer, expected: usize) -> Result<Option<&[f64]>> {
        let Some(coefficients) = self.options.layer_parameters.get(&layer.index()) else {
            return Ok(None);
        };
        if coefficients.len() < expected {
            return Err(LpError::ParameterArity {
                layer: layer.index(),
                expected,
                actual: coefficients.len(),
            });
        }
        for &value in &coefficients[..expected] {
            if !(0.0..=1.0).contains(&value) {
                return Err(LpError::ParameterOutOfRange {
                    layer: layer.index(),
                    value,
                });
            }
        }
        Ok(Some(coefficients.as_slice()))
    }

    fn add_input_layer(&self, oracle: &mut dyn LpOracle, layer: &Layer) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let name = variable_name(layer.neuron_to_variable(i)?);
            oracle.add_variable(&name, layer.lb(i), layer.ub(i));
        }
        Ok(())
    }

    fn add_weighted_sum_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        if create_variables {
            for src in layer.sorted_source_layers() {
                let source_layer = self.graph.layer(src)?;
                for j in 0..source_layer.size() {
                    if source_layer.neuron_eliminated(j) {
                        continue;
                    }
                    let name = variable_name(source_layer.neuron_to_variable(j)?);
                    if !oracle.contains_variable(&name) {
                        oracle.add_variable(&name, source_layer.lb(j), source_layer.ub(j));
                    }
                }
            }
        }

        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let name = variable_name(layer.neuron_to_variable(i)?);
            oracle.add_variable(&name, layer.lb(i), layer.ub(i));

            let mut terms = vec![Term::new(-1.0, name.as_str())];
            let mut scalar = -layer.bias(i);
            for src in layer.sorted_source_layers() {
                let source_layer = self.graph.layer(src)?;
                let weights = layer.weight_matrix(src)?;
                for j in 0..weights.nrows() {
                    let weight = weights[[j, i]];
                    if let Some(value) = source_layer.eliminated_value(j) {
                        scalar -= weight * value;
                    } else {
                        let source_name = variable_name(source_layer.neuron_to_variable(j)?);
                        terms.push(Term::new(weight, source_name.as_str()));
                    }
                }
            }
            oracle.add_eq_constraint(&terms, scalar);
        }
        Ok(())
    }

    /// The single activation source of `neuron`, with its variable created
    /// on demand. Returns `None` when the source is eliminated, in which
    /// case the caller pins the target to `fixed(value)`.
    #[allow(clippy::type_complexity)]
    fn activation_source(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        neuron: usize,
        create_variables: bool,
    ) -> Result<std::result::Result<(String, f64, f64), f64>> {
        let source = layer.first_activation_source(neuron)?;
        let source_layer = self.graph.layer(source.layer)?;
        if let Some(value) = source_layer.eliminated_value(source.neuron) {
            return Ok(Err(value));
        }
        let name = variable_name(source_layer.neuron_to_variable(source.neuron)?);
        let lb = source_layer.lb(source.neuron);
        let ub = source_layer.ub(source.neuron);
        if create_variables && !oracle.contains_variable(&name) {
            oracle.add_variable(&name, lb, ub);
        }
        Ok(Ok((name, lb, ub)))
    }

    fn add_relu_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = value.max(0.0);
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            oracle.add_variable(&target, 0.0, layer.ub(i));

            if !tolerance::is_negative(source_lb) {
                // Active: y = x.
                oracle.add_eq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
            } else if !tolerance::is_positive(source_ub) {
                // Inactive: y = 0.
                oracle.add_eq_constraint(&[Term::new(1.0, target.as_str())], 0.0);
            } else {
                // Triangular relaxation: y >= 0, y >= x, and y below the
                // line through (lb, 0) and (ub, ub).
                oracle.add_geq_constraint(&[Term::new(1.0, target.as_str())], 0.0);
                oracle.add_geq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-source_ub / (source_ub - source_lb), source.as_str()),
                    ],
                    -source_ub * source_lb / (source_ub - source_lb),
                );
            }
        }
        Ok(())
    }

    fn add_relu_layer_parameterised(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
        coefficients: &[f64],
    ) -> Result<()> {
        let coefficient = coefficients[0];
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = value.max(0.0);
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            oracle.add_variable(&target, 0.0, layer.ub(i));

            if !tolerance::is_negative(source_lb) {
                oracle.add_eq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
            } else if !tolerance::is_positive(source_ub) {
                oracle.add_eq_constraint(&[Term::new(1.0, target.as_str())], 0.0);
            } else {
                oracle.add_geq_constraint(&[Term::new(1.0, target.as_str())], 0.0);
                oracle.add_geq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
                // Varies continuously between y >= 0 and y >= x.
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-coefficient, source.as_str()),
                    ],
                    0.0,
                );
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-source_ub / (source_ub - source_lb), source.as_str()),
                    ],
                    -source_ub * source_lb / (source_ub - source_lb),
                );
            }
        }
        Ok(())
    }

    fn add_leaky_relu_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        let slope = layer.alpha();
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = if value > 0.0 { value } else { slope * value };
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            oracle.add_variable(&target, layer.lb(i), layer.ub(i));

            if !tolerance::is_negative(source_lb) {
                oracle.add_eq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
            } else if !tolerance::is_positive(source_ub) {
                oracle.add_eq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-slope, source.as_str()),
                    ],
                    0.0,
                );
            } else {
                let width = source_ub - source_lb;
                let upper_slope = (source_ub - slope * source_lb) / width;
                let upper_bias = (slope - 1.0) * source_ub * source_lb / width;

                // y >= alpha x, y >= x, and y below the line through
                // (lb, alpha lb) and (ub, ub).
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-slope, source.as_str()),
                    ],
                    0.0,
                );
                oracle.add_geq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-upper_slope, source.as_str()),
                    ],
                    upper_bias,
                );
            }
        }
        Ok(())
    }

    fn add_leaky_relu_layer_parameterised(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
        coefficients: &[f64],
    ) -> Result<()> {
        let slope = layer.alpha();
        let coefficient = coefficients[0];
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = if value > 0.0 { value } else { slope * value };
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            oracle.add_variable(&target, layer.lb(i), layer.ub(i));

            if !tolerance::is_negative(source_lb) {
                oracle.add_eq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
            } else if !tolerance::is_positive(source_ub) {
                oracle.add_eq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-slope, source.as_str()),
                    ],
                    0.0,
                );
            } else {
                let width = source_ub - source_lb;
                let upper_slope = (source_ub - slope * source_lb) / width;
                let upper_bias = (slope - 1.0) * source_ub * source_lb / width;

                // Varies continuously between y >= alpha x and y >= x.
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-slope - (1.0 - slope) * coefficient, source.as_str()),
                    ],
                    0.0,
                );
                oracle.add_geq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-slope, source.as_str()),
                    ],
                    0.0,
                );
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-upper_slope, source.as_str()),
                    ],
                    upper_bias,
                );
            }
        }
        Ok(())
    }

    fn add_absolute_value_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = value.abs();
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            if !tolerance::is_negative(source_lb) {
                let lb = source_lb.max(0.0).max(layer.lb(i));
                let ub = source_ub.min(layer.ub(i));
                oracle.add_variable(&target, lb, ub);
                oracle.add_eq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.0,
                );
            } else if !tolerance::is_positive(source_ub) {
                let lb = (-source_ub).max(layer.lb(i));
                let ub = (-source_lb).min(layer.ub(i));
                oracle.add_variable(&target, lb, ub);
                // Negative phase: y = -x.
                oracle.add_eq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(1.0, source.as_str())],
                    0.0,
                );
            } else {
                let ub = (-source_lb).max(source_ub).min(layer.ub(i));
                let lb = 0.0_f64.max(layer.lb(i));
                oracle.add_variable(&target, lb, ub);
                oracle.add_geq_constraint(&[Term::new(1.0, target.as_str())], 0.0);
                oracle.add_leq_constraint(&[Term::new(1.0, target.as_str())], ub);
            }
        }
        Ok(())
    }

    fn add_sign_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = if tolerance::is_negative(value) { -1.0 } else { 1.0 };
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            if !tolerance::is_negative(source_lb) {
                oracle.add_variable(&target, 1.0, 1.0);
            } else if tolerance::is_negative(source_ub) {
                oracle.add_variable(&target, -1.0, -1.0);
            } else {
                // Parallelogram relaxation: -1 <= y <= 1, y below the line
                // through (lb, -1) and (0, 1), y above the line through
                // (0, -1) and (ub, 1).
                oracle.add_variable(&target, -1.0, 1.0);
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(2.0 / source_lb, source.as_str()),
                    ],
                    1.0,
                );
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-2.0 / source_ub, source.as_str()),
                    ],
                    -1.0,
                );
            }
        }
        Ok(())
    }

    fn add_sign_layer_parameterised(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
        coefficients: &[f64],
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = if tolerance::is_negative(value) { -1.0 } else { 1.0 };
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            if !tolerance::is_negative(source_lb) {
                oracle.add_variable(&target, 1.0, 1.0);
            } else if tolerance::is_negative(source_ub) {
                oracle.add_variable(&target, -1.0, -1.0);
            } else {
                oracle.add_variable(&target, -1.0, 1.0);
                // Faces scaled by the steering coefficients; each varies
                // continuously between the horizontal bound and the full
                // slanted face.
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(2.0 / source_lb * coefficients[0], source.as_str()),
                    ],
                    1.0,
                );
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-2.0 / source_ub * coefficients[1], source.as_str()),
                    ],
                    -1.0,
                );
            }
        }
        Ok(())
    }

    fn add_round_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = tolerance::round(value);
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            let ub = tolerance::round(source_ub).min(layer.ub(i));
            let lb = tolerance::round(source_lb).max(layer.lb(i));
            oracle.add_variable(&target, lb, ub);

            if tolerance::are_equal(source_lb, source_ub) {
                oracle.add_eq_constraint(&[Term::new(1.0, target.as_str())], ub);
            } else {
                // y - x in [-1/2, 1/2].
                oracle.add_leq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    0.5,
                );
                oracle.add_geq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, source.as_str())],
                    -0.5,
                );
            }
        }
        Ok(())
    }

    fn add_sigmoid_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let (source, source_lb, source_ub) =
                match self.activation_source(oracle, layer, i, create_variables)? {
                    Err(value) => {
                        let fixed = tolerance::sigmoid(value);
                        oracle.add_variable(&target, fixed, fixed);
                        continue;
                    }
                    Ok(source) => source,
                };

            let sigmoid_lb = tolerance::sigmoid(source_lb);
            let sigmoid_ub = tolerance::sigmoid(source_ub);
            let ub = sigmoid_ub.min(layer.ub(i));
            let lb = sigmoid_lb.max(layer.lb(i));
            oracle.add_variable(&target, lb, ub);

            if tolerance::are_equal(source_lb, source_ub) {
                oracle.add_eq_constraint(&[Term::new(1.0, target.as_str())], ub);
                continue;
            }

            let lambda = (ub - lb) / (source_ub - source_lb);
            let lambda_prime = tolerance::sigmoid_derivative(source_lb)
                .min(tolerance::sigmoid_derivative(source_ub));

            // Lower face: the chord when the source is positive, the
            // flatter tangent otherwise.
            if tolerance::is_positive(source_lb) {
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-lambda, source.as_str()),
                    ],
                    sigmoid_lb - source_lb * lambda,
                );
            } else {
                oracle.add_geq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-lambda_prime, source.as_str()),
                    ],
                    sigmoid_lb - source_lb * lambda_prime,
                );
            }

            // Upper face, symmetric.
            if !tolerance::is_positive(source_ub) {
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-lambda, source.as_str()),
                    ],
                    sigmoid_ub - source_ub * lambda,
                );
            } else {
                oracle.add_leq_constraint(
                    &[
                        Term::new(1.0, target.as_str()),
                        Term::new(-lambda_prime, source.as_str()),
                    ],
                    sigmoid_ub - source_ub * lambda_prime,
                );
            }
        }
        Ok(())
    }

    fn add_max_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            oracle.add_variable(&target, layer.lb(i), layer.ub(i));

            let mut have_fixed = false;
            let mut max_fixed = f64::NEG_INFINITY;
            let mut max_concrete_ub = f64::NEG_INFINITY;

            for source in layer.activation_sources(i) {
                let source_layer = self.graph.layer(source.layer)?;
                if let Some(value) = source_layer.eliminated_value(source.neuron) {
                    have_fixed = true;
                    max_fixed = max_fixed.max(value);
                    continue;
                }
                let name = variable_name(source_layer.neuron_to_variable(source.neuron)?);
                let source_lb = source_layer.lb(source.neuron);
                let source_ub = source_layer.ub(source.neuron);
                if create_variables && !oracle.contains_variable(&name) {
                    oracle.add_variable(&name, source_lb, source_ub);
                }

                // Target is at least each source.
                oracle.add_geq_constraint(
                    &[Term::new(1.0, target.as_str()), Term::new(-1.0, name.as_str())],
                    0.0,
                );
                max_concrete_ub = max_concrete_ub.max(source_ub);
            }

            if have_fixed && max_concrete_ub < max_fixed {
                // A pinned source dominates every live one.
                oracle.add_eq_constraint(&[Term::new(1.0, target.as_str())], max_fixed);
            } else {
                if have_fixed {
                    oracle.add_geq_constraint(&[Term::new(1.0, target.as_str())], max_fixed);
                }
                oracle.add_leq_constraint(&[Term::new(1.0, target.as_str())], max_concrete_ub);
            }
        }
        Ok(())
    }

    fn add_softmax_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        let eps = self.options.comparison_epsilon;
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let sources = layer.activation_sources(i);
            let index = softmax_output_index(layer, i)?;

            let mut source_lbs = Vec::with_capacity(sources.len());
            let mut source_ubs = Vec::with_capacity(sources.len());
            let mut source_mids = Vec::with_capacity(sources.len());
            let mut target_lbs = Vec::with_capacity(sources.len());
            let mut target_ubs = Vec::with_capacity(sources.len());
            let mut source_names = Vec::with_capacity(sources.len());
            for source in sources {
                let source_layer = self.graph.layer(source.layer)?;
                let name = variable_name(source_layer.neuron_to_variable(source.neuron)?);
                let source_lb = source_layer.lb(source.neuron);
                let source_ub = source_layer.ub(source.neuron);
                if create_variables && !oracle.contains_variable(&name) {
                    oracle.add_variable(&name, source_lb, source_ub);
                }
                source_lbs.push(source_lb - eps);
                source_ubs.push(source_ub + eps);
                source_mids.push((source_lb + source_ub) / 2.0);
                target_lbs.push(layer.lb(i));
                target_ubs.push(layer.ub(i));
                source_names.push(name);
            }

            let ub = softmax_linear_upper_bound(&source_lbs, &source_ubs, index).min(layer.ub(i));
            let lb = softmax_linear_lower_bound(&source_lbs, &source_ubs, index).max(layer.lb(i));
            target_lbs[index] = lb;
            target_ubs[index] = ub;

            let target = variable_name(layer.neuron_to_variable(i)?);
            oracle.add_variable(&target, lb, ub);

            if tolerance::are_equal(lb, ub) {
                oracle.add_eq_constraint(&[Term::new(1.0, target.as_str())], ub);
                continue;
            }

            match self.options.softmax_bound_kind {
                SoftmaxBoundKind::LogSumExp => {
                    let use_lse2 = target_lbs
                        .iter()
                        .any(|&value| value > self.options.lse2_threshold);

                    let mut terms = vec![Term::new(1.0, target.as_str())];
                    let mut scalar = if use_lse2 {
                        lse_lower_bound2(&source_mids, &source_lbs, &source_ubs, index)
                    } else {
                        lse_lower_bound(&source_mids, &source_lbs, &source_ubs, index)
                    };
                    for (input_index, name) in source_names.iter().enumerate() {
                        let derivative = if use_lse2 {
                            d_lse_lower_bound2(
                                &source_mids,
                                &source_lbs,
                                &source_ubs,
                                index,
                                input_index,
                            )
                        } else {
                            d_lse_lower_bound(
                                &source_mids,
                                &source_lbs,
                                &source_ubs,
                                index,
                                input_index,
                            )
                        };
                        terms.push(Term::new(-derivative, name.as_str()));
                        scalar -= derivative * source_mids[input_index];
                    }
                    oracle.add_geq_constraint(&terms, scalar);

                    let mut terms = vec![Term::new(1.0, target.as_str())];
                    let mut scalar = lse_upper_bound(&source_mids, &target_lbs, &target_ubs, index);
                    for (input_index, name) in source_names.iter().enumerate() {
                        let derivative = d_lse_upper_bound(
                            &source_mids,
                            &target_lbs,
                            &target_ubs,
                            index,
                            input_index,
                        );
                        terms.push(Term::new(-derivative, name.as_str()));
                        scalar -= derivative * source_mids[input_index];
                    }
                    oracle.add_leq_constraint(&terms, scalar);
                }
                SoftmaxBoundKind::ExponentialReciprocal => {
                    let mut terms = vec![Term::new(1.0, target.as_str())];
                    let mut scalar = er_lower_bound(&source_mids, &source_lbs, &source_ubs, index);
                    for (input_index, name) in source_names.iter().enumerate() {
                        let derivative = d_er_lower_bound(
                            &source_mids,
                            &source_lbs,
                            &source_ubs,
                            index,
                            input_index,
                        );
                        terms.push(Term::new(-derivative, name.as_str()));
                        scalar -= derivative * source_mids[input_index];
                    }
                    oracle.add_geq_constraint(&terms, scalar);

                    let mut terms = vec![Term::new(1.0, target.as_str())];
                    let mut scalar = er_upper_bound(&source_mids, &source_lbs, &source_ubs, index);
                    for (input_index, name) in source_names.iter().enumerate() {
                        let derivative = d_er_upper_bound(
                            &source_mids,
                            &source_lbs,
                            &source_ubs,
                            index,
                            input_index,
                        );
                        terms.push(Term::new(-derivative, name.as_str()));
                        scalar -= derivative * source_mids[input_index];
                    }
                    oracle.add_leq_constraint(&terms, scalar);
                }
            }
        }
        Ok(())
    }

    fn bilinear_sources(
        &self,
        layer: &Layer,
        neuron: usize,
    ) -> Result<((NeuronRef, Option<f64>, f64, f64), (NeuronRef, Option<f64>, f64, f64))> {
        let sources = layer.activation_sources(neuron);
        if sources.len() != 2 {
            return Err(LpError::Graph(
                veribound_graph::GraphError::MissingActivationSource {
                    layer: layer.index(),
                    neuron,
                },
            ));
        }
        let mut resolved = Vec::with_capacity(2);
        for &source in sources {
            let source_layer = self.graph.layer(source.layer)?;
            let fixed = source_layer.eliminated_value(source.neuron);
            let (lb, ub) = self.graph.source_interval(source)?;
            resolved.push((source, fixed, lb, ub));
        }
        Ok((resolved[0], resolved[1]))
    }

    fn add_bilinear_layer(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
    ) -> Result<()> {
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let ((a, a_fixed, a_lb, a_ub), (b, b_fixed, b_lb, b_ub)) =
                self.bilinear_sources(layer, i)?;

            match (a_fixed, b_fixed) {
                (Some(x), Some(y)) => {
                    oracle.add_variable(&target, x * y, x * y);
                }
                (Some(x), None) => {
                    let name = self.ensure_source_variable(oracle, b, create_variables)?;
                    let (lb, ub) = bilinear_corner_interval((x, x), (b_lb, b_ub));
                    oracle.add_variable(&target, lb, ub);
                    oracle.add_eq_constraint(
                        &[Term::new(1.0, target.as_str()), Term::new(-x, name.as_str())],
                        0.0,
                    );
                }
                (None, Some(y)) => {
                    let name = self.ensure_source_variable(oracle, a, create_variables)?;
                    let (lb, ub) = bilinear_corner_interval((a_lb, a_ub), (y, y));
                    oracle.add_variable(&target, lb, ub);
                    oracle.add_eq_constraint(
                        &[Term::new(1.0, target.as_str()), Term::new(-y, name.as_str())],
                        0.0,
                    );
                }
                (None, None) => {
                    let a_name = self.ensure_source_variable(oracle, a, create_variables)?;
                    let b_name = self.ensure_source_variable(oracle, b, create_variables)?;
                    let (lb, ub) = bilinear_corner_interval((a_lb, a_ub), (b_lb, b_ub));
                    oracle.add_variable(&target, lb, ub);

                    // McCormick envelopes anchored at the lower corner.
                    oracle.add_geq_constraint(
                        &[
                            Term::new(1.0, target.as_str()),
                            Term::new(-b_lb, a_name.as_str()),
                            Term::new(-a_lb, b_name.as_str()),
                        ],
                        -a_lb * b_lb,
                    );
                    oracle.add_leq_constraint(
                        &[
                            Term::new(1.0, target.as_str()),
                            Term::new(-b_ub, a_name.as_str()),
                            Term::new(-a_lb, b_name.as_str()),
                        ],
                        -a_lb * b_ub,
                    );
                }
            }
        }
        Ok(())
    }

    fn add_bilinear_layer_parameterised(
        &self,
        oracle: &mut dyn LpOracle,
        layer: &Layer,
        create_variables: bool,
        coefficients: &[f64],
    ) -> Result<()> {
        let (c0, c1) = (coefficients[0], coefficients[1]);
        for i in 0..layer.size() {
            if layer.neuron_eliminated(i) {
                continue;
            }
            let target = variable_name(layer.neuron_to_variable(i)?);
            let ((a, a_fixed, a_lb, a_ub), (b, b_fixed, b_lb, b_ub)) =
                self.bilinear_sources(layer, i)?;

            match (a_fixed, b_fixed) {
                (Some(x), Some(y)) => {
                    oracle.add_variable(&target, x * y, x * y);
                    continue;
                }
                (Some(x), None) => {
                    let name = self.ensure_source_variable(oracle, b, create_variables)?;
                    let (lb, ub) = bilinear_corner_interval((x, x), (b_lb, b_ub));
                    oracle.add_variable(&target, lb, ub);
                    oracle.add_eq_constraint(
                        &[Term::new(1.0, target.as_str()), Term::new(-x, name.as_str())],
                        0.0,
                    );
                    continue;
                }
                (None, Some(y)) => {
                    let name = self.ensure_source_variable(oracle, a, create_variables)?;
                    let (lb, ub) = bilinear_corner_interval((a_lb, a_ub), (y, y));
                    oracle.add_variable(&target, lb, ub);
                    oracle.add_eq_constraint(
                        &[Term::new(1.0, target.as_str()), Term::new(-y, name.as_str())],
                        0.0,
                    );
                    continue;
                }
                (None, None) => {}
            }

            let a_name = self.ensure_source_variable(oracle, a, create_variables)?;
            let b_name = self.ensure_source_variable(oracle, b, create_variables)?;
            let (lb, ub) = bilinear_corner_interval((a_lb, a_ub), (b_lb, b_ub));
            oracle.add_variable(&target, lb, ub);

            // Two-coefficient McCormick family: c0 steers the lower face
            // between the two lower envelopes, c1 the upper face.
            oracle.add_geq_constraint(
                &[
                    Term::new(1.0, target.as_str()),
                    Term::new(-c0 * b_lb - (1.0 - c0) * b_ub, a_name.as_str()),
                    Term::new(-c0 * a_lb - (1.0 - c0) * a_ub, b_name.as_str()),
                ],
                -c0 * a_lb * b_lb - (1.0 - c0) * a_ub * b_ub,
            );
            oracle.add_leq_constraint(
                &[
                    Term::new(1.0, target.as_str()),
                    Term::new(-c1 * b_ub - (1.0 - c1) * b_lb, a_name.as_str()),
                    Term::new(-c1 * a_lb - (1.0 - c1) * a_ub, b_name.as_str()),
                ],
                -c1 * a_lb * b_ub - (1.0 - c1) * a_ub * b_lb,
            );
        }
        Ok(())
    }

    fn ensure_source_variable(
        &self,
        oracle: &mut dyn LpOracle,
        source: NeuronRef,
        create_variables: bool,
    ) -> Result<String> {
        let source_layer = self.graph.layer(source.layer)?;
        let name = variable_name(source_layer.neuron_to_variable(source.neuron)?);
        if create_variables && !oracle.contains_variable(&name) {
            oracle.add_variable(
                &name,
                source_layer.lb(source.neuron),
                source_layer.ub(source.neuron),
            );
        }
        Ok(name)
    }

    /// Append the externally supplied polygonal tightenings whose neurons
    /// all lie inside `[first_layer, last_layer]`.
    fn add_polygonal(
        &self,
        oracle: &mut dyn LpOracle,
        first_layer: usize,
        last_layer: usize,
        tightenings: &[PolygonalTightening],
    ) -> Result<()> {
        for tightening in tightenings {
            let out_of_horizon = tightening
                .terms
                .iter()
                .any(|(neuron, _)| neuron.layer < first_layer || neuron.layer > last_layer);
            if out_of_horizon {
                continue;
            }

            let mut scalar = tightening.value;
            let mut terms = Vec::with_capacity(tightening.terms.len());
            for &(neuron, coefficient) in &tightening.terms {
                let layer = self.graph.layer(neuron.layer)?;
                if let Some(value) = layer.eliminated_value(neuron.neuron) {
                    scalar -= coefficient * value;
                    continue;
                }
                let name = variable_name(layer.neuron_to_variable(neuron.neuron)?);
                if !oracle.contains_variable(&name) {
                    oracle.add_variable(&name, layer.lb(neuron.neuron), layer.ub(neuron.neuron));
                }
                terms.push(Term::new(coefficient, name));
            }

            match tightening.kind {
                BoundKind::Upper => oracle.add_leq_constraint(&terms, scalar),
                BoundKind::Lower => oracle.add_geq_constraint(&terms, scalar),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minilp_oracle::MinilpOracle;
    use crate::tightener::optimize;
    use crate::Objective;

    /// x in [-1, 1] -> a = 2x + 1 -> r = relu(a)
    fn relu_graph() -> LayerGraph {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 1).unwrap();
        graph.add_layer(1, LayerKind::WeightedSum, 1).unwrap();
        graph.add_layer(2, LayerKind::Relu, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_dependency(1, 2).unwrap();
        graph.set_weight(0, 0, 1, 0, 2.0).unwrap();
        graph.set_bias(1, 0, 1.0).unwrap();
        graph.add_activation_source(1, 0, 2, 0).unwrap();
        graph.set_neuron_variable(NeuronRef::new(0, 0), 0).unwrap();
        graph.set_neuron_variable(NeuronRef::new(1, 0), 1).unwrap();
        graph.set_neuron_variable(NeuronRef::new(2, 0), 2).unwrap();
        graph
            .layer_mut(0)
            .unwrap()
            .overwrite_bounds(0, -1.0, 1.0)
            .unwrap();
        graph
            .layer_mut(1)
            .unwrap()
            .overwrite_bounds(0, -1.0, 3.0)
            .unwrap();
        graph
            .layer_mut(2)
            .unwrap()
            .overwrite_bounds(0, 0.0, 3.0)
            .unwrap();
        graph
    }

    fn solve(oracle: &mut MinilpOracle, variable: usize, objective: Objective) -> f64 {
        optimize(
            oracle,
            objective,
            &variable_name(variable),
            0.0,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn forward_relaxation_bounds_the_relu_output() {
        let graph = relu_graph();
        let options = RelaxationOptions::default();
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        builder.build_forward(&mut oracle, 2, &[]).unwrap();

        // max relu(2x + 1) over x in [-1, 1] is 3; the triangular
        // relaxation is exact at the corners.
        assert!((solve(&mut oracle, 2, Objective::Maximize) - 3.0).abs() < 1e-6);
        oracle.reset();
        assert!((solve(&mut oracle, 2, Objective::Minimize) - 0.0).abs() < 1e-6);
        // The weighted sum itself reaches -1.
        oracle.reset();
        assert!((solve(&mut oracle, 1, Objective::Minimize) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn backward_ball_creates_out_of_ball_variables_on_demand() {
        let graph = relu_graph();
        let options = RelaxationOptions {
            backward_depth: 2,
            ..Default::default()
        };
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        // Ball around the relu layer: the weighted-sum variable appears
        // only as the relu's on-demand source, with its current bounds.
        builder.build_backward(&mut oracle, 2, &[]).unwrap();
        assert!(oracle.contains_variable("x2"));
        assert!(oracle.contains_variable("x1"));
        assert!(!oracle.contains_variable("x0"));

        // y >= 0 tightens the relu output even though DeepPoly-style
        // reasoning over the box alone would not.
        assert!((solve(&mut oracle, 2, Objective::Minimize) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn variable_creation_is_idempotent() {
        let graph = relu_graph();
        let options = RelaxationOptions::default();
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        let layer = graph.layer(2).unwrap();
        builder.add_layer(&mut oracle, layer, true).unwrap();
        // Adding the same layer again keeps the model solvable and the
        // variables unique.
        builder.add_layer(&mut oracle, layer, true).unwrap();
        assert!((solve(&mut oracle, 2, Objective::Minimize) - 0.0).abs() < 1e-6);
    }

    #[test]
    fn polygonal_tightenings_cut_the_region() {
        let graph = relu_graph();
        let options = RelaxationOptions::default();
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        let cut = PolygonalTightening::upper(vec![(NeuronRef::new(0, 0), 1.0)], 0.25);
        builder.build_forward(&mut oracle, 2, &[cut]).unwrap();
        // x <= 0.25 caps the weighted sum at 1.5.
        assert!((solve(&mut oracle, 1, Objective::Maximize) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn out_of_horizon_polygonal_tightenings_are_dropped() {
        let graph = relu_graph();
        let options = RelaxationOptions::default();
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        let cut = PolygonalTightening::upper(vec![(NeuronRef::new(2, 0), 1.0)], 0.1);
        // Horizon [0, 1] excludes the relu layer, so the cut is ignored.
        builder.build_forward(&mut oracle, 1, &[cut]).unwrap();
        assert!((solve(&mut oracle, 1, Objective::Maximize) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn parameterised_relu_emits_the_steered_face() {
        let graph = relu_graph();
        let mut options = RelaxationOptions::default();
        options.layer_parameters.insert(2, vec![1.0]);
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        builder.build_forward(&mut oracle, 2, &[]).unwrap();
        // With coefficient 1 the lower face is y >= x; minimizing y - x
        // cannot go below zero.
        let y_minus_x = [
            Term::new(1.0, variable_name(2)),
            Term::new(-1.0, variable_name(1)),
        ];
        oracle.set_cost(&y_minus_x);
        oracle.solve().unwrap();
        let mut assignment = ahash::AHashMap::new();
        assert!(oracle.extract_solution(&mut assignment) >= -1e-9);
    }

    #[test]
    fn eliminated_weighted_sum_source_folds_into_the_constant() {
        let mut graph = relu_graph();
        graph.eliminate_neuron(0, 0.5).unwrap();
        let options = RelaxationOptions::default();
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        builder.build_forward(&mut oracle, 1, &[]).unwrap();
        // a = 2 * 0.5 + 1 exactly.
        assert!((solve(&mut oracle, 1, Objective::Maximize) - 2.0).abs() < 1e-6);
        oracle.reset();
        assert!((solve(&mut oracle, 1, Objective::Minimize) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_parameter_is_rejected() {
        let graph = relu_graph();
        let mut options = RelaxationOptions::default();
        options.layer_parameters.insert(2, vec![2.0]);
        let builder = RelaxationBuilder::new(&graph, &options);
        let mut oracle = MinilpOracle::new();
        let err = builder.build_forward(&mut oracle, 2, &[]).unwrap_err();
        assert!(matches!(err, LpError::ParameterOutOfRange { .. }));
    }
}
