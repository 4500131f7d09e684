// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Forward evaluation of the layer graph.
//!
//! [`LayerGraph::compute_assignment`] evaluates every layer point-wise from
//! the input layer's assignment; [`LayerGraph::compute_simulations`] does
//! the same for whole rows of simulation samples. Eliminated neurons
//! contribute their pinned constant wherever they are referenced.

use crate::error::{GraphError, Result};
use crate::graph::LayerGraph;
use crate::layer::Layer;
use crate::tolerance;
use crate::types::{LayerKind, NeuronRef};

/// Position of `neuron`'s own logit within its softmax source group.
///
/// Outputs claim source positions in neuron order: each output takes the
/// first source neuron no earlier output has claimed. For the conventional
/// encoding, where every output lists the full logit group in the same
/// order, output `i` claims position `i`.
pub fn softmax_output_index(layer: &Layer, neuron: usize) -> Result<usize> {
    let mut claimed: Vec<usize> = Vec::new();
    let mut chosen = 0;
    for j in 0..=neuron {
        let sources = layer.activation_sources(j);
        if sources.is_empty() {
            return Err(GraphError::MissingActivationSource {
                layer: layer.index(),
                neuron: j,
            });
        }
        chosen = sources.len() - 1;
        for (position, source) in sources.iter().enumerate() {
            if !claimed.contains(&source.neuron) {
                claimed.push(source.neuron);
                chosen = position;
                break;
            }
        }
    }
    Ok(chosen)
}

impl LayerGraph {
    fn source_value(&self, source: NeuronRef) -> Result<f64> {
        let layer = self.layer(source.layer)?;
        if let Some(value) = layer.eliminated_value(source.neuron) {
            return Ok(value);
        }
        let assignment = layer
            .assignment()
            .ok_or(GraphError::MissingAssignment(source.layer))?;
        Ok(assignment[source.neuron])
    }

    fn source_sample(&self, source: NeuronRef, sample: usize) -> Result<f64> {
        let layer = self.layer(source.layer)?;
        if let Some(value) = layer.eliminated_value(source.neuron) {
            return Ok(value);
        }
        let simulations = layer
            .simulations()
            .ok_or(GraphError::MissingSimulations(source.layer))?;
        Ok(simulations[source.neuron][sample])
    }

    fn evaluate_neuron(
        &self,
        layer: &Layer,
        neuron: usize,
        fetch: &dyn Fn(NeuronRef) -> Result<f64>,
    ) -> Result<f64> {
        if let Some(value) = layer.eliminated_value(neuron) {
            return Ok(value);
        }
        match layer.kind() {
            LayerKind::Input => unreachable!("input layers are not evaluated"),
            LayerKind::WeightedSum => {
                let mut sum = layer.bias(neuron);
                for src in layer.sorted_source_layers() {
                    let matrix = layer.weight_matrix(src)?;
                    for src_neuron in 0..matrix.nrows() {
                        let weight = matrix[[src_neuron, neuron]];
                        if weight != 0.0 {
                            sum += weight * fetch(NeuronRef::new(src, src_neuron))?;
                        }
                    }
                }
                Ok(sum)
            }
            LayerKind::Relu => {
                let x = fetch(layer.first_activation_source(neuron)?)?;
                Ok(x.max(0.0))
            }
            LayerKind::LeakyRelu => {
                let x = fetch(layer.first_activation_source(neuron)?)?;
                Ok(if x >= 0.0 { x } else { layer.alpha() * x })
            }
            LayerKind::AbsoluteValue => {
                let x = fetch(layer.first_activation_source(neuron)?)?;
                Ok(x.abs())
            }
            LayerKind::Sign => {
                let x = fetch(layer.first_activation_source(neuron)?)?;
                Ok(if tolerance::is_negative(x) { -1.0 } else { 1.0 })
            }
            LayerKind::Round => {
                let x = fetch(layer.first_activation_source(neuron)?)?;
                Ok(tolerance::round(x))
            }
            LayerKind::Sigmoid => {
                let x = fetch(layer.first_activation_source(neuron)?)?;
                Ok(tolerance::sigmoid(x))
            }
            LayerKind::Max => {
                let sources = layer.activation_sources(neuron);
                if sources.is_empty() {
                    return Err(GraphError::MissingActivationSource {
                        layer: layer.index(),
                        neuron,
                    });
                }
                let mut best = f64::NEG_INFINITY;
                for source in sources {
                    best = best.max(fetch(*source)?);
                }
                Ok(best)
            }
            LayerKind::Softmax => {
                let sources = layer.activation_sources(neuron);
                let index = softmax_output_index(layer, neuron)?;
                let mut inputs = Vec::with_capacity(sources.len());
                for source in sources {
                    inputs.push(fetch(*source)?);
                }
                // Stabilized softmax over the source group.
                let max = inputs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let total: f64 = inputs.iter().map(|x| (x - max).exp()).sum();
                Ok((inputs[index] - max).exp() / total)
            }
            LayerKind::Bilinear => {
                let sources = layer.activation_sources(neuron);
                if sources.len() != 2 {
                    return Err(GraphError::MissingActivationSource {
                        layer: layer.index(),
                        neuron,
                    });
                }
                Ok(fetch(sources[0])? * fetch(sources[1])?)
            }
        }
    }

    /// Forward-evaluate every layer from the input assignment.
    ///
    /// Input layers must have an assignment set via
    /// [`Layer::set_assignment`]; every other layer's assignment is
    /// recomputed.
    pub fn compute_assignment(&mut self) -> Result<()> {
        let indices: Vec<usize> = self.layers().map(|(index, _)| index).collect();
        for index in indices {
            let layer = self.layer(index)?;
            if layer.kind() == LayerKind::Input {
                if layer.assignment().is_none() {
                    return Err(GraphError::MissingAssignment(index));
                }
                continue;
            }
            let mut values = Vec::with_capacity(layer.size());
            for neuron in 0..layer.size() {
                values.push(self.evaluate_neuron(layer, neuron, &|source| {
                    self.source_value(source)
                })?);
            }
            *self.layer_mut(index)?.assignment_mut() = Some(values);
        }
        Ok(())
    }

    /// Forward-propagate the input layer's simulation samples.
    ///
    /// Every non-input layer receives one sample row per neuron, obtained by
    /// evaluating the layer on each input sample column in turn.
    pub fn compute_simulations(&mut self) -> Result<()> {
        let input = self.input_layer()?;
        let sample_count = self
            .layer(input)?
            .simulations()
            .ok_or(GraphError::MissingSimulations(input))?
            .first()
            .map(Vec::len)
            .unwrap_or(0);

        let indices: Vec<usize> = self.layers().map(|(index, _)| index).collect();
        for index in indices {
            let layer = self.layer(index)?;
            if layer.kind() == LayerKind::Input {
                if layer.simulations().is_none() {
                    return Err(GraphError::MissingSimulations(index));
                }
                continue;
            }
            let mut rows = vec![Vec::with_capacity(sample_count); layer.size()];
            for sample in 0..sample_count {
                for (neuron, row) in rows.iter_mut().enumerate() {
                    row.push(self.evaluate_neuron(layer, neuron, &|source| {
                        self.source_sample(source, sample)
                    })?);
                }
            }
            *self.layer_mut(index)?.simulations_mut() = Some(rows);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// x -> [x, 2x] -> ReLU -> sum
    fn relu_chain() -> LayerGraph {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 1).unwrap();
        graph.add_layer(1, LayerKind::WeightedSum, 2).unwrap();
        graph.add_layer(2, LayerKind::Relu, 2).unwrap();
        graph.add_layer(3, LayerKind::WeightedSum, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_dependency(1, 2).unwrap();
        graph.add_dependency(2, 3).unwrap();
        graph.set_weight(0, 0, 1, 0, 1.0).unwrap();
        graph.set_weight(0, 0, 1, 1, 2.0).unwrap();
        graph.add_activation_source(1, 0, 2, 0).unwrap();
        graph.add_activation_source(1, 1, 2, 1).unwrap();
        graph.set_weight(2, 0, 3, 0, 1.0).unwrap();
        graph.set_weight(2, 1, 3, 0, 1.0).unwrap();
        graph
    }

    #[test]
    fn assignment_propagates_through_relu() {
        let mut graph = relu_chain();
        graph
            .layer_mut(0)
            .unwrap()
            .set_assignment(vec![-1.5])
            .unwrap();
        graph.compute_assignment().unwrap();
        // relu(-1.5) + relu(-3) = 0
        assert_eq!(graph.layer(3).unwrap().assignment().unwrap()[0], 0.0);

        graph
            .layer_mut(0)
            .unwrap()
            .set_assignment(vec![2.0])
            .unwrap();
        graph.compute_assignment().unwrap();
        // 2 + 4 = 6
        assert_eq!(graph.layer(3).unwrap().assignment().unwrap()[0], 6.0);
    }

    #[test]
    fn eliminated_source_contributes_its_constant() {
        let mut graph = relu_chain();
        graph
            .set_neuron_variable(NeuronRef::new(2, 1), 11)
            .unwrap();
        graph.eliminate_neuron(11, 4.0).unwrap();
        graph
            .layer_mut(0)
            .unwrap()
            .set_assignment(vec![1.0])
            .unwrap();
        graph.compute_assignment().unwrap();
        // relu(1) + eliminated 4.0
        assert_eq!(graph.layer(3).unwrap().assignment().unwrap()[0], 5.0);
    }

    #[test]
    fn softmax_group_normalizes() {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 3).unwrap();
        graph.add_layer(1, LayerKind::Softmax, 3).unwrap();
        graph.add_dependency(0, 1).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                graph.add_activation_source(0, j, 1, i).unwrap();
            }
        }
        graph
            .layer_mut(0)
            .unwrap()
            .set_assignment(vec![1.0, 2.0, 3.0])
            .unwrap();
        graph.compute_assignment().unwrap();
        let out = graph.layer(1).unwrap().assignment().unwrap().to_vec();
        let total: f64 = out.iter().sum();
        assert!(tolerance::are_equal(total, 1.0));
        assert!(out[2] > out[1] && out[1] > out[0]);
    }

    #[test]
    fn softmax_output_index_claims_positions_in_order() {
        let mut layer = Layer::new(1, LayerKind::Softmax, 3);
        for i in 0..3 {
            for j in 0..3 {
                layer
                    .add_activation_source(NeuronRef::new(0, j), i)
                    .unwrap();
            }
        }
        for i in 0..3 {
            assert_eq!(softmax_output_index(&layer, i).unwrap(), i);
        }
    }

    #[test]
    fn simulations_follow_assignment_semantics() {
        let mut graph = relu_chain();
        graph
            .layer_mut(0)
            .unwrap()
            .set_simulations(vec![vec![-1.0, 0.5, 3.0]])
            .unwrap();
        graph.compute_simulations().unwrap();
        let rows = graph.layer(3).unwrap().simulations().unwrap();
        assert_eq!(rows[0], vec![0.0, 1.5, 9.0]);
    }

    #[test]
    fn max_and_bilinear_evaluate_pointwise() {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 2).unwrap();
        graph.add_layer(1, LayerKind::Max, 1).unwrap();
        graph.add_layer(2, LayerKind::Bilinear, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_dependency(0, 2).unwrap();
        graph.add_activation_source(0, 0, 1, 0).unwrap();
        graph.add_activation_source(0, 1, 1, 0).unwrap();
        graph.add_activation_source(0, 0, 2, 0).unwrap();
        graph.add_activation_source(0, 1, 2, 0).unwrap();
        graph
            .layer_mut(0)
            .unwrap()
            .set_assignment(vec![-2.0, 3.0])
            .unwrap();
        graph.compute_assignment().unwrap();
        assert_eq!(graph.layer(1).unwrap().assignment().unwrap()[0], 3.0);
        assert_eq!(graph.layer(2).unwrap().assignment().unwrap()[0], -6.0);
    }
}
