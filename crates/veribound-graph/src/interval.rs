// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Concrete interval-arithmetic bound propagation.
//!
//! The cheapest of the analyses: walks the graph in index order and refines
//! every neuron's `[lb, ub]` from its sources' current intervals. Also home
//! to the interval bounds of a softmax output, which the symbolic engine and
//! the LP relaxation reuse.

use crate::error::{GraphError, Result};
use crate::eval::softmax_output_index;
use crate::graph::LayerGraph;
use crate::layer::Layer;
use crate::tolerance;
use crate::types::{LayerKind, NeuronRef};

/// Interval lower bound of softmax output `index`:
/// `1 / (1 + sum_{j != index} exp(ub_j - lb_index))`.
pub fn softmax_linear_lower_bound(lbs: &[f64], ubs: &[f64], index: usize) -> f64 {
    let mut sum = 1.0;
    for j in 0..lbs.len() {
        if j != index {
            sum += (ubs[j] - lbs[index]).exp();
        }
    }
    1.0 / sum
}

/// Interval upper bound of softmax output `index`:
/// `1 / (1 + sum_{j != index} exp(lb_j - ub_index))`.
pub fn softmax_linear_upper_bound(lbs: &[f64], ubs: &[f64], index: usize) -> f64 {
    let mut sum = 1.0;
    for j in 0..lbs.len() {
        if j != index {
            sum += (lbs[j] - ubs[index]).exp();
        }
    }
    1.0 / sum
}

/// Interval of a bilinear product from its factor intervals (the four
/// corner products).
pub fn bilinear_corner_interval(x: (f64, f64), y: (f64, f64)) -> (f64, f64) {
    let corners = [x.0 * y.0, x.0 * y.1, x.1 * y.0, x.1 * y.1];
    let mut lb = f64::INFINITY;
    let mut ub = f64::NEG_INFINITY;
    for corner in corners {
        lb = lb.min(corner);
        ub = ub.max(corner);
    }
    (lb, ub)
}

impl LayerGraph {
    /// The current interval of `source`, with eliminated neurons pinned.
    pub fn source_interval(&self, source: NeuronRef) -> Result<(f64, f64)> {
        let layer = self.layer(source.layer)?;
        if let Some(value) = layer.eliminated_value(source.neuron) {
            return Ok((value, value));
        }
        Ok((layer.lb(source.neuron), layer.ub(source.neuron)))
    }

    /// Interval-arithmetic bounds of one neuron from its sources' current
    /// intervals.
    pub fn interval_of(&self, layer_index: usize, neuron: usize) -> Result<(f64, f64)> {
        let layer = self.layer(layer_index)?;
        self.interval_of_neuron(layer, neuron)
    }

    fn interval_of_neuron(&self, layer: &Layer, neuron: usize) -> Result<(f64, f64)> {
        match layer.kind() {
            LayerKind::Input => Ok((layer.lb(neuron), layer.ub(neuron))),
            LayerKind::WeightedSum => {
                let mut lb = layer.bias(neuron);
                let mut ub = layer.bias(neuron);
                for src in layer.sorted_source_layers() {
                    let matrix = layer.weight_matrix(src)?;
                    for src_neuron in 0..matrix.nrows() {
                        let weight = matrix[[src_neuron, neuron]];
                        if weight == 0.0 {
                            continue;
                        }
                        let (src_lb, src_ub) =
                            self.source_interval(NeuronRef::new(src, src_neuron))?;
                        if weight > 0.0 {
                            lb += weight * src_lb;
                            ub += weight * src_ub;
                        } else {
                            lb += weight * src_ub;
                            ub += weight * src_lb;
                        }
                    }
                }
                Ok((lb, ub))
            }
            LayerKind::Relu => {
                let (l, u) = self.source_interval(layer.first_activation_source(neuron)?)?;
                Ok((l.max(0.0), u.max(0.0)))
            }
            LayerKind::LeakyRelu => {
                let alpha = layer.alpha();
                let (l, u) = self.source_interval(layer.first_activation_source(neuron)?)?;
                let lb = if l >= 0.0 { l } else { alpha * l };
                let ub = if u >= 0.0 { u } else { alpha * u };
                Ok((lb, ub))
            }
            LayerKind::AbsoluteValue => {
                let (l, u) = self.source_interval(layer.first_activation_source(neuron)?)?;
                if l >= 0.0 {
                    Ok((l, u))
                } else if u <= 0.0 {
                    Ok((-u, -l))
                } else {
                    Ok((0.0, (-l).max(u)))
                }
            }
            LayerKind::Sign => {
                let (l, u) = self.source_interval(layer.first_activation_source(neuron)?)?;
                if !tolerance::is_negative(l) {
                    Ok((1.0, 1.0))
                } else if tolerance::is_negative(u) {
                    Ok((-1.0, -1.0))
                } else {
                    Ok((-1.0, 1.0))
                }
            }
            LayerKind::Round => {
                let (l, u) = self.source_interval(layer.first_activation_source(neuron)?)?;
                Ok((tolerance::round(l), tolerance::round(u)))
            }
            LayerKind::Sigmoid => {
                let (l, u) = self.source_interval(layer.first_activation_source(neuron)?)?;
                Ok((tolerance::sigmoid(l), tolerance::sigmoid(u)))
            }
            LayerKind::Max => {
                let sources = layer.activation_sources(neuron);
                if sources.is_empty() {
                    return Err(GraphError::MissingActivationSource {
                        layer: layer.index(),
                        neuron,
                    });
                }
                let mut max_fixed = f64::NEG_INFINITY;
                let mut have_fixed = false;
                let mut live_lb = f64::NEG_INFINITY;
                let mut live_ub = f64::NEG_INFINITY;
                let mut have_live = false;
                for source in sources {
                    let src_layer = self.layer(source.layer)?;
                    if let Some(value) = src_layer.eliminated_value(source.neuron) {
                        have_fixed = true;
                        max_fixed = max_fixed.max(value);
                    } else {
                        have_live = true;
                        live_lb = live_lb.max(src_layer.lb(source.neuron));
                        live_ub = live_ub.max(src_layer.ub(source.neuron));
                    }
                }
                if have_fixed && (!have_live || max_fixed >= live_ub) {
                    // A pinned source dominates every live one.
                    Ok((max_fixed, max_fixed))
                } else if have_fixed {
                    Ok((live_lb.max(max_fixed), live_ub))
                } else {
                    Ok((live_lb, live_ub))
                }
            }
            LayerKind::Softmax => {
                let sources = layer.activation_sources(neuron);
                let index = softmax_output_index(layer, neuron)?;
                let mut lbs = Vec::with_capacity(sources.len());
                let mut ubs = Vec::with_capacity(sources.len());
                for source in sources {
                    let (l, u) = self.source_interval(*source)?;
                    lbs.push(l);
                    ubs.push(u);
                }
                Ok((
                    softmax_linear_lower_bound(&lbs, &ubs, index),
                    softmax_linear_upper_bound(&lbs, &ubs, index),
                ))
            }
            LayerKind::Bilinear => {
                let sources = layer.activation_sources(neuron);
                if sources.len() != 2 {
                    return Err(GraphError::MissingActivationSource {
                        layer: layer.index(),
                        neuron,
                    });
                }
                let x = self.source_interval(sources[0])?;
                let y = self.source_interval(sources[1])?;
                Ok(bilinear_corner_interval(x, y))
            }
        }
    }

    /// Refine every neuron's bounds by one interval-arithmetic sweep.
    ///
    /// Bound updates are refine-only; an interval that empties out surfaces
    /// as [`GraphError::EmptyInterval`].
    pub fn compute_interval_bounds(&mut self) -> Result<()> {
        let indices: Vec<usize> = self.layers().map(|(index, _)| index).collect();
        for index in indices {
            let layer = self.layer(index)?;
            if layer.kind() == LayerKind::Input {
                continue;
            }
            tracing::debug!(layer = index, kind = %layer.kind(), "interval arithmetic sweep");
            let mut intervals = Vec::with_capacity(layer.size());
            for neuron in 0..layer.size() {
                if layer.neuron_eliminated(neuron) {
                    intervals.push(None);
                } else {
                    intervals.push(Some(self.interval_of_neuron(layer, neuron)?));
                }
            }
            let layer = self.layer_mut(index)?;
            for (neuron, interval) in intervals.into_iter().enumerate() {
                if let Some((lb, ub)) = interval {
                    layer.set_lb(neuron, lb)?;
                    layer.set_ub(neuron, ub)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_sum_interval_is_sign_aware() {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 2).unwrap();
        graph.add_layer(1, LayerKind::WeightedSum, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.set_weight(0, 0, 1, 0, 2.0).unwrap();
        graph.set_weight(0, 1, 1, 0, -3.0).unwrap();
        graph.set_bias(1, 0, 1.0).unwrap();
        let input = graph.layer_mut(0).unwrap();
        input.overwrite_bounds(0, -1.0, 1.0).unwrap();
        input.overwrite_bounds(1, -1.0, 1.0).unwrap();
        graph.compute_interval_bounds().unwrap();
        let layer = graph.layer(1).unwrap();
        assert_eq!(layer.lb(0), -4.0);
        assert_eq!(layer.ub(0), 6.0);
    }

    #[test]
    fn softmax_linear_bounds_match_reference_values() {
        // Logit intervals [0,2], [-5,5], [-1,1].
        let lbs = [0.0, -5.0, -1.0];
        let ubs = [2.0, 5.0, 1.0];
        assert!(tolerance::are_equal_within(
            softmax_linear_lower_bound(&lbs, &ubs, 0),
            0.0066,
            1e-4
        ));
        assert!(tolerance::are_equal_within(
            softmax_linear_upper_bound(&lbs, &ubs, 0),
            0.9517,
            1e-4
        ));
        assert!(tolerance::are_equal_within(
            softmax_linear_lower_bound(&lbs, &ubs, 1),
            0.0007,
            1e-4
        ));
        assert!(tolerance::are_equal_within(
            softmax_linear_upper_bound(&lbs, &ubs, 2),
            0.7297,
            1e-4
        ));
    }

    #[test]
    fn max_with_dominating_eliminated_source_is_constant() {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 2).unwrap();
        graph.add_layer(1, LayerKind::Max, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_activation_source(0, 0, 1, 0).unwrap();
        graph.add_activation_source(0, 1, 1, 0).unwrap();
        graph.set_neuron_variable(NeuronRef::new(0, 1), 1).unwrap();
        let input = graph.layer_mut(0).unwrap();
        input.overwrite_bounds(0, -2.0, 3.0).unwrap();
        input.overwrite_bounds(1, -2.0, 3.0).unwrap();
        graph.eliminate_neuron(1, 5.0).unwrap();
        graph.layer_mut(1).unwrap().overwrite_bounds(0, -100.0, 100.0).unwrap();
        graph.compute_interval_bounds().unwrap();
        let layer = graph.layer(1).unwrap();
        assert_eq!(layer.lb(0), 5.0);
        assert_eq!(layer.ub(0), 5.0);
    }

    #[test]
    fn bilinear_corner_interval_covers_products() {
        assert_eq!(bilinear_corner_interval((-1.0, 7.0), (-1.0, 5.0)), (-7.0, 35.0));
        assert_eq!(bilinear_corner_interval((2.0, 3.0), (4.0, 5.0)), (8.0, 15.0));
    }

    #[test]
    fn interval_sweep_is_monotone() {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 1).unwrap();
        graph.add_layer(1, LayerKind::Relu, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_activation_source(0, 0, 1, 0).unwrap();
        graph
            .layer_mut(0)
            .unwrap()
            .overwrite_bounds(0, -1.0, 2.0)
            .unwrap();
        graph.compute_interval_bounds().unwrap();
        let first = (graph.layer(1).unwrap().lb(0), graph.layer(1).unwrap().ub(0));
        graph.compute_interval_bounds().unwrap();
        let second = (graph.layer(1).unwrap().lb(0), graph.layer(1).unwrap().ub(0));
        assert_eq!(first, (0.0, 2.0));
        assert_eq!(first, second);
    }
}
