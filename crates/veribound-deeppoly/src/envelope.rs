// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-activation affine envelopes.
//!
//! For every neuron of an activation layer this module produces two affine
//! expressions over the layer's (single) source layer, asserting
//! `lower(x) <= neuron <= upper(x)` for every source vector `x` inside the
//! current source box. Phase-fixed neurons get exact expressions; unfixed
//! neurons get the relaxations listed in the engine documentation.
//!
//! An eliminated target neuron becomes the constant it is pinned to, and an
//! eliminated source contributes the activation of its pinned value.

use veribound_graph::eval::softmax_output_index;
use veribound_graph::interval::{softmax_linear_lower_bound, softmax_linear_upper_bound};
use veribound_graph::{tolerance, Layer, LayerGraph, LayerKind};

use crate::error::{DeepPolyError, Result};
use crate::options::{AnalysisOptions, SymbolicBoundMode};

/// One affine face over the source layer: `sum(coefficient * x_source) +
/// bias`.
#[derive(Debug, Clone, Default)]
pub struct NeuronEnvelope {
    pub terms: Vec<(usize, f64)>,
    pub bias: f64,
}

impl NeuronEnvelope {
    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            bias: value,
        }
    }

    pub fn linear(source: usize, coefficient: f64, bias: f64) -> Self {
        Self {
            terms: vec![(source, coefficient)],
            bias,
        }
    }
}

/// The envelopes of one activation layer, all over `source_layer`.
#[derive(Debug, Clone)]
pub struct ActivationEnvelopes {
    pub source_layer: usize,
    pub lower: Vec<NeuronEnvelope>,
    pub upper: Vec<NeuronEnvelope>,
}

/// Coefficients steering the parameterised relaxations of one layer.
struct LayerParameters<'a> {
    layer: usize,
    coefficients: &'a [f64],
}

impl LayerParameters<'_> {
    fn get(&self, index: usize) -> Result<f64> {
        let value = *self.coefficients.get(index).ok_or({
            DeepPolyError::ParameterArity {
                layer: self.layer,
                expected: index + 1,
                actual: self.coefficients.len(),
            }
        })?;
        if !(0.0..=1.0).contains(&value) {
            return Err(DeepPolyError::ParameterRange {
                layer: self.layer,
                value,
            });
        }
        Ok(value)
    }
}

/// The single source layer every envelope of `layer` refers to.
fn single_source_layer(layer: &Layer) -> Result<usize> {
    let mut source_layer = None;
    for neuron in 0..layer.size() {
        for source in layer.activation_sources(neuron) {
            match source_layer {
                None => source_layer = Some(source.layer),
                Some(existing) if existing != source.layer => {
                    return Err(DeepPolyError::MixedSourceLayers {
                        layer: layer.index(),
                    })
                }
                _ => {}
            }
        }
    }
    source_layer.ok_or(DeepPolyError::MixedSourceLayers {
        layer: layer.index(),
    })
}

/// Build both envelope faces for every neuron of `layer`.
pub fn build_envelopes(
    graph: &LayerGraph,
    layer: &Layer,
    options: &AnalysisOptions,
) -> Result<ActivationEnvelopes> {
    let source_layer = single_source_layer(layer)?;
    let parameters = match options.mode {
        SymbolicBoundMode::Parameterised => {
            options
                .layer_parameters
                .get(&layer.index())
                .map(|coefficients| LayerParameters {
                    layer: layer.index(),
                    coefficients: coefficients.as_slice(),
                })
        }
        SymbolicBoundMode::Standard => None,
    };

    let mut lower = Vec::with_capacity(layer.size());
    let mut upper = Vec::with_capacity(layer.size());
    for neuron in 0..layer.size() {
        if let Some(value) = layer.eliminated_value(neuron) {
            lower.push(NeuronEnvelope::constant(value));
            upper.push(NeuronEnvelope::constant(value));
            continue;
        }
        let (lo, up) = neuron_envelopes(graph, layer, neuron, parameters.as_ref())?;
        lower.push(lo);
        upper.push(up);
    }
    Ok(ActivationEnvelopes {
        source_layer,
        lower,
        upper,
    })
}

fn neuron_envelopes(
    graph: &LayerGraph,
    layer: &Layer,
    neuron: usize,
    parameters: Option<&LayerParameters<'_>>,
) -> Result<(NeuronEnvelope, NeuronEnvelope)> {
    // A neuron whose interval has collapsed to a point is that constant,
    // exactly like an eliminated one.
    if layer.lb(neuron) == layer.ub(neuron) {
        let value = layer.lb(neuron);
        return Ok((
            NeuronEnvelope::constant(value),
            NeuronEnvelope::constant(value),
        ));
    }
    match layer.kind() {
        LayerKind::Relu => {
            let source = layer.first_activation_source(neuron)?;
            let (l, u) = graph.source_interval(source)?;
            if l == u || graph.layer(source.layer)?.neuron_eliminated(source.neuron) {
                let value = l.max(0.0);
                return Ok((
                    NeuronEnvelope::constant(value),
                    NeuronEnvelope::constant(value),
                ));
            }
            let s = source.neuron;
            if !tolerance::is_negative(l) {
                // Active phase: y = x.
                Ok((
                    NeuronEnvelope::linear(s, 1.0, 0.0),
                    NeuronEnvelope::linear(s, 1.0, 0.0),
                ))
            } else if !tolerance::is_positive(u) {
                // Inactive phase: y = 0.
                Ok((NeuronEnvelope::constant(0.0), NeuronEnvelope::constant(0.0)))
            } else {
                let upper_slope = u / (u - l);
                let upper_bias = -u * l / (u - l);
                let lower_slope = match parameters {
                    Some(p) => p.get(0)?,
                    None => {
                        if u > -l {
                            1.0
                        } else {
                            0.0
                        }
                    }
                };
                Ok((
                    NeuronEnvelope::linear(s, lower_slope, 0.0),
                    NeuronEnvelope::linear(s, upper_slope, upper_bias),
                ))
            }
        }
        LayerKind::LeakyRelu => {
            let alpha = layer.alpha();
            let source = layer.first_activation_source(neuron)?;
            let (l, u) = graph.source_interval(source)?;
            if l == u || graph.layer(source.layer)?.neuron_eliminated(source.neuron) {
                let value = if l >= 0.0 { l } else { alpha * l };
                return Ok((
                    NeuronEnvelope::constant(value),
                    NeuronEnvelope::constant(value),
                ));
            }
            let s = source.neuron;
            if !tolerance::is_negative(l) {
                Ok((
                    NeuronEnvelope::linear(s, 1.0, 0.0),
                    NeuronEnvelope::linear(s, 1.0, 0.0),
                ))
            } else if !tolerance::is_positive(u) {
                Ok((
                    NeuronEnvelope::linear(s, alpha, 0.0),
                    NeuronEnvelope::linear(s, alpha, 0.0),
                ))
            } else {
                let width = u - l;
                let upper_slope = (u - alpha * l) / width;
                let upper_bias = (alpha - 1.0) * u * l / width;
                let lower_slope = match parameters {
                    Some(p) => alpha + (1.0 - alpha) * p.get(0)?,
                    None => {
                        if u >= -l {
                            1.0
                        } else {
                            alpha
                        }
                    }
                };
                Ok((
                    NeuronEnvelope::linear(s, lower_slope, 0.0),
                    NeuronEnvelope::linear(s, upper_slope, upper_bias),
                ))
            }
        }
        LayerKind::AbsoluteValue => {
            let source = layer.first_activation_source(neuron)?;
            let (l, u) = graph.source_interval(source)?;
            let s = source.neuron;
            if graph.layer(source.layer)?.neuron_eliminated(source.neuron) {
                return Ok((
                    NeuronEnvelope::constant(l.abs()),
                    NeuronEnvelope::constant(l.abs()),
                ));
            }
            if l >= 0.0 {
                Ok((
                    NeuronEnvelope::linear(s, 1.0, 0.0),
                    NeuronEnvelope::linear(s, 1.0, 0.0),
                ))
            } else if u <= 0.0 {
                Ok((
                    NeuronEnvelope::linear(s, -1.0, 0.0),
                    NeuronEnvelope::linear(s, -1.0, 0.0),
                ))
            } else {
                Ok((
                    NeuronEnvelope::constant(0.0),
                    NeuronEnvelope::constant((-l).max(u)),
                ))
            }
        }
        LayerKind::Sign => {
            let source = layer.first_activation_source(neuron)?;
            let (l, u) = graph.source_interval(source)?;
            let s = source.neuron;
            if !tolerance::is_negative(l) {
                Ok((NeuronEnvelope::constant(1.0), NeuronEnvelope::constant(1.0)))
            } else if tolerance::is_negative(u) {
                Ok((
                    NeuronEnvelope::constant(-1.0),
                    NeuronEnvelope::constant(-1.0),
                ))
            } else if let Some(p) = parameters {
                // Slanted faces scaled by the two steering coefficients;
                // sound for any coefficients in [0, 1].
                let upper_slope = -2.0 / l * p.get(0)?;
                let lower_slope = 2.0 / u * p.get(1)?;
                Ok((
                    NeuronEnvelope::linear(s, lower_slope, -1.0),
                    NeuronEnvelope::linear(s, upper_slope, 1.0),
                ))
            } else {
                Ok((
                    NeuronEnvelope::constant(-1.0),
                    NeuronEnvelope::constant(1.0),
                ))
            }
        }
        LayerKind::Round => {
            let source = layer.first_activation_source(neuron)?;
            let (l, u) = graph.source_interval(source)?;
            let s = source.neuron;
            if tolerance::are_equal(l, u)
                || graph.layer(source.layer)?.neuron_eliminated(source.neuron)
            {
                let value = tolerance::round(u);
                return Ok((
                    NeuronEnvelope::constant(value),
                    NeuronEnvelope::constant(value),
                ));
            }
            Ok((
                NeuronEnvelope::linear(s, 1.0, -0.5),
                NeuronEnvelope::linear(s, 1.0, 0.5),
            ))
        }
        LayerKind::Sigmoid => {
            let source = layer.first_activation_source(neuron)?;
            let (l, u) = graph.source_interval(source)?;
            let s = source.neuron;
            let sig_l = tolerance::sigmoid(l);
            let sig_u = tolerance::sigmoid(u);
            if tolerance::are_equal(l, u)
                || graph.layer(source.layer)?.neuron_eliminated(source.neuron)
            {
                return Ok((
                    NeuronEnvelope::constant(sig_l),
                    NeuronEnvelope::constant(sig_u),
                ));
            }
            let lambda = (sig_u - sig_l) / (u - l);
            let lambda_prime =
                tolerance::sigmoid_derivative(l).min(tolerance::sigmoid_derivative(u));
            let lower = if tolerance::is_positive(l) {
                NeuronEnvelope::linear(s, lambda, sig_l - lambda * l)
            } else {
                NeuronEnvelope::linear(s, lambda_prime, sig_l - lambda_prime * l)
            };
            let upper = if !tolerance::is_positive(u) {
                NeuronEnvelope::linear(s, lambda, sig_u - lambda * u)
            } else {
                NeuronEnvelope::linear(s, lambda_prime, sig_u - lambda_prime * u)
            };
            Ok((lower, upper))
        }
        LayerKind::Softmax => {
            // The softmax element concretizes immediately: its faces are the
            // interval bounds of the output. The tangent families are emitted
            // in the LP relaxation, where an optimizer can exploit them.
            let sources = layer.activation_sources(neuron);
            let index = softmax_output_index(layer, neuron)?;
            let mut lbs = Vec::with_capacity(sources.len());
            let mut ubs = Vec::with_capacity(sources.len());
            for source in sources {
                let (l, u) = graph.source_interval(*source)?;
                lbs.push(l);
                ubs.push(u);
            }
            let lb = softmax_linear_lower_bound(&lbs, &ubs, index).max(layer.lb(neuron));
            let ub = softmax_linear_upper_bound(&lbs, &ubs, index).min(layer.ub(neuron));
            Ok((NeuronEnvelope::constant(lb), NeuronEnvelope::constant(ub)))
        }
        LayerKind::Max => {
            let sources = layer.activation_sources(neuron);
            if sources.is_empty() {
                return Err(DeepPolyError::Graph(
                    veribound_graph::GraphError::MissingActivationSource {
                        layer: layer.index(),
                        neuron,
                    },
                ));
            }
            let mut max_fixed = f64::NEG_INFINITY;
            let mut have_fixed = false;
            let mut best_live: Option<(usize, f64, f64)> = None; // (neuron, lb, ub)
            let mut max_live_ub = f64::NEG_INFINITY;
            for source in sources {
                let src_layer = graph.layer(source.layer)?;
                if let Some(value) = src_layer.eliminated_value(source.neuron) {
                    have_fixed = true;
                    max_fixed = max_fixed.max(value);
                    continue;
                }
                let lb = src_layer.lb(source.neuron);
                let ub = src_layer.ub(source.neuron);
                max_live_ub = max_live_ub.max(ub);
                if best_live.map(|(_, best_lb, _)| lb > best_lb).unwrap_or(true) {
                    best_live = Some((source.neuron, lb, ub));
                }
            }
            if have_fixed && max_fixed >= max_live_ub {
                // A pinned source dominates every live one.
                return Ok((
                    NeuronEnvelope::constant(max_fixed),
                    NeuronEnvelope::constant(max_fixed),
                ));
            }
            let (best_neuron, best_lb, _) =
                best_live.expect("max layer with no live source is dominated");
            let others_ub = sources
                .iter()
                .filter_map(|source| {
                    let src_layer = graph.layer(source.layer).ok()?;
                    if source.neuron == best_neuron && !src_layer.neuron_eliminated(source.neuron)
                    {
                        None
                    } else if let Some(value) = src_layer.eliminated_value(source.neuron) {
                        Some(value)
                    } else {
                        Some(src_layer.ub(source.neuron))
                    }
                })
                .fold(f64::NEG_INFINITY, f64::max);
            if best_lb >= others_ub {
                // Phase fixed: the max is its dominant source.
                return Ok((
                    NeuronEnvelope::linear(best_neuron, 1.0, 0.0),
                    NeuronEnvelope::linear(best_neuron, 1.0, 0.0),
                ));
            }
            let lower = if have_fixed && max_fixed > best_lb {
                NeuronEnvelope::constant(max_fixed)
            } else {
                NeuronEnvelope::linear(best_neuron, 1.0, 0.0)
            };
            let upper = NeuronEnvelope::constant(max_live_ub.max(if have_fixed {
                max_fixed
            } else {
                f64::NEG_INFINITY
            }));
            Ok((lower, upper))
        }
        LayerKind::Bilinear => {
            let sources = layer.activation_sources(neuron);
            if sources.len() != 2 {
                return Err(DeepPolyError::BilinearArity {
                    layer: layer.index(),
                    neuron,
                });
            }
            let (a, b) = (sources[0], sources[1]);
            let a_fixed = graph.layer(a.layer)?.eliminated_value(a.neuron);
            let b_fixed = graph.layer(b.layer)?.eliminated_value(b.neuron);
            let (al, au) = graph.source_interval(a)?;
            let (bl, bu) = graph.source_interval(b)?;
            match (a_fixed, b_fixed) {
                (Some(x), Some(y)) => Ok((
                    NeuronEnvelope::constant(x * y),
                    NeuronEnvelope::constant(x * y),
                )),
                (Some(x), None) => {
                    // y = x_const * b: exact.
                    Ok((
                        NeuronEnvelope::linear(b.neuron, x, 0.0),
                        NeuronEnvelope::linear(b.neuron, x, 0.0),
                    ))
                }
                (None, Some(y)) => Ok((
                    NeuronEnvelope::linear(a.neuron, y, 0.0),
                    NeuronEnvelope::linear(a.neuron, y, 0.0),
                )),
                (None, None) => {
                    let (c_lower, c_upper) = match parameters {
                        Some(p) => {
                            let c0 = p.get(0)?;
                            let c1 = p.get(1)?;
                            // Two-coefficient McCormick family.
                            let lower = NeuronEnvelope {
                                terms: vec![
                                    (a.neuron, c0 * bl + (1.0 - c0) * bu),
                                    (b.neuron, c0 * al + (1.0 - c0) * au),
                                ],
                                bias: -c0 * al * bl - (1.0 - c0) * au * bu,
                            };
                            let upper = NeuronEnvelope {
                                terms: vec![
                                    (a.neuron, c1 * bu + (1.0 - c1) * bl),
                                    (b.neuron, c1 * al + (1.0 - c1) * au),
                                ],
                                bias: -c1 * al * bu - (1.0 - c1) * au * bl,
                            };
                            (lower, upper)
                        }
                        None => {
                            let lower = NeuronEnvelope {
                                terms: vec![(a.neuron, bl), (b.neuron, al)],
                                bias: -al * bl,
                            };
                            let upper = NeuronEnvelope {
                                terms: vec![(a.neuron, bu), (b.neuron, al)],
                                bias: -al * bu,
                            };
                            (lower, upper)
                        }
                    };
                    Ok((c_lower, c_upper))
                }
            }
        }
        kind => Err(DeepPolyError::UnsupportedLayer(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veribound_graph::NeuronRef;

    fn graph_with_activation(kind: LayerKind, source_bounds: (f64, f64)) -> LayerGraph {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 1).unwrap();
        graph.add_layer(1, kind, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_activation_source(0, 0, 1, 0).unwrap();
        graph
            .layer_mut(0)
            .unwrap()
            .overwrite_bounds(0, source_bounds.0, source_bounds.1)
            .unwrap();
        graph
    }

    fn envelope_value(envelope: &NeuronEnvelope, x: f64) -> f64 {
        envelope.bias + envelope.terms.iter().map(|(_, c)| c * x).sum::<f64>()
    }

    #[test]
    fn relu_adaptive_lower_slope_follows_dominant_side() {
        let graph = graph_with_activation(LayerKind::Relu, (-1.0, 7.0));
        let layer = graph.layer(1).unwrap();
        let (lower, upper) =
            neuron_envelopes(&graph, layer, 0, None).unwrap();
        assert_eq!(lower.terms, vec![(0, 1.0)]); // u > -l: y >= x
        assert!(tolerance::are_equal(upper.terms[0].1, 7.0 / 8.0));
        assert!(tolerance::are_equal(upper.bias, 7.0 / 8.0));

        let graph = graph_with_activation(LayerKind::Relu, (-5.0, 5.0));
        let layer = graph.layer(1).unwrap();
        let (lower, _) = neuron_envelopes(&graph, layer, 0, None).unwrap();
        assert!(lower.terms.is_empty()); // tie goes to y >= 0
        assert_eq!(lower.bias, 0.0);
    }

    #[test]
    fn leaky_relu_tie_keeps_identity_lower_face() {
        let graph = graph_with_activation(LayerKind::LeakyRelu, (-5.0, 5.0));
        let mut graph = graph;
        graph.layer_mut(1).unwrap().set_alpha(0.1);
        let layer = graph.layer(1).unwrap();
        let (lower, upper) = neuron_envelopes(&graph, layer, 0, None).unwrap();
        assert_eq!(lower.terms, vec![(0, 1.0)]); // u >= -l: y >= x
        assert!(tolerance::are_equal(upper.terms[0].1, 0.55));
        assert!(tolerance::are_equal(upper.bias, 2.25));
    }

    #[test]
    fn envelopes_are_sound_on_a_grid() {
        let cases = [
            (LayerKind::Relu, (-1.0, 7.0)),
            (LayerKind::Relu, (-5.0, 5.0)),
            (LayerKind::LeakyRelu, (-5.0, 5.0)),
            (LayerKind::AbsoluteValue, (-3.0, 2.0)),
            (LayerKind::Sign, (-2.0, 4.0)),
            (LayerKind::Round, (-1.3, 2.4)),
            (LayerKind::Sigmoid, (-6.0, 8.0)),
        ];
        for (kind, (l, u)) in cases {
            let mut graph = graph_with_activation(kind, (l, u));
            if kind == LayerKind::LeakyRelu {
                graph.layer_mut(1).unwrap().set_alpha(0.1);
            }
            let layer = graph.layer(1).unwrap();
            let (lower, upper) = neuron_envelopes(&graph, layer, 0, None).unwrap();
            for step in 0..=20 {
                let x = l + (u - l) * (step as f64) / 20.0;
                let truth = match kind {
                    LayerKind::Relu => x.max(0.0),
                    LayerKind::LeakyRelu => {
                        if x >= 0.0 {
                            x
                        } else {
                            0.1 * x
                        }
                    }
                    LayerKind::AbsoluteValue => x.abs(),
                    LayerKind::Sign => {
                        if tolerance::is_negative(x) {
                            -1.0
                        } else {
                            1.0
                        }
                    }
                    LayerKind::Round => tolerance::round(x),
                    LayerKind::Sigmoid => tolerance::sigmoid(x),
                    _ => unreachable!(),
                };
                assert!(
                    envelope_value(&lower, x) <= truth + 1e-9,
                    "{:?} lower face violated at {}",
                    kind,
                    x
                );
                assert!(
                    envelope_value(&upper, x) >= truth - 1e-9,
                    "{:?} upper face violated at {}",
                    kind,
                    x
                );
            }
        }
    }

    #[test]
    fn parameterised_relu_interpolates_between_faces() {
        let mut options = AnalysisOptions {
            mode: SymbolicBoundMode::Parameterised,
            ..Default::default()
        };
        options.layer_parameters.insert(1, vec![0.5]);
        let graph = graph_with_activation(LayerKind::Relu, (-2.0, 2.0));
        let envelopes = build_envelopes(&graph, graph.layer(1).unwrap(), &options).unwrap();
        assert_eq!(envelopes.lower[0].terms, vec![(0, 0.5)]);
    }

    #[test]
    fn out_of_range_parameter_is_rejected() {
        let mut options = AnalysisOptions {
            mode: SymbolicBoundMode::Parameterised,
            ..Default::default()
        };
        options.layer_parameters.insert(1, vec![1.5]);
        let graph = graph_with_activation(LayerKind::Relu, (-2.0, 2.0));
        let err = build_envelopes(&graph, graph.layer(1).unwrap(), &options).unwrap_err();
        assert!(matches!(err, DeepPolyError::ParameterRange { .. }));
    }

    #[test]
    fn max_phase_fixes_on_dominant_source() {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 2).unwrap();
        graph.add_layer(1, LayerKind::Max, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_activation_source(0, 0, 1, 0).unwrap();
        graph.add_activation_source(0, 1, 1, 0).unwrap();
        {
            let input = graph.layer_mut(0).unwrap();
            input.overwrite_bounds(0, 3.0, 5.0).unwrap();
            input.overwrite_bounds(1, -1.0, 2.0).unwrap();
        }
        let layer = graph.layer(1).unwrap();
        let (lower, upper) = neuron_envelopes(&graph, layer, 0, None).unwrap();
        // Source 0's lb dominates source 1's ub: y = x_0 exactly.
        assert_eq!(lower.terms, vec![(0, 1.0)]);
        assert_eq!(upper.terms, vec![(0, 1.0)]);
    }

    #[test]
    fn eliminated_bilinear_factor_makes_the_product_linear() {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 2).unwrap();
        graph.add_layer(1, LayerKind::Bilinear, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_activation_source(0, 0, 1, 0).unwrap();
        graph.add_activation_source(0, 1, 1, 0).unwrap();
        graph.set_neuron_variable(NeuronRef::new(0, 0), 0).unwrap();
        graph
            .layer_mut(0)
            .unwrap()
            .overwrite_bounds(1, -1.0, 2.0)
            .unwrap();
        graph.eliminate_neuron(0, 3.0).unwrap();
        let layer = graph.layer(1).unwrap();
        let (lower, upper) = neuron_envelopes(&graph, layer, 0, None).unwrap();
        assert_eq!(lower.terms, vec![(1, 3.0)]);
        assert_eq!(upper.terms, vec![(1, 3.0)]);
    }
}
