// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The symbolic bound propagation engine.
//!
//! [`DeepPolyAnalysis::run`] walks the layers in index order. For each
//! layer it builds an abstract element (the layer's affine envelopes over
//! its immediate predecessor), back-substitutes the element's expressions
//! through the predecessor chain down to the reference layer, concretizes
//! against the reference box, and refines the layer's interval in place.
//!
//! Back-substitution works in the engine-owned working matrices: `work1`
//! holds the expression over the current chain layer, each substitution
//! writes `work2`, and the buffers swap. A weighted-sum layer with several
//! sources continues the chain through its highest-indexed source; the
//! other sources' contributions accumulate in *residual* matrices. A
//! residual whose layer the chain reaches is merged back symbolically; one
//! the chain jumps over is concretized immediately from its interval
//! bounds, padded by the symbolic rounding slack.

use std::collections::BTreeMap;

use ndarray::Array2;
use tracing::{debug, info};

use veribound_graph::{LayerGraph, LayerKind, NeuronRef};

use crate::element::{AbstractElement, ElementBody};
use crate::envelope::{build_envelopes, ActivationEnvelopes};
use crate::error::Result;
use crate::options::AnalysisOptions;
use crate::storage::{SymbolicBounds, SymbolicBoundsStore};

/// Residual contribution matrices, keyed by residual layer index.
type Residuals = BTreeMap<usize, (Array2<f64>, Array2<f64>)>;

/// One symbolic propagation run over a layer graph.
pub struct DeepPolyAnalysis<'a> {
    graph: &'a mut LayerGraph,
    options: AnalysisOptions,
    reference: usize,
    /// Working memory, sized `max_width x max_width`; lent to each element
    /// while it executes and reused across layers.
    work1_lb: Array2<f64>,
    work1_ub: Array2<f64>,
    work2_lb: Array2<f64>,
    work2_ub: Array2<f64>,
    work_lower_bias: Vec<f64>,
    work_upper_bias: Vec<f64>,
    elements: BTreeMap<usize, AbstractElement>,
    output_store: SymbolicBoundsStore,
    predecessor_store: SymbolicBoundsStore,
}

impl<'a> DeepPolyAnalysis<'a> {
    pub fn new(graph: &'a mut LayerGraph, options: AnalysisOptions) -> Result<Self> {
        let reference = graph.input_layer()?;
        let max_width = graph.max_layer_size();
        Ok(Self {
            graph,
            options,
            reference,
            work1_lb: Array2::zeros((max_width, max_width)),
            work1_ub: Array2::zeros((max_width, max_width)),
            work2_lb: Array2::zeros((max_width, max_width)),
            work2_ub: Array2::zeros((max_width, max_width)),
            work_lower_bias: vec![0.0; max_width],
            work_upper_bias: vec![0.0; max_width],
            elements: BTreeMap::new(),
            output_store: SymbolicBoundsStore::new(),
            predecessor_store: SymbolicBoundsStore::new(),
        })
    }

    /// Propagate symbolic bounds through every layer, refining the graph's
    /// intervals in place. An interval that empties out surfaces as an
    /// infeasibility error (see [`crate::DeepPolyError::is_infeasible`]).
    pub fn run(&mut self) -> Result<()> {
        self.elements.clear();
        self.output_store.clear();
        self.predecessor_store.clear();
        let indices: Vec<usize> = self.graph.layers().map(|(index, _)| index).collect();
        for index in indices {
            self.process_layer(index)?;
        }
        info!(layers = self.elements.len(), "symbolic bound propagation done");
        Ok(())
    }

    /// Output-layer symbolic expressions collected when
    /// [`AnalysisOptions::store_output_bounds`] is set, keyed by the layer
    /// each expression refers to.
    pub fn output_bounds(&self) -> &SymbolicBoundsStore {
        &self.output_store
    }

    /// Per-layer expressions over the main immediate predecessor, collected
    /// when [`AnalysisOptions::store_predecessor_bounds`] is set.
    pub fn predecessor_bounds(&self) -> &SymbolicBoundsStore {
        &self.predecessor_store
    }

    fn process_layer(&mut self, index: usize) -> Result<()> {
        let layer = self.graph.layer(index)?;
        let kind = layer.kind();
        let size = layer.size();
        debug!(layer = index, kind = %kind, "executing abstract element");

        if kind == LayerKind::Input {
            self.elements.insert(
                index,
                AbstractElement {
                    layer_index: index,
                    kind,
                    size,
                    body: ElementBody::Input,
                    lb: layer.lbs().to_vec(),
                    ub: layer.ubs().to_vec(),
                },
            );
            return Ok(());
        }

        let body = if kind == LayerKind::WeightedSum {
            ElementBody::WeightedSum
        } else {
            ElementBody::Activation(build_envelopes(self.graph, layer, &self.options)?)
        };

        let (mut lb, mut ub) = self.back_substitute(index, size, &body)?;

        // Intersect with plain interval arithmetic over the immediate
        // predecessors. ReLU-family layers keep the raw concretization: the
        // LP stage recovers the nonnegative side.
        if !matches!(kind, LayerKind::Relu | LayerKind::LeakyRelu) {
            for neuron in 0..size {
                if self.graph.layer(index)?.neuron_eliminated(neuron) {
                    continue;
                }
                let (interval_lb, interval_ub) = self.graph.interval_of(index, neuron)?;
                lb[neuron] = lb[neuron].max(interval_lb);
                ub[neuron] = ub[neuron].min(interval_ub);
            }
        }

        let layer = self.graph.layer_mut(index)?;
        for neuron in 0..size {
            if layer.neuron_eliminated(neuron) {
                continue;
            }
            layer.set_lb(neuron, lb[neuron])?;
            layer.set_ub(neuron, ub[neuron])?;
        }

        let layer = self.graph.layer(index)?;
        self.elements.insert(
            index,
            AbstractElement {
                layer_index: index,
                kind,
                size,
                body,
                lb: layer.lbs().to_vec(),
                ub: layer.ubs().to_vec(),
            },
        );
        Ok(())
    }

    /// Back-substitute the element's expressions down to the reference
    /// layer and concretize. Returns the raw per-neuron bounds.
    fn back_substitute(
        &mut self,
        target: usize,
        size: usize,
        body: &ElementBody,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let slack = self.options.symbolic_rounding_slack;
        let mut residuals: Residuals = BTreeMap::new();

        for bias in self.work_lower_bias.iter_mut().take(size) {
            *bias = 0.0;
        }
        for bias in self.work_upper_bias.iter_mut().take(size) {
            *bias = 0.0;
        }

        // Express the target over its immediate predecessor(s).
        let mut current = match body {
            ElementBody::Input => unreachable!("input layers have no element to substitute"),
            ElementBody::WeightedSum => {
                let layer = self.graph.layer(target)?;
                for neuron in 0..size {
                    self.work_lower_bias[neuron] = layer.bias(neuron);
                    self.work_upper_bias[neuron] = layer.bias(neuron);
                }
                let sources = layer.sorted_source_layers();
                match sources.last() {
                    None => {
                        // Degenerate weighted sum: constant = bias.
                        let width = self.graph.layer(self.reference)?.size();
                        clear_region(&mut self.work1_lb, width, size);
                        clear_region(&mut self.work1_ub, width, size);
                        self.reference
                    }
                    Some(&main) => {
                        for &src in &sources {
                            let weights = layer.weight_matrix(src)?;
                            if src == main {
                                let width = weights.nrows();
                                clear_region(&mut self.work1_lb, width, size);
                                clear_region(&mut self.work1_ub, width, size);
                                for s in 0..width {
                                    for j in 0..size {
                                        self.work1_lb[[s, j]] = weights[[s, j]];
                                        self.work1_ub[[s, j]] = weights[[s, j]];
                                    }
                                }
                            } else {
                                deposit_residual(&mut residuals, src, weights, size);
                            }
                        }
                        main
                    }
                }
            }
            ElementBody::Activation(envelopes) => {
                let width = self.graph.layer(envelopes.source_layer)?.size();
                clear_region(&mut self.work1_lb, width, size);
                clear_region(&mut self.work1_ub, width, size);
                for neuron in 0..size {
                    let lower = &envelopes.lower[neuron];
                    for &(source, coefficient) in &lower.terms {
                        self.work1_lb[[source, neuron]] += coefficient;
                    }
                    self.work_lower_bias[neuron] += lower.bias;
                    let upper = &envelopes.upper[neuron];
                    for &(source, coefficient) in &upper.terms {
                        self.work1_ub[[source, neuron]] += coefficient;
                    }
                    self.work_upper_bias[neuron] += upper.bias;
                }
                envelopes.source_layer
            }
        };

        let store_output = self.options.store_output_bounds
            && Some(target) == self.graph.last_layer_index();
        let mut first_step = true;

        loop {
            if let Some((residual_lb, residual_ub)) = residuals.remove(&current) {
                merge_residual(
                    &mut self.work1_lb,
                    &mut self.work1_ub,
                    &residual_lb,
                    &residual_ub,
                    size,
                );
            }
            self.fold_eliminated(current, size)?;

            if first_step && self.options.store_predecessor_bounds {
                let width = self.graph.layer(current)?.size();
                let bounds = self.snapshot(width, size, &residuals, slack)?;
                self.predecessor_store.insert(target, bounds);
            }
            first_step = false;

            if store_output {
                let width = self.graph.layer(current)?.size();
                let bounds = self.snapshot(width, size, &residuals, slack)?;
                self.output_store.insert(current, bounds);
            }

            if current == self.reference {
                break;
            }

            current = self.substitute(current, size, &mut residuals)?;

            // Residuals the chain has jumped over are concretized now.
            let skipped: Vec<usize> = residuals
                .keys()
                .copied()
                .filter(|&key| key > current)
                .collect();
            for key in skipped {
                let (residual_lb, residual_ub) = residuals.remove(&key).unwrap();
                self.concretize_residual(key, &residual_lb, &residual_ub, size, slack)?;
            }
        }

        // Concretize the final expression against the reference box.
        let reference_width = self.graph.layer(self.reference)?.size();
        let mut lb = vec![0.0; size];
        let mut ub = vec![0.0; size];
        for neuron in 0..size {
            let mut lo = self.work_lower_bias[neuron];
            let mut hi = self.work_upper_bias[neuron];
            for k in 0..reference_width {
                let (ref_lb, ref_ub) = self
                    .graph
                    .source_interval(NeuronRef::new(self.reference, k))?;
                let coefficient = self.work1_lb[[k, neuron]];
                lo += if coefficient >= 0.0 {
                    coefficient * ref_lb
                } else {
                    coefficient * ref_ub
                };
                let coefficient = self.work1_ub[[k, neuron]];
                hi += if coefficient >= 0.0 {
                    coefficient * ref_ub
                } else {
                    coefficient * ref_lb
                };
            }
            lb[neuron] = lo;
            ub[neuron] = hi;
        }
        Ok((lb, ub))
    }

    /// Substitute the expression over `current` with expressions over its
    /// predecessor(s); returns the next chain layer.
    fn substitute(
        &mut self,
        current: usize,
        size: usize,
        residuals: &mut Residuals,
    ) -> Result<usize> {
        let element = self
            .elements
            .get(&current)
            .expect("chain layers are processed before their successors")
            .clone();
        match element.body {
            ElementBody::Input => {
                // An input layer that is not the reference: nothing to
                // substitute through, so its contribution is concretized
                // like a residual.
                let width = element.size;
                let lb = self.work1_lb.clone();
                let ub = self.work1_ub.clone();
                let slack = self.options.symbolic_rounding_slack;
                self.concretize_rows(current, &lb, &ub, width, size, slack)?;
                let reference_width = self.graph.layer(self.reference)?.size();
                clear_region(&mut self.work1_lb, reference_width, size);
                clear_region(&mut self.work1_ub, reference_width, size);
                Ok(self.reference)
            }
            ElementBody::WeightedSum => {
                let layer = self.graph.layer(current)?;
                let current_width = layer.size();
                // Bias rows substitute exactly.
                for neuron in 0..size {
                    let mut lo = 0.0;
                    let mut hi = 0.0;
                    for i in 0..current_width {
                        lo += layer.bias(i) * self.work1_lb[[i, neuron]];
                        hi += layer.bias(i) * self.work1_ub[[i, neuron]];
                    }
                    self.work_lower_bias[neuron] += lo;
                    self.work_upper_bias[neuron] += hi;
                }
                let sources = layer.sorted_source_layers();
                if sources.is_empty() {
                    let reference_width = self.graph.layer(self.reference)?.size();
                    clear_region(&mut self.work1_lb, reference_width, size);
                    clear_region(&mut self.work1_ub, reference_width, size);
                    return Ok(self.reference);
                }
                let main = *sources.last().expect("nonempty");
                for &src in &sources {
                    let layer = self.graph.layer(current)?;
                    let weights = layer.weight_matrix(src)?;
                    let src_width = weights.nrows();
                    if src == main {
                        clear_region(&mut self.work2_lb, src_width, size);
                        clear_region(&mut self.work2_ub, src_width, size);
                        for s in 0..src_width {
                            for j in 0..size {
                                let mut lo = 0.0;
                                let mut hi = 0.0;
                                for i in 0..current_width {
                                    lo += weights[[s, i]] * self.work1_lb[[i, j]];
                                    hi += weights[[s, i]] * self.work1_ub[[i, j]];
                                }
                                self.work2_lb[[s, j]] = lo;
                                self.work2_ub[[s, j]] = hi;
                            }
                        }
                    } else {
                        let entry = residuals.entry(src).or_insert_with(|| {
                            (
                                Array2::zeros((src_width, size)),
                                Array2::zeros((src_width, size)),
                            )
                        });
                        for s in 0..src_width {
                            for j in 0..size {
                                let mut lo = 0.0;
                                let mut hi = 0.0;
                                for i in 0..current_width {
                                    lo += weights[[s, i]] * self.work1_lb[[i, j]];
                                    hi += weights[[s, i]] * self.work1_ub[[i, j]];
                                }
                                entry.0[[s, j]] += lo;
                                entry.1[[s, j]] += hi;
                            }
                        }
                    }
                }
                self.swap_buffers();
                Ok(main)
            }
            ElementBody::Activation(envelopes) => {
                self.substitute_activation(&envelopes, current, size)?;
                self.swap_buffers();
                Ok(envelopes.source_layer)
            }
        }
    }

    /// Sign-aware substitution through an activation's envelopes: a
    /// positive coefficient takes the matching face, a negative one the
    /// opposite face.
    fn substitute_activation(
        &mut self,
        envelopes: &ActivationEnvelopes,
        current: usize,
        size: usize,
    ) -> Result<()> {
        let current_width = self.graph.layer(current)?.size();
        let source_width = self.graph.layer(envelopes.source_layer)?.size();
        clear_region(&mut self.work2_lb, source_width, size);
        clear_region(&mut self.work2_ub, source_width, size);
        for i in 0..current_width {
            for j in 0..size {
                let coefficient = self.work1_lb[[i, j]];
                if coefficient != 0.0 {
                    let face = if coefficient >= 0.0 {
                        &envelopes.lower[i]
                    } else {
                        &envelopes.upper[i]
                    };
                    for &(source, c) in &face.terms {
                        self.work2_lb[[source, j]] += coefficient * c;
                    }
                    self.work_lower_bias[j] += coefficient * face.bias;
                }
                let coefficient = self.work1_ub[[i, j]];
                if coefficient != 0.0 {
                    let face = if coefficient >= 0.0 {
                        &envelopes.upper[i]
                    } else {
                        &envelopes.lower[i]
                    };
                    for &(source, c) in &face.terms {
                        self.work2_ub[[source, j]] += coefficient * c;
                    }
                    self.work_upper_bias[j] += coefficient * face.bias;
                }
            }
        }
        Ok(())
    }

    /// Replace eliminated neurons of `current` by their pinned constant.
    fn fold_eliminated(&mut self, current: usize, size: usize) -> Result<()> {
        let layer = self.graph.layer(current)?;
        let width = layer.size();
        let mut pinned: Vec<(usize, f64)> = Vec::new();
        for i in 0..width {
            if let Some(value) = layer.eliminated_value(i) {
                pinned.push((i, value));
            }
        }
        for (i, value) in pinned {
            for j in 0..size {
                self.work_lower_bias[j] += value * self.work1_lb[[i, j]];
                self.work1_lb[[i, j]] = 0.0;
                self.work_upper_bias[j] += value * self.work1_ub[[i, j]];
                self.work1_ub[[i, j]] = 0.0;
            }
        }
        Ok(())
    }

    /// Concretize a skipped residual's contribution from its interval
    /// bounds, padded by the rounding slack.
    fn concretize_residual(
        &mut self,
        residual_layer: usize,
        residual_lb: &Array2<f64>,
        residual_ub: &Array2<f64>,
        size: usize,
        slack: f64,
    ) -> Result<()> {
        let width = self.graph.layer(residual_layer)?.size();
        self.concretize_rows(residual_layer, residual_lb, residual_ub, width, size, slack)
    }

    fn concretize_rows(
        &mut self,
        layer: usize,
        matrix_lb: &Array2<f64>,
        matrix_ub: &Array2<f64>,
        width: usize,
        size: usize,
        slack: f64,
    ) -> Result<()> {
        for i in 0..width {
            let (lb, ub) = self.graph.source_interval(NeuronRef::new(layer, i))?;
            let lb = lb - slack;
            let ub = ub + slack;
            for j in 0..size {
                let coefficient = matrix_lb[[i, j]];
                self.work_lower_bias[j] += if coefficient >= 0.0 {
                    coefficient * lb
                } else {
                    coefficient * ub
                };
                let coefficient = matrix_ub[[i, j]];
                self.work_upper_bias[j] += if coefficient >= 0.0 {
                    coefficient * ub
                } else {
                    coefficient * lb
                };
            }
        }
        Ok(())
    }

    /// Snapshot the live expression over `width` rows, with pending
    /// residuals concretized into the stored biases.
    fn snapshot(
        &self,
        width: usize,
        size: usize,
        residuals: &Residuals,
        slack: f64,
    ) -> Result<SymbolicBounds> {
        let mut bounds = SymbolicBounds::zeros(width, size);
        for i in 0..width {
            for j in 0..size {
                bounds.lb[[i, j]] = self.work1_lb[[i, j]];
                bounds.ub[[i, j]] = self.work1_ub[[i, j]];
            }
        }
        bounds.lower_bias[..size].copy_from_slice(&self.work_lower_bias[..size]);
        bounds.upper_bias[..size].copy_from_slice(&self.work_upper_bias[..size]);
        for (&residual_layer, (residual_lb, residual_ub)) in residuals {
            let residual_width = self.graph.layer(residual_layer)?.size();
            for i in 0..residual_width {
                let (lb, ub) = self
                    .graph
                    .source_interval(NeuronRef::new(residual_layer, i))?;
                let lb = lb - slack;
                let ub = ub + slack;
                for j in 0..size {
                    let coefficient = residual_lb[[i, j]];
                    bounds.lower_bias[j] += if coefficient >= 0.0 {
                        coefficient * lb
                    } else {
                        coefficient * ub
                    };
                    let coefficient = residual_ub[[i, j]];
                    bounds.upper_bias[j] += if coefficient >= 0.0 {
                        coefficient * ub
                    } else {
                        coefficient * lb
                    };
                }
            }
        }
        Ok(bounds)
    }

    fn swap_buffers(&mut self) {
        std::mem::swap(&mut self.work1_lb, &mut self.work2_lb);
        std::mem::swap(&mut self.work1_ub, &mut self.work2_ub);
    }
}

fn clear_region(matrix: &mut Array2<f64>, rows: usize, cols: usize) {
    for i in 0..rows {
        for j in 0..cols {
            matrix[[i, j]] = 0.0;
        }
    }
}

fn deposit_residual(residuals: &mut Residuals, src: usize, weights: &Array2<f64>, size: usize) {
    let entry = residuals.entry(src).or_insert_with(|| {
        (
            Array2::zeros((weights.nrows(), size)),
            Array2::zeros((weights.nrows(), size)),
        )
    });
    for s in 0..weights.nrows() {
        for j in 0..size {
            entry.0[[s, j]] += weights[[s, j]];
            entry.1[[s, j]] += weights[[s, j]];
        }
    }
}

fn merge_residual(
    work_lb: &mut Array2<f64>,
    work_ub: &mut Array2<f64>,
    residual_lb: &Array2<f64>,
    residual_ub: &Array2<f64>,
    size: usize,
) {
    for i in 0..residual_lb.nrows() {
        for j in 0..size {
            work_lb[[i, j]] += residual_lb[[i, j]];
            work_ub[[i, j]] += residual_ub[[i, j]];
        }
    }
}
