// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The layer graph: a DAG of layers ordered by index.
//!
//! Relationships are represented by integer indices rather than owning
//! references, which keeps the graph acyclic by construction (a dependency
//! must go from a smaller index to a strictly larger one) and lets analyses
//! address layers without borrowing the whole structure. Successor edges are
//! maintained as the exact transpose of the predecessor edges.

use std::collections::{BTreeMap, BTreeSet};

use ahash::AHashMap;

use crate::error::{GraphError, Result};
use crate::layer::Layer;
use crate::types::{LayerKind, NeuronRef};

/// The full network graph consumed by every bound analysis.
#[derive(Debug, Clone, Default)]
pub struct LayerGraph {
    layers: BTreeMap<usize, Layer>,
    /// Transpose of the predecessor edges.
    successors: AHashMap<usize, BTreeSet<usize>>,
    /// Externally visible variable id -> neuron address.
    variables: AHashMap<usize, NeuronRef>,
    input_layer: Option<usize>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    pub fn add_layer(&mut self, index: usize, kind: LayerKind, size: usize) -> Result<()> {
        if self.layers.contains_key(&index) {
            return Err(GraphError::DuplicateLayer(index));
        }
        if kind == LayerKind::Input && self.input_layer.is_none() {
            self.input_layer = Some(index);
        }
        self.layers.insert(index, Layer::new(index, kind, size));
        Ok(())
    }

    /// Mark `dst` as depending on `src`. Dependencies must respect the
    /// topological order: `src < dst`.
    pub fn add_dependency(&mut self, src: usize, dst: usize) -> Result<()> {
        if src >= dst {
            return Err(GraphError::InvalidDependency { src, dst });
        }
        let src_size = self.layer(src)?.size();
        self.layer_mut(dst)?.add_source_layer(src, src_size);
        self.successors.entry(src).or_default().insert(dst);
        Ok(())
    }

    /// Remove the dependency `src -> dst` together with its weights.
    pub fn remove_dependency(&mut self, src: usize, dst: usize) -> Result<()> {
        self.layer_mut(dst)?.remove_source_layer(src);
        if let Some(successors) = self.successors.get_mut(&src) {
            successors.remove(&dst);
        }
        Ok(())
    }

    pub fn set_weight(
        &mut self,
        src_layer: usize,
        src_neuron: usize,
        dst_layer: usize,
        dst_neuron: usize,
        weight: f64,
    ) -> Result<()> {
        self.layer_mut(dst_layer)?
            .set_weight(src_layer, src_neuron, dst_neuron, weight)
    }

    pub fn set_bias(&mut self, layer: usize, neuron: usize, bias: f64) -> Result<()> {
        self.layer_mut(layer)?.set_bias(neuron, bias)
    }

    pub fn add_activation_source(
        &mut self,
        src_layer: usize,
        src_neuron: usize,
        dst_layer: usize,
        dst_neuron: usize,
    ) -> Result<()> {
        let src_size = self.layer(src_layer)?.size();
        if src_neuron >= src_size {
            return Err(GraphError::NeuronOutOfRange {
                layer: src_layer,
                neuron: src_neuron,
                size: src_size,
            });
        }
        self.layer_mut(dst_layer)?
            .add_activation_source(NeuronRef::new(src_layer, src_neuron), dst_neuron)
    }

    pub fn set_neuron_variable(&mut self, neuron: NeuronRef, variable: usize) -> Result<()> {
        self.layer_mut(neuron.layer)?
            .set_neuron_variable(neuron.neuron, variable)?;
        self.variables.insert(variable, neuron);
        Ok(())
    }

    /// Pin the neuron behind `variable` to `value` and drop it from the
    /// variable surface.
    pub fn eliminate_neuron(&mut self, variable: usize, value: f64) -> Result<()> {
        let neuron = self.variable_to_neuron(variable)?;
        self.layer_mut(neuron.layer)?
            .eliminate_neuron(neuron.neuron, value)?;
        self.variables.remove(&variable);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    pub fn layer(&self, index: usize) -> Result<&Layer> {
        self.layers.get(&index).ok_or(GraphError::LayerNotFound(index))
    }

    pub fn layer_mut(&mut self, index: usize) -> Result<&mut Layer> {
        self.layers
            .get_mut(&index)
            .ok_or(GraphError::LayerNotFound(index))
    }

    /// Layers in ascending index order.
    pub fn layers(&self) -> impl Iterator<Item = (usize, &Layer)> {
        self.layers.iter().map(|(index, layer)| (*index, layer))
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn last_layer_index(&self) -> Option<usize> {
        self.layers.keys().next_back().copied()
    }

    pub fn max_layer_size(&self) -> usize {
        self.layers.values().map(Layer::size).max().unwrap_or(0)
    }

    /// The reference input layer.
    pub fn input_layer(&self) -> Result<usize> {
        self.input_layer.ok_or(GraphError::NoInputLayer)
    }

    /// Successor layers of `index`, ascending.
    pub fn successors(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.successors
            .get(&index)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn variable_to_neuron(&self, variable: usize) -> Result<NeuronRef> {
        self.variables
            .get(&variable)
            .copied()
            .ok_or(GraphError::UnknownVariable(variable))
    }

    pub fn neuron_to_variable(&self, neuron: NeuronRef) -> Result<usize> {
        self.layer(neuron.layer)?.neuron_to_variable(neuron.neuron)
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Check the structural invariants the analyses rely on: predecessor
    /// order, transpose consistency, declared source widths against weight
    /// matrices, and activation sources referencing existing neurons.
    pub fn validate(&self) -> Result<()> {
        for (index, layer) in self.layers() {
            for (&src, &declared) in layer.source_layers() {
                if src >= index {
                    return Err(GraphError::InvalidDependency { src, dst: index });
                }
                let src_layer = self.layer(src)?;
                if src_layer.size() != declared {
                    return Err(GraphError::WidthMismatch {
                        layer: index,
                        declared,
                        actual: src_layer.size(),
                    });
                }
                if layer.kind() == LayerKind::WeightedSum {
                    let matrix = layer.weight_matrix(src)?;
                    if matrix.nrows() != declared || matrix.ncols() != layer.size() {
                        return Err(GraphError::WidthMismatch {
                            layer: index,
                            declared,
                            actual: matrix.nrows(),
                        });
                    }
                }
                if !self
                    .successors
                    .get(&src)
                    .map(|set| set.contains(&index))
                    .unwrap_or(false)
                {
                    return Err(GraphError::InvalidDependency { src, dst: index });
                }
            }
            if layer.kind().is_activation() {
                for neuron in 0..layer.size() {
                    for source in layer.activation_sources(neuron) {
                        let src_layer = self.layer(source.layer)?;
                        if source.neuron >= src_layer.size() {
                            return Err(GraphError::NeuronOutOfRange {
                                layer: source.layer,
                                neuron: source.neuron,
                                size: src_layer.size(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_layer_graph() -> LayerGraph {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 2).unwrap();
        graph.add_layer(1, LayerKind::WeightedSum, 3).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph
    }

    #[test]
    fn dependency_maintains_transpose() {
        let graph = two_layer_graph();
        assert_eq!(graph.successors(0).collect::<Vec<_>>(), vec![1]);
        assert!(graph.layer(1).unwrap().source_layers().contains_key(&0));
        graph.validate().unwrap();
    }

    #[test]
    fn dependency_must_respect_order() {
        let mut graph = two_layer_graph();
        assert!(matches!(
            graph.add_dependency(1, 0),
            Err(GraphError::InvalidDependency { .. })
        ));
    }

    #[test]
    fn variable_round_trip_through_graph() {
        let mut graph = two_layer_graph();
        graph
            .set_neuron_variable(NeuronRef::new(1, 2), 14)
            .unwrap();
        assert_eq!(graph.variable_to_neuron(14).unwrap(), NeuronRef::new(1, 2));
        assert_eq!(graph.neuron_to_variable(NeuronRef::new(1, 2)).unwrap(), 14);
    }

    #[test]
    fn elimination_drops_variable_from_graph_map() {
        let mut graph = two_layer_graph();
        graph.set_neuron_variable(NeuronRef::new(1, 0), 5).unwrap();
        graph.eliminate_neuron(5, 1.5).unwrap();
        assert!(graph.variable_to_neuron(5).is_err());
        let layer = graph.layer(1).unwrap();
        assert!(layer.neuron_eliminated(0));
        assert_eq!(layer.eliminated_value(0), Some(1.5));
    }

    #[test]
    fn duplicate_layer_rejected() {
        let mut graph = two_layer_graph();
        assert!(matches!(
            graph.add_layer(1, LayerKind::Relu, 3),
            Err(GraphError::DuplicateLayer(1))
        ));
    }
}
