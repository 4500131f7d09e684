// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared six-layer scenario graphs: input-2 -> affine-3 -> activation-3
//! -> affine-2 -> activation-2 -> affine-2 over the input box [-1, 1]^2.

use veribound::graph::{LayerGraph, LayerKind, NeuronRef};

/// Layer kinds and sizes, chain dependencies, variable ids in layer-major
/// order, input box [-1, 1]^2 and loose bounds everywhere else.
pub fn scaffold(kinds: &[(LayerKind, usize)]) -> LayerGraph {
    let mut graph = LayerGraph::new();
    for (index, &(kind, size)) in kinds.iter().enumerate() {
        graph.add_layer(index, kind, size).unwrap();
        if index > 0 {
            graph.add_dependency(index - 1, index).unwrap();
        }
    }
    let mut variable = 0;
    for (index, &(_, size)) in kinds.iter().enumerate() {
        for neuron in 0..size {
            graph
                .set_neuron_variable(NeuronRef::new(index, neuron), variable)
                .unwrap();
            variable += 1;
        }
    }
    {
        let input = graph.layer_mut(0).unwrap();
        input.overwrite_bounds(0, -1.0, 1.0).unwrap();
        input.overwrite_bounds(1, -1.0, 1.0).unwrap();
    }
    for (index, &(_, size)) in kinds.iter().enumerate().skip(1) {
        let layer = graph.layer_mut(index).unwrap();
        for neuron in 0..size {
            layer.overwrite_bounds(neuron, -1e6, 1e6).unwrap();
        }
    }
    graph
}

/// First affine block shared by every scenario, plus element-wise
/// activation sources into layer 2.
pub fn first_affine_block(graph: &mut LayerGraph) {
    graph.set_weight(0, 0, 1, 0, 1.0).unwrap();
    graph.set_weight(0, 0, 1, 1, 2.0).unwrap();
    graph.set_weight(0, 1, 1, 1, -3.0).unwrap();
    graph.set_weight(0, 1, 1, 2, 1.0).unwrap();
    graph.set_bias(1, 0, 1.0).unwrap();

    for neuron in 0..3 {
        graph.add_activation_source(1, neuron, 2, neuron).unwrap();
    }
}

/// Second affine block of the wide (2-output) scenarios; `w72` is the
/// weight from the third activation neuron into the second output.
pub fn second_affine_block_wide(graph: &mut LayerGraph, w72: f64) {
    graph.set_weight(2, 0, 3, 0, 1.0).unwrap();
    graph.set_weight(2, 0, 3, 1, -1.0).unwrap();
    graph.set_weight(2, 1, 3, 0, 1.0).unwrap();
    graph.set_weight(2, 1, 3, 1, 1.0).unwrap();
    graph.set_weight(2, 2, 3, 0, -1.0).unwrap();
    graph.set_weight(2, 2, 3, 1, w72).unwrap();
    graph.set_bias(3, 1, 2.0).unwrap();

    graph.add_activation_source(3, 0, 4, 0).unwrap();
    graph.add_activation_source(3, 1, 4, 1).unwrap();

    graph.set_weight(4, 0, 5, 0, 1.0).unwrap();
    graph.set_weight(4, 0, 5, 1, 1.0).unwrap();
    graph.set_weight(4, 1, 5, 1, 3.0).unwrap();
}

/// Second affine block of the narrow scenarios whose second activation
/// collapses both affine outputs into one neuron.
pub fn second_affine_block_narrow(graph: &mut LayerGraph) {
    graph.set_weight(2, 0, 3, 0, 1.0).unwrap();
    graph.set_weight(2, 0, 3, 1, -1.0).unwrap();
    graph.set_weight(2, 1, 3, 0, 1.0).unwrap();
    graph.set_weight(2, 1, 3, 1, 1.0).unwrap();
    graph.set_weight(2, 2, 3, 0, -1.0).unwrap();
    graph.set_weight(2, 2, 3, 1, -1.0).unwrap();
    graph.set_bias(3, 1, 2.0).unwrap();

    graph.add_activation_source(3, 0, 4, 0).unwrap();
    graph.add_activation_source(3, 1, 4, 0).unwrap();

    graph.set_weight(4, 0, 5, 0, -1.0).unwrap();
}

pub fn abs_relu_graph() -> LayerGraph {
    let mut graph = scaffold(&[
        (LayerKind::Input, 2),
        (LayerKind::WeightedSum, 3),
        (LayerKind::AbsoluteValue, 3),
        (LayerKind::WeightedSum, 2),
        (LayerKind::Relu, 2),
        (LayerKind::WeightedSum, 2),
    ]);
    first_affine_block(&mut graph);
    second_affine_block_wide(&mut graph, -5.0);
    graph
}

pub fn round_sign_graph() -> LayerGraph {
    let mut graph = scaffold(&[
        (LayerKind::Input, 2),
        (LayerKind::WeightedSum, 3),
        (LayerKind::Round, 3),
        (LayerKind::WeightedSum, 2),
        (LayerKind::Sign, 2),
        (LayerKind::WeightedSum, 2),
    ]);
    first_affine_block(&mut graph);
    second_affine_block_wide(&mut graph, -1.0);
    graph
}

pub fn leaky_relu_sigmoid_graph() -> LayerGraph {
    let mut graph = scaffold(&[
        (LayerKind::Input, 2),
        (LayerKind::WeightedSum, 3),
        (LayerKind::LeakyRelu, 3),
        (LayerKind::WeightedSum, 2),
        (LayerKind::Sigmoid, 2),
        (LayerKind::WeightedSum, 2),
    ]);
    graph.layer_mut(2).unwrap().set_alpha(0.1);
    first_affine_block(&mut graph);
    second_affine_block_wide(&mut graph, -1.0);
    graph
}

pub fn softmax_max_graph() -> LayerGraph {
    let mut graph = scaffold(&[
        (LayerKind::Input, 2),
        (LayerKind::WeightedSum, 3),
        (LayerKind::Softmax, 3),
        (LayerKind::WeightedSum, 2),
        (LayerKind::Max, 1),
        (LayerKind::WeightedSum, 1),
    ]);
    graph.set_weight(0, 0, 1, 0, 1.0).unwrap();
    graph.set_weight(0, 0, 1, 1, 2.0).unwrap();
    graph.set_weight(0, 1, 1, 1, -3.0).unwrap();
    graph.set_weight(0, 1, 1, 2, 1.0).unwrap();
    graph.set_bias(1, 0, 1.0).unwrap();
    // Every softmax output reads the whole logit group.
    for output in 0..3 {
        for logit in 0..3 {
            graph.add_activation_source(1, logit, 2, output).unwrap();
        }
    }
    second_affine_block_narrow(&mut graph);
    graph
}

pub fn relu_bilinear_graph() -> LayerGraph {
    let mut graph = scaffold(&[
        (LayerKind::Input, 2),
        (LayerKind::WeightedSum, 3),
        (LayerKind::Relu, 3),
        (LayerKind::WeightedSum, 2),
        (LayerKind::Bilinear, 1),
        (LayerKind::WeightedSum, 1),
    ]);
    first_affine_block(&mut graph);
    second_affine_block_narrow(&mut graph);
    graph
}
