// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # veribound
//!
//! Bound-tightening core for neural-network verification.
//!
//! Given a feed-forward computation graph with piecewise-linear and
//! nonlinear activations plus per-input interval constraints, veribound
//! computes sound lower and upper bounds for every intermediate variable:
//!
//! - [`graph`]: the layer-graph data model: topology, refine-only
//!   interval bounds, forward evaluation, interval arithmetic.
//! - [`deeppoly`]: the symbolic bound engine: per-layer abstract elements
//!   back-substituted to the input layer with sign-aware envelope
//!   selection.
//! - [`lp`]: LP relaxations of the graph and the worker-pool tightener
//!   that minimizes and maximizes each neuron's variable against an
//!   [`lp::LpOracle`] implementation.
//!
//! ## Quick start
//!
//! ```rust
//! use veribound::graph::{LayerGraph, LayerKind, NeuronRef};
//! use veribound::deeppoly::{AnalysisOptions, DeepPolyAnalysis};
//!
//! let mut graph = LayerGraph::new();
//! graph.add_layer(0, LayerKind::Input, 1)?;
//! graph.add_layer(1, LayerKind::Relu, 1)?;
//! graph.add_dependency(0, 1)?;
//! graph.add_activation_source(0, 0, 1, 0)?;
//! graph.set_neuron_variable(NeuronRef::new(0, 0), 0)?;
//! graph.set_neuron_variable(NeuronRef::new(1, 0), 1)?;
//! graph.layer_mut(0)?.overwrite_bounds(0, -1.0, 1.0)?;
//! graph.layer_mut(1)?.overwrite_bounds(0, -10.0, 10.0)?;
//!
//! DeepPolyAnalysis::new(&mut graph, AnalysisOptions::default())?.run()?;
//! assert!(graph.layer(1)?.ub(0) <= 1.0);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use veribound_deeppoly as deeppoly;
pub use veribound_graph as graph;
pub use veribound_lp as lp;
