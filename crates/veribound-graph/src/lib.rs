// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # veribound-graph
//!
//! Layer-graph data model for the bound-tightening core of a neural-network
//! verifier.
//!
//! A network is a DAG of [`Layer`]s indexed by `usize`, each a fixed-size
//! vector of neurons. Weighted-sum layers carry dense weight matrices into
//! their predecessors; activation layers reference per-neuron sources.
//! Every neuron has a refine-only interval `[lb, ub]`, an externally visible
//! variable id, and may be *eliminated* (pinned to a constant and removed
//! from the variable surface).
//!
//! On top of the data model this crate provides:
//! - forward evaluation ([`LayerGraph::compute_assignment`]) and simulation
//!   sample propagation ([`LayerGraph::compute_simulations`]),
//! - concrete interval-arithmetic bound propagation
//!   ([`LayerGraph::compute_interval_bounds`]),
//! - the [`TighteningListener`] interface through which bound refinements
//!   are broadcast to the verifier.
//!
//! Symbolic bound propagation and LP-based refinement live in the sibling
//! crates `veribound-deeppoly` and `veribound-lp`.

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod eval;
pub mod graph;
pub mod interval;
pub mod layer;
pub mod tolerance;
pub mod types;

pub use error::{GraphError, Result};
pub use graph::LayerGraph;
pub use layer::Layer;
pub use types::{
    BoundKind, CollectingListener, LayerKind, NeuronRef, PolygonalTightening, Tightening,
    TighteningListener,
};
