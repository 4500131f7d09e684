// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # veribound-deeppoly
//!
//! DeepPoly-style symbolic bound propagation over a
//! [`veribound_graph::LayerGraph`].
//!
//! Each layer gets an *abstract element*: affine lower and upper envelopes
//! of its neurons in terms of its immediate predecessor. Running the
//! analysis back-substitutes those envelopes layer by layer down to the
//! reference (input) layer, with a sign-aware branch at every inequality
//! substitution, then concretizes against the reference box and refines the
//! layer bounds in place.
//!
//! The engine owns all symbolic working memory (four `max_width ×
//! max_width` matrices and two bias vectors) and lends it to the elements
//! for the duration of a run; see [`analysis::DeepPolyAnalysis`].

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod analysis;
pub mod element;
pub mod envelope;
pub mod error;
pub mod options;
pub mod softmax;
pub mod storage;

pub use analysis::DeepPolyAnalysis;
pub use error::{DeepPolyError, Result};
pub use options::{AnalysisOptions, SoftmaxBoundKind, SymbolicBoundMode};
pub use storage::{SymbolicBounds, SymbolicBoundsStore};
