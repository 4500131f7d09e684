// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! # veribound-lp
//!
//! Linear-programming relaxations of a layer graph, and the bound
//! tightener that minimizes and maximizes every neuron's variable under
//! those relaxations.
//!
//! The LP solver is abstracted behind the narrow [`LpOracle`] trait so the
//! core stays correct regardless of solver choice; a deterministic
//! pure-Rust implementation backed by `minilp` ships in
//! [`minilp_oracle::MinilpOracle`]. The tightener distributes one solver
//! instance per worker through a bounded queue and serializes relaxation
//! construction and bound write-back through a single mutex; see
//! [`tightener`].

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod minilp_oracle;
pub mod oracle;
pub mod relaxation;
pub mod tightener;

pub use error::{LpError, Result};
pub use minilp_oracle::MinilpOracle;
pub use oracle::{variable_name, LpOracle, Objective, Term};
pub use relaxation::{RelaxationBuilder, RelaxationOptions};
pub use tightener::{
    tighten_bounds, tighten_incremental, tighten_single_layer, TightenerOptions, TighteningMode,
    TighteningStats,
};
