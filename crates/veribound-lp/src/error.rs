// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for LP-based bound tightening.

use veribound_graph::GraphError;

pub type Result<T> = std::result::Result<T, LpError>;

/// Errors raised while building relaxations or tightening bounds.
///
/// [`LpError::InfeasibleQuery`] (and an empty interval surfacing through
/// [`LpError::Graph`]) is the recoverable "region is infeasible" outcome;
/// everything else aborts the verification run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LpError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("LP relaxation is infeasible")]
    InfeasibleQuery,

    #[error("LP solver returned an unexpected status")]
    UnexpectedSolverStatus,

    #[error("LP solver failure: {0}")]
    SolverFailure(String),

    #[error("Parameter {value} for layer {layer} lies outside [0, 1]")]
    ParameterOutOfRange { layer: usize, value: f64 },

    #[error("Parameter vector for layer {layer} has {actual} entries, expected {expected}")]
    ParameterArity {
        layer: usize,
        expected: usize,
        actual: usize,
    },
}

impl LpError {
    /// True when the error means "the query region is infeasible" rather
    /// than a structural or solver defect.
    pub fn is_infeasible(&self) -> bool {
        match self {
            LpError::InfeasibleQuery => true,
            LpError::Graph(e) => e.is_infeasible(),
            _ => false,
        }
    }
}
