// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The LP oracle abstraction.
//!
//! The tightener talks to its solver exclusively through [`LpOracle`]: add
//! variables and affine constraints, set an objective, solve, inspect the
//! outcome. The capability set is deliberately narrow so tests can
//! substitute a deterministic solver and the core remains correct
//! regardless of solver choice or version.

use ahash::AHashMap;

use crate::error::Result;

/// Name of variable id `v` at the LP boundary.
pub fn variable_name(variable: usize) -> String {
    format!("x{}", variable)
}

/// One `coefficient * variable` term of an affine constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub coefficient: f64,
    pub variable: String,
}

impl Term {
    pub fn new(coefficient: f64, variable: impl Into<String>) -> Self {
        Self {
            coefficient,
            variable: variable.into(),
        }
    }
}

/// Optimization direction of a bound query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Maximize,
    Minimize,
}

/// Narrow capability set of an LP solver instance.
///
/// A solver is owned by one worker at a time (instances move through the
/// free queue, hence `Send`). `reset` clears the objective and solution
/// state but keeps the model; `reset_model` drops everything.
pub trait LpOracle: Send {
    fn add_variable(&mut self, name: &str, lb: f64, ub: f64);
    fn contains_variable(&self, name: &str) -> bool;
    fn set_lower_bound(&mut self, name: &str, value: f64);
    fn set_upper_bound(&mut self, name: &str, value: f64);

    fn add_eq_constraint(&mut self, terms: &[Term], scalar: f64);
    fn add_leq_constraint(&mut self, terms: &[Term], scalar: f64);
    fn add_geq_constraint(&mut self, terms: &[Term], scalar: f64);

    /// Maximize `terms`.
    fn set_objective(&mut self, terms: &[Term]);
    /// Minimize `terms`.
    fn set_cost(&mut self, terms: &[Term]);

    fn set_time_limit(&mut self, seconds: f64);

    fn reset(&mut self);
    fn reset_model(&mut self);

    fn solve(&mut self) -> Result<()>;

    fn infeasible(&self) -> bool;
    fn cutoff_occurred(&self) -> bool;
    fn optimal(&self) -> bool;
    fn timed_out(&self) -> bool;

    /// Fill `assignment` with the solution values and return the objective
    /// value. Only meaningful after an optimal solve.
    fn extract_solution(&self, assignment: &mut AHashMap<String, f64>) -> f64;

    /// Best objective bound known to the solver; sound for the query
    /// direction after a timeout.
    fn objective_bound(&self) -> f64;
}
