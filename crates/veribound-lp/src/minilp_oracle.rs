// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic LP oracle backed by the pure-Rust `minilp` simplex
//! solver.
//!
//! The oracle keeps its own model description and rebuilds the `minilp`
//! problem at each solve, because `minilp` fixes objective coefficients at
//! variable-creation time while the tightener re-targets the objective
//! between solves on one model. `minilp` has no cutoff or time-limit
//! support, so those predicates are always false and the time limit is
//! accepted and ignored.

use ahash::AHashMap;
use minilp::{ComparisonOp, LinearExpr, OptimizationDirection, Problem};

use crate::error::{LpError, Result};
use crate::oracle::{LpOracle, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    Eq,
    Leq,
    Geq,
}

#[derive(Debug, Clone)]
struct Row {
    terms: Vec<(usize, f64)>,
    relation: Relation,
    scalar: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    NotSolved,
    Optimal,
    Infeasible,
    Unbounded,
}

/// A deterministic [`LpOracle`] implementation; see the module docs.
#[derive(Debug, Clone)]
pub struct MinilpOracle {
    names: Vec<String>,
    bounds: Vec<(f64, f64)>,
    index: AHashMap<String, usize>,
    rows: Vec<Row>,
    objective: Option<(Vec<(usize, f64)>, OptimizationDirection)>,
    status: Status,
    solution: Vec<f64>,
    objective_value: f64,
}

impl MinilpOracle {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            bounds: Vec::new(),
            index: AHashMap::new(),
            rows: Vec::new(),
            objective: None,
            status: Status::NotSolved,
            solution: Vec::new(),
            objective_value: 0.0,
        }
    }

    fn variable_index(&mut self, name: &str) -> usize {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        let index = self.names.len();
        self.names.push(name.to_string());
        self.bounds.push((f64::NEG_INFINITY, f64::INFINITY));
        self.index.insert(name.to_string(), index);
        index
    }

    fn resolve_terms(&mut self, terms: &[Term]) -> Vec<(usize, f64)> {
        // Aggregate repeated variables so the backing expression sees each
        // one once.
        let mut resolved: Vec<(usize, f64)> = Vec::with_capacity(terms.len());
        for term in terms {
            let index = self.variable_index(&term.variable);
            match resolved.iter_mut().find(|(i, _)| *i == index) {
                Some((_, coefficient)) => *coefficient += term.coefficient,
                None => resolved.push((index, term.coefficient)),
            }
        }
        resolved
    }

    fn push_row(&mut self, terms: &[Term], relation: Relation, scalar: f64) {
        let terms = self.resolve_terms(terms);
        self.rows.push(Row {
            terms,
            relation,
            scalar,
        });
        self.status = Status::NotSolved;
    }

    fn set_objective_terms(&mut self, terms: &[Term], direction: OptimizationDirection) {
        let terms = self.resolve_terms(terms);
        self.objective = Some((terms, direction));
        self.status = Status::NotSolved;
    }
}

impl Default for MinilpOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl LpOracle for MinilpOracle {
    fn add_variable(&mut self, name: &str, lb: f64, ub: f64) {
        let index = self.variable_index(name);
        self.bounds[index] = (lb, ub);
        self.status = Status::NotSolved;
    }

    fn contains_variable(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn set_lower_bound(&mut self, name: &str, value: f64) {
        let index = self.variable_index(name);
        self.bounds[index].0 = value;
        self.status = Status::NotSolved;
    }

    fn set_upper_bound(&mut self, name: &str, value: f64) {
        let index = self.variable_index(name);
        self.bounds[index].1 = value;
        self.status = Status::NotSolved;
    }

    fn add_eq_constraint(&mut self, terms: &[Term], scalar: f64) {
        self.push_row(terms, Relation::Eq, scalar);
    }

    fn add_leq_constraint(&mut self, terms: &[Term], scalar: f64) {
        self.push_row(terms, Relation::Leq, scalar);
    }

    fn add_geq_constraint(&mut self, terms: &[Term], scalar: f64) {
        self.push_row(terms, Relation::Geq, scalar);
    }

    fn set_objective(&mut self, terms: &[Term]) {
        self.set_objective_terms(terms, OptimizationDirection::Maximize);
    }

    fn set_cost(&mut self, terms: &[Term]) {
        self.set_objective_terms(terms, OptimizationDirection::Minimize);
    }

    fn set_time_limit(&mut self, _seconds: f64) {}

    fn reset(&mut self) {
        self.objective = None;
        self.status = Status::NotSolved;
        self.solution.clear();
        self.objective_value = 0.0;
    }

    fn reset_model(&mut self) {
        *self = Self::new();
    }

    fn solve(&mut self) -> Result<()> {
        let (objective, direction) = match &self.objective {
            Some((terms, direction)) => (terms.clone(), *direction),
            None => (Vec::new(), OptimizationDirection::Minimize),
        };
        let mut problem = Problem::new(direction);
        let variables: Vec<minilp::Variable> = self
            .bounds
            .iter()
            .enumerate()
            .map(|(index, &(lb, ub))| {
                let coefficient = objective
                    .iter()
                    .find(|(i, _)| *i == index)
                    .map(|(_, c)| *c)
                    .unwrap_or(0.0);
                problem.add_var(coefficient, (lb, ub))
            })
            .collect();
        for row in &self.rows {
            if row.terms.is_empty() {
                // A fully folded constraint compares 0 against the scalar.
                let satisfied = match row.relation {
                    Relation::Eq => row.scalar.abs() <= 1e-12,
                    Relation::Leq => 0.0 <= row.scalar,
                    Relation::Geq => 0.0 >= row.scalar,
                };
                if !satisfied {
                    self.status = Status::Infeasible;
                    return Ok(());
                }
                continue;
            }
            let mut expression = LinearExpr::empty();
            for &(index, coefficient) in &row.terms {
                expression.add(variables[index], coefficient);
            }
            let op = match row.relation {
                Relation::Eq => ComparisonOp::Eq,
                Relation::Leq => ComparisonOp::Le,
                Relation::Geq => ComparisonOp::Ge,
            };
            problem.add_constraint(expression, op, row.scalar);
        }
        match problem.solve() {
            Ok(solution) => {
                self.objective_value = solution.objective();
                self.solution = variables.iter().map(|&v| solution[v]).collect();
                self.status = Status::Optimal;
                Ok(())
            }
            Err(minilp::Error::Infeasible) => {
                self.status = Status::Infeasible;
                Ok(())
            }
            Err(minilp::Error::Unbounded) => {
                self.status = Status::Unbounded;
                Ok(())
            }
        }
    }

    fn infeasible(&self) -> bool {
        self.status == Status::Infeasible
    }

    fn cutoff_occurred(&self) -> bool {
        false
    }

    fn optimal(&self) -> bool {
        self.status == Status::Optimal
    }

    fn timed_out(&self) -> bool {
        false
    }

    fn extract_solution(&self, assignment: &mut AHashMap<String, f64>) -> f64 {
        for (name, &value) in self.names.iter().zip(self.solution.iter()) {
            assignment.insert(name.clone(), value);
        }
        self.objective_value
    }

    fn objective_bound(&self) -> f64 {
        self.objective_value
    }
}

impl MinilpOracle {
    /// Status check used by callers that want a fatal error for an
    /// unbounded model instead of silently false predicates.
    pub fn unbounded(&self) -> Result<()> {
        if self.status == Status::Unbounded {
            return Err(LpError::SolverFailure("model is unbounded".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::variable_name;

    #[test]
    fn maximizes_and_minimizes_over_a_box() {
        let mut oracle = MinilpOracle::new();
        oracle.add_variable("x0", -1.0, 1.0);
        oracle.add_variable("x1", -1.0, 1.0);
        // y = x0 + 2 x1
        oracle.add_variable("x2", -10.0, 10.0);
        oracle.add_eq_constraint(
            &[
                Term::new(-1.0, "x2"),
                Term::new(1.0, "x0"),
                Term::new(2.0, "x1"),
            ],
            0.0,
        );

        oracle.set_objective(&[Term::new(1.0, "x2")]);
        oracle.solve().unwrap();
        assert!(oracle.optimal());
        let mut assignment = AHashMap::new();
        let max = oracle.extract_solution(&mut assignment);
        assert!((max - 3.0).abs() < 1e-6);

        oracle.reset();
        oracle.set_cost(&[Term::new(1.0, "x2")]);
        oracle.solve().unwrap();
        let min = oracle.extract_solution(&mut assignment);
        assert!((min + 3.0).abs() < 1e-6);
        assert!((assignment["x0"] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn detects_infeasibility() {
        let mut oracle = MinilpOracle::new();
        oracle.add_variable("x0", 0.0, 1.0);
        oracle.add_geq_constraint(&[Term::new(1.0, "x0")], 2.0);
        oracle.set_objective(&[Term::new(1.0, "x0")]);
        oracle.solve().unwrap();
        assert!(oracle.infeasible());
        assert!(!oracle.optimal());
    }

    #[test]
    fn reset_keeps_model_reset_model_drops_it() {
        let mut oracle = MinilpOracle::new();
        oracle.add_variable(&variable_name(4), 0.0, 2.0);
        oracle.set_objective(&[Term::new(1.0, variable_name(4))]);
        oracle.solve().unwrap();
        assert!(oracle.optimal());

        oracle.reset();
        assert!(oracle.contains_variable("x4"));
        oracle.set_cost(&[Term::new(1.0, variable_name(4))]);
        oracle.solve().unwrap();
        let mut assignment = AHashMap::new();
        assert!((oracle.extract_solution(&mut assignment) - 0.0).abs() < 1e-9);

        oracle.reset_model();
        assert!(!oracle.contains_variable("x4"));
    }

    #[test]
    fn repeated_terms_aggregate() {
        let mut oracle = MinilpOracle::new();
        oracle.add_variable("x0", -5.0, 5.0);
        // x0 + x0 <= 4  =>  x0 <= 2
        oracle.add_leq_constraint(&[Term::new(1.0, "x0"), Term::new(1.0, "x0")], 4.0);
        oracle.set_objective(&[Term::new(1.0, "x0")]);
        oracle.solve().unwrap();
        let mut assignment = AHashMap::new();
        assert!((oracle.extract_solution(&mut assignment) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn tightened_variable_bounds_apply() {
        let mut oracle = MinilpOracle::new();
        oracle.add_variable("x0", -5.0, 5.0);
        oracle.set_upper_bound("x0", 1.5);
        oracle.set_objective(&[Term::new(1.0, "x0")]);
        oracle.solve().unwrap();
        let mut assignment = AHashMap::new();
        assert!((oracle.extract_solution(&mut assignment) - 1.5).abs() < 1e-6);
    }
}
