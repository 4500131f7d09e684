// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! The LP-relaxation bound tightener.
//!
//! For each target neuron the tightener builds a relaxation of the graph,
//! maximizes and minimizes the neuron's variable, and writes strictly
//! tighter results back (padded by the LP rounding slack so tightenings
//! stay sound under floating-point error).
//!
//! Work is distributed over a pool of LP solver instances held in a
//! bounded free queue: the orchestrator blocks on the queue with a
//! cooperative sleep, builds the relaxation into the acquired solver under
//! the shared mutex, and dispatches a worker task that runs both bound
//! queries and returns the solver to the queue, also on failure, so no
//! instance leaks. Bound write-back and listener notification happen under
//! the same mutex, so a later relaxation build always sees prior
//! tightenings. With a single worker everything runs inline on the calling
//! thread.
//!
//! Three sweep policies exist: a forward sweep over growing prefixes, a
//! backward sweep that re-runs each layer until it stops improving, and
//! the backward PMNR policy which additionally branches over the unfixed
//! piecewise-linear neurons of the last activation layer, bounds the
//! output layer per branch, applies the branch hull, and collects the
//! infeasible branches.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use veribound_graph::{
    tolerance, LayerGraph, LayerKind, NeuronRef, PolygonalTightening, Tightening,
    TighteningListener,
};

use crate::error::{LpError, Result};
use crate::oracle::{variable_name, LpOracle, Objective, Term};
use crate::relaxation::{RelaxationBuilder, RelaxationOptions};

/// Cap on the number of neurons the PMNR policy branches over; the branch
/// count is exponential in it.
const PMNR_MAX_BRANCHED_NEURONS: usize = 4;

/// Which sweep policy drives the tightener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TighteningMode {
    /// Sweep layers forward, each under the prefix relaxation `[0, k]`.
    Forward,
    /// Sweep layers in reverse under the backward ball relaxation,
    /// repeating each layer until it stops improving.
    #[default]
    BackwardConverge,
    /// The converge sweep plus per-multi-neuron branching on the output
    /// layer.
    BackwardPmnr,
}

/// Configuration of a tightening run.
#[derive(Debug, Clone)]
pub struct TightenerOptions {
    /// Worker count; `1` runs inline without thread creation.
    pub workers: usize,
    pub mode: TighteningMode,
    /// Threshold past which a neuron's phase counts as decided; neurons
    /// already resolved against it are skipped.
    pub cutoff: Option<f64>,
    /// Conservative padding applied to every accepted LP bound.
    pub lp_rounding_slack: f64,
    /// Per-solve time limit handed to the oracle.
    pub time_limit: Option<f64>,
    pub relaxation: RelaxationOptions,
}

impl Default for TightenerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            mode: TighteningMode::default(),
            cutoff: None,
            lp_rounding_slack: 1e-7,
            time_limit: None,
            relaxation: RelaxationOptions::default(),
        }
    }
}

/// Bookkeeping of one tightening run.
#[derive(Debug, Clone, Default)]
pub struct TighteningStats {
    pub tighter_bounds: usize,
    pub sign_changes: usize,
    pub cutoffs: usize,
    /// Branch assignments (neuron -> branch index) whose LP was
    /// infeasible; only produced by [`TighteningMode::BackwardPmnr`].
    pub infeasible_branches: Vec<AHashMap<NeuronRef, usize>>,
}

/// State shared between the orchestrator and the worker tasks.
struct Shared<'a> {
    graph: Mutex<&'a mut LayerGraph>,
    listener: &'a dyn TighteningListener,
    options: &'a TightenerOptions,
    infeasible: AtomicBool,
    interrupt: AtomicBool,
    tighter_bounds: AtomicUsize,
    sign_changes: AtomicUsize,
    cutoffs: AtomicUsize,
    failure: Mutex<Option<LpError>>,
}

impl<'a> Shared<'a> {
    fn new(
        graph: &'a mut LayerGraph,
        listener: &'a dyn TighteningListener,
        options: &'a TightenerOptions,
    ) -> Self {
        Self {
            graph: Mutex::new(graph),
            listener,
            options,
            infeasible: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            tighter_bounds: AtomicUsize::new(0),
            sign_changes: AtomicUsize::new(0),
            cutoffs: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    fn record_failure(&self, error: LpError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
        self.interrupt.store(true, Ordering::Relaxed);
    }
}

/// Which relaxation the current sweep builds per target layer.
#[derive(Debug, Clone, Copy)]
enum Horizon {
    Forward(usize),
    Backward(usize),
}

/// Resolve one LP bound query against the solver's status, exactly in this
/// order: infeasible (flag and +inf, or a hard error), cutoff, optimal,
/// timeout; anything else is fatal.
pub fn optimize<S: LpOracle + ?Sized>(
    solver: &mut S,
    objective: Objective,
    variable: &str,
    cutoff_value: f64,
    infeasible: Option<&AtomicBool>,
    time_limit: Option<f64>,
) -> Result<f64> {
    let terms = [Term::new(1.0, variable)];
    match objective {
        Objective::Maximize => solver.set_objective(&terms),
        Objective::Minimize => solver.set_cost(&terms),
    }
    solver.set_time_limit(time_limit.unwrap_or(f64::INFINITY));
    solver.solve()?;

    if solver.infeasible() {
        if let Some(flag) = infeasible {
            flag.store(true, Ordering::Relaxed);
            return Ok(f64::INFINITY);
        }
        return Err(LpError::InfeasibleQuery);
    }
    if solver.cutoff_occurred() {
        return Ok(cutoff_value);
    }
    if solver.optimal() {
        let mut assignment = AHashMap::new();
        return Ok(solver.extract_solution(&mut assignment));
    }
    if solver.timed_out() {
        return Ok(solver.objective_bound());
    }
    Err(LpError::UnexpectedSolverStatus)
}

/// Tighten bounds across the whole graph under the configured policy.
pub fn tighten_bounds<S: LpOracle + 'static>(
    graph: &mut LayerGraph,
    listener: &dyn TighteningListener,
    polygonal: &[PolygonalTightening],
    options: &TightenerOptions,
    make_solver: impl Fn() -> S,
) -> Result<TighteningStats> {
    let indices: Vec<usize> = graph.layers().map(|(index, _)| index).collect();
    let Some(&last_layer) = indices.last() else {
        return Ok(TighteningStats::default());
    };
    let workers = options.workers.max(1);
    let shared = Shared::new(graph, listener, options);
    let (tx, rx) = bounded::<S>(workers);
    for _ in 0..workers {
        let _ = tx.send(make_solver());
    }

    let infeasible_branches = std::thread::scope(|scope| -> Result<Vec<AHashMap<NeuronRef, usize>>> {
        match options.mode {
            TighteningMode::Forward => {
                for &layer_index in &indices {
                    sweep_layer(
                        scope,
                        &shared,
                        &tx,
                        &rx,
                        polygonal,
                        layer_index,
                        Horizon::Forward(layer_index),
                        workers,
                    )?;
                    // Later layers' relaxations must see this layer's
                    // tightenings.
                    barrier(&shared, &tx, &rx, workers)?;
                }
                Ok(Vec::new())
            }
            TighteningMode::BackwardConverge => {
                backward_converge(scope, &shared, &tx, &rx, polygonal, &indices, workers)?;
                Ok(Vec::new())
            }
            TighteningMode::BackwardPmnr => {
                backward_converge(scope, &shared, &tx, &rx, polygonal, &indices, workers)?;
                pmnr_output_pass(&shared, &tx, &rx, polygonal, last_layer)
            }
        }
    })?;

    info!(
        tighter_bounds = shared.tighter_bounds.load(Ordering::Relaxed),
        sign_changes = shared.sign_changes.load(Ordering::Relaxed),
        cutoffs = shared.cutoffs.load(Ordering::Relaxed),
        "LP bound tightening done"
    );
    Ok(TighteningStats {
        tighter_bounds: shared.tighter_bounds.load(Ordering::Relaxed),
        sign_changes: shared.sign_changes.load(Ordering::Relaxed),
        cutoffs: shared.cutoffs.load(Ordering::Relaxed),
        infeasible_branches,
    })
}

/// Tighten all neurons of one layer under the full-graph relaxation.
pub fn tighten_single_layer<S: LpOracle + 'static>(
    graph: &mut LayerGraph,
    listener: &dyn TighteningListener,
    polygonal: &[PolygonalTightening],
    options: &TightenerOptions,
    make_solver: impl Fn() -> S,
    target_layer: usize,
) -> Result<TighteningStats> {
    let Some(last_layer) = graph.last_layer_index() else {
        return Ok(TighteningStats::default());
    };
    let workers = options.workers.max(1);
    let shared = Shared::new(graph, listener, options);
    let (tx, rx) = bounded::<S>(workers);
    for _ in 0..workers {
        let _ = tx.send(make_solver());
    }
    std::thread::scope(|scope| -> Result<()> {
        sweep_layer(
            scope,
            &shared,
            &tx,
            &rx,
            polygonal,
            target_layer,
            Horizon::Forward(last_layer),
            workers,
        )?;
        barrier(&shared, &tx, &rx, workers)
    })?;
    Ok(TighteningStats {
        tighter_bounds: shared.tighter_bounds.load(Ordering::Relaxed),
        sign_changes: shared.sign_changes.load(Ordering::Relaxed),
        cutoffs: shared.cutoffs.load(Ordering::Relaxed),
        infeasible_branches: Vec::new(),
    })
}

fn backward_converge<'scope, 'env, 'g, S: LpOracle + 'static>(
    scope: &'scope std::thread::Scope<'scope, 'env>,
    shared: &'env Shared<'g>,
    tx: &Sender<S>,
    rx: &Receiver<S>,
    polygonal: &[PolygonalTightening],
    indices: &[usize],
    workers: usize,
) -> Result<()> {
    for &layer_index in indices.iter().rev() {
        loop {
            let before = shared.tighter_bounds.load(Ordering::Relaxed);
            sweep_layer(
                scope,
                shared,
                tx,
                rx,
                polygonal,
                layer_index,
                Horizon::Backward(layer_index),
                workers,
            )?;
            barrier(shared, tx, rx, workers)?;
            if shared.tighter_bounds.load(Ordering::Relaxed) == before {
                break;
            }
            debug!(layer = layer_index, "bounds improved, repeating layer");
        }
    }
    Ok(())
}

/// Dispatch one tightening task per live neuron of `layer_index`.
#[allow(clippy::too_many_arguments)]
fn sweep_layer<'scope, 'env, 'g, S: LpOracle + 'static>(
    scope: &'scope std::thread::Scope<'scope, 'env>,
    shared: &'env Shared<'g>,
    tx: &Sender<S>,
    rx: &Receiver<S>,
    polygonal: &[PolygonalTightening],
    layer_index: usize,
    horizon: Horizon,
    workers: usize,
) -> Result<()> {
    debug!(layer = layer_index, "tightening bounds for layer");
    let (size, simulations) = {
        let graph = shared.graph.lock();
        let layer = graph.layer(layer_index)?;
        (layer.size(), layer.simulations().cloned())
    };

    for neuron in 0..size {
        let state = {
            let graph = shared.graph.lock();
            let layer = graph.layer(layer_index)?;
            if layer.neuron_eliminated(neuron) {
                None
            } else {
                Some((
                    layer.lb(neuron),
                    layer.ub(neuron),
                    layer.neuron_to_variable(neuron)?,
                ))
            }
        };
        let Some((current_lb, current_ub, variable)) = state else {
            continue;
        };

        if let Some(cutoff) = shared.options.cutoff {
            if current_lb >= cutoff || current_ub <= cutoff {
                continue;
            }
        }

        // Simulation samples are soundness-preserving hints: when every
        // sample clears the cutoff on one side, the matching bound query
        // is skipped.
        let mut skip_lb = false;
        let mut skip_ub = false;
        if let (Some(cutoff), Some(rows)) = (shared.options.cutoff, simulations.as_ref()) {
            let row = &rows[neuron];
            if !row.is_empty() {
                skip_lb = row.iter().all(|&sample| sample > cutoff);
                skip_ub = row.iter().all(|&sample| sample < cutoff);
            }
        }
        if skip_lb && skip_ub {
            debug!(
                layer = layer_index,
                neuron, "simulation hints resolve both bounds, skipping"
            );
            continue;
        }

        if shared.infeasible.load(Ordering::Relaxed) {
            shared.interrupt.store(true, Ordering::Relaxed);
            return Err(LpError::InfeasibleQuery);
        }

        let mut solver = acquire_solver(shared, rx);
        solver.reset_model();
        let built = {
            let graph = shared.graph.lock();
            let builder = RelaxationBuilder::new(&**graph, &shared.options.relaxation);
            match horizon {
                Horizon::Forward(last) => builder.build_forward(&mut solver, last, polygonal),
                Horizon::Backward(first) => builder.build_backward(&mut solver, first, polygonal),
            }
        };
        if let Err(error) = built {
            let _ = tx.send(solver);
            return Err(error);
        }

        if workers == 1 {
            tighten_neuron_task(
                solver, shared, tx.clone(), layer_index, neuron, variable, current_lb, current_ub,
                skip_lb, skip_ub,
            );
            check_failure(shared)?;
        } else {
            let tx = tx.clone();
            scope.spawn(move || {
                tighten_neuron_task(
                    solver, shared, tx, layer_index, neuron, variable, current_lb, current_ub,
                    skip_lb, skip_ub,
                );
            });
        }
    }
    Ok(())
}

/// One worker task: maximize then minimize a single variable, applying
/// strictly tighter results. The solver always returns to the free queue.
#[allow(clippy::too_many_arguments)]
fn tighten_neuron_task<S: LpOracle>(
    mut solver: S,
    shared: &Shared<'_>,
    tx: Sender<S>,
    layer_index: usize,
    neuron: usize,
    variable: usize,
    current_lb: f64,
    current_ub: f64,
    skip_lb: bool,
    skip_ub: bool,
) {
    let result = run_neuron_queries(
        &mut solver,
        shared,
        layer_index,
        neuron,
        variable,
        current_lb,
        current_ub,
        skip_lb,
        skip_ub,
    );
    if let Err(error) = result {
        shared.record_failure(error);
    }
    let _ = tx.send(solver);
}

#[allow(clippy::too_many_arguments)]
fn run_neuron_queries<S: LpOracle>(
    solver: &mut S,
    shared: &Shared<'_>,
    layer_index: usize,
    neuron: usize,
    variable: usize,
    current_lb: f64,
    current_ub: f64,
    skip_lb: bool,
    skip_ub: bool,
) -> Result<()> {
    if shared.interrupt.load(Ordering::Relaxed) {
        return Ok(());
    }
    let name = variable_name(variable);
    let cutoff_value = shared.options.cutoff.unwrap_or(0.0);
    let slack = shared.options.lp_rounding_slack;

    if !skip_ub {
        debug!(layer = layer_index, neuron, "computing upper bound");
        let value = optimize(
            solver,
            Objective::Maximize,
            &name,
            cutoff_value,
            Some(&shared.infeasible),
            shared.options.time_limit,
        )? + slack;
        if shared.infeasible.load(Ordering::Relaxed) {
            return Ok(());
        }
        if value < current_ub {
            if tolerance::is_positive(current_ub) && !tolerance::is_positive(value) {
                shared.sign_changes.fetch_add(1, Ordering::Relaxed);
            }
            {
                let mut graph = shared.graph.lock();
                match graph.layer_mut(layer_index)?.set_ub(neuron, value) {
                    Ok(true) => shared
                        .listener
                        .receive_tighter_bound(Tightening::upper(variable, value)),
                    Ok(false) => {}
                    Err(error) if error.is_infeasible() => {
                        shared.infeasible.store(true, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            shared.tighter_bounds.fetch_add(1, Ordering::Relaxed);
            if shared.options.cutoff.map(|c| value < c).unwrap_or(false) {
                shared.cutoffs.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    if !skip_lb {
        if shared.interrupt.load(Ordering::Relaxed) {
            return Ok(());
        }
        debug!(layer = layer_index, neuron, "computing lower bound");
        solver.reset();
        let value = optimize(
            solver,
            Objective::Minimize,
            &name,
            cutoff_value,
            Some(&shared.infeasible),
            shared.options.time_limit,
        )? - slack;
        if shared.infeasible.load(Ordering::Relaxed) {
            return Ok(());
        }
        if value > current_lb {
            if tolerance::is_negative(current_lb) && !tolerance::is_negative(value) {
                shared.sign_changes.fetch_add(1, Ordering::Relaxed);
            }
            {
                let mut graph = shared.graph.lock();
                match graph.layer_mut(layer_index)?.set_lb(neuron, value) {
                    Ok(true) => shared
                        .listener
                        .receive_tighter_bound(Tightening::lower(variable, value)),
                    Ok(false) => {}
                    Err(error) if error.is_infeasible() => {
                        shared.infeasible.store(true, Ordering::Relaxed);
                        return Ok(());
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            shared.tighter_bounds.fetch_add(1, Ordering::Relaxed);
            if shared.options.cutoff.map(|c| value > c).unwrap_or(false) {
                shared.cutoffs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    Ok(())
}

/// Block until a free solver is available, sleeping cooperatively.
fn acquire_solver<S: LpOracle>(shared: &Shared<'_>, rx: &Receiver<S>) -> S {
    let wait = Duration::from_millis(shared.options.workers.saturating_sub(1).max(1) as u64);
    loop {
        match rx.try_recv() {
            Ok(solver) => return solver,
            Err(_) => std::thread::sleep(wait),
        }
    }
}

/// Wait for every in-flight task by collecting all solvers, then surface
/// any captured failure or infeasibility.
fn barrier<S: LpOracle>(
    shared: &Shared<'_>,
    tx: &Sender<S>,
    rx: &Receiver<S>,
    workers: usize,
) -> Result<()> {
    let mut held = Vec::with_capacity(workers);
    for _ in 0..workers {
        held.push(acquire_solver(shared, rx));
    }
    for solver in held {
        let _ = tx.send(solver);
    }
    check_failure(shared)
}

fn check_failure(shared: &Shared<'_>) -> Result<()> {
    if let Some(error) = shared.failure.lock().take() {
        return Err(error);
    }
    if shared.infeasible.load(Ordering::Relaxed) {
        shared.interrupt.store(true, Ordering::Relaxed);
        return Err(LpError::InfeasibleQuery);
    }
    Ok(())
}

/// Phase-split description of one branched neuron.
#[derive(Debug, Clone, Copy)]
struct BranchNeuron {
    layer: usize,
    neuron: usize,
    source: NeuronRef,
    kind: LayerKind,
    alpha: f64,
}

/// The backward-PMNR output pass: branch over the unfixed piecewise-linear
/// neurons of the last activation layer, bound every output neuron per
/// branch under the full-prefix relaxation, apply the branch hull, and
/// report infeasible branches.
fn pmnr_output_pass<S: LpOracle>(
    shared: &Shared<'_>,
    tx: &Sender<S>,
    rx: &Receiver<S>,
    polygonal: &[PolygonalTightening],
    last_layer: usize,
) -> Result<Vec<AHashMap<NeuronRef, usize>>> {
    let (branch_neurons, outputs) = {
        let graph = shared.graph.lock();
        let mut branch_layer = None;
        for (index, layer) in graph.layers() {
            if layer.kind().is_piecewise_linear() {
                branch_layer = Some(index.max(branch_layer.unwrap_or(index)));
            }
        }
        let Some(branch_layer) = branch_layer else {
            return Ok(Vec::new());
        };

        let layer = graph.layer(branch_layer)?;
        let mut branch_neurons = Vec::new();
        for neuron in 0..layer.size() {
            if layer.neuron_eliminated(neuron) {
                continue;
            }
            let source = layer.first_activation_source(neuron)?;
            let (lb, ub) = graph.source_interval(source)?;
            if tolerance::is_negative(lb) && tolerance::is_positive(ub) {
                branch_neurons.push(BranchNeuron {
                    layer: branch_layer,
                    neuron,
                    source,
                    kind: layer.kind(),
                    alpha: layer.alpha(),
                });
            }
        }
        if branch_neurons.len() > PMNR_MAX_BRANCHED_NEURONS {
            debug!(
                selected = PMNR_MAX_BRANCHED_NEURONS,
                candidates = branch_neurons.len(),
                "capping branched neurons"
            );
            branch_neurons.truncate(PMNR_MAX_BRANCHED_NEURONS);
        }

        let output = graph.layer(last_layer)?;
        let mut outputs = Vec::new();
        for neuron in 0..output.size() {
            if output.neuron_eliminated(neuron) {
                continue;
            }
            outputs.push((neuron, output.neuron_to_variable(neuron)?));
        }
        (branch_neurons, outputs)
    };

    if branch_neurons.is_empty() || outputs.is_empty() {
        return Ok(Vec::new());
    }

    let branch_count = 1usize << branch_neurons.len();
    let cutoff_value = shared.options.cutoff.unwrap_or(0.0);
    let mut hull: Vec<(f64, f64)> = vec![(f64::INFINITY, f64::NEG_INFINITY); outputs.len()];
    let mut infeasible_branches = Vec::new();
    let mut any_feasible = false;

    let mut solver = acquire_solver(shared, rx);
    for branch in 0..branch_count {
        solver.reset_model();
        let mut constraints = polygonal.to_vec();
        constraints.extend(branch_constraints(&branch_neurons, branch));
        let built = {
            let graph = shared.graph.lock();
            let builder = RelaxationBuilder::new(&**graph, &shared.options.relaxation);
            builder.build_forward(&mut solver, last_layer, &constraints)
        };
        if let Err(error) = built {
            let _ = tx.send(solver);
            return Err(error);
        }

        let branch_flag = AtomicBool::new(false);
        let mut branch_infeasible = false;
        for (slot, &(_, variable)) in outputs.iter().enumerate() {
            let name = variable_name(variable);
            solver.reset();
            let max = match optimize(
                &mut solver,
                Objective::Maximize,
                &name,
                cutoff_value,
                Some(&branch_flag),
                shared.options.time_limit,
            ) {
                Ok(value) => value,
                Err(error) => {
                    let _ = tx.send(solver);
                    return Err(error);
                }
            };
            if branch_flag.load(Ordering::Relaxed) {
                branch_infeasible = true;
                break;
            }
            solver.reset();
            let min = match optimize(
                &mut solver,
                Objective::Minimize,
                &name,
                cutoff_value,
                Some(&branch_flag),
                shared.options.time_limit,
            ) {
                Ok(value) => value,
                Err(error) => {
                    let _ = tx.send(solver);
                    return Err(error);
                }
            };
            if branch_flag.load(Ordering::Relaxed) {
                branch_infeasible = true;
                break;
            }
            hull[slot].0 = hull[slot].0.min(min);
            hull[slot].1 = hull[slot].1.max(max);
        }

        if branch_infeasible {
            let mut assignment = AHashMap::new();
            for (position, branched) in branch_neurons.iter().enumerate() {
                assignment.insert(
                    NeuronRef::new(branched.layer, branched.neuron),
                    (branch >> position) & 1,
                );
            }
            infeasible_branches.push(assignment);
        } else {
            any_feasible = true;
        }
    }
    let _ = tx.send(solver);

    if !any_feasible {
        return Err(LpError::InfeasibleQuery);
    }

    // Apply the branch hull to the output layer.
    let slack = shared.options.lp_rounding_slack;
    let mut graph = shared.graph.lock();
    for (slot, &(neuron, variable)) in outputs.iter().enumerate() {
        let (hull_lb, hull_ub) = hull[slot];
        let layer = graph.layer_mut(last_layer)?;
        let value = hull_ub + slack;
        if value < layer.ub(neuron) {
            if tolerance::is_positive(layer.ub(neuron)) && !tolerance::is_positive(value) {
                shared.sign_changes.fetch_add(1, Ordering::Relaxed);
            }
            if layer.set_ub(neuron, value)? {
                shared
                    .listener
                    .receive_tighter_bound(Tightening::upper(variable, value));
                shared.tighter_bounds.fetch_add(1, Ordering::Relaxed);
            }
        }
        let layer = graph.layer_mut(last_layer)?;
        let value = hull_lb - slack;
        if value > layer.lb(neuron) {
            if tolerance::is_negative(layer.lb(neuron)) && !tolerance::is_negative(value) {
                shared.sign_changes.fetch_add(1, Ordering::Relaxed);
            }
            if layer.set_lb(neuron, value)? {
                shared
                    .listener
                    .receive_tighter_bound(Tightening::lower(variable, value));
                shared.tighter_bounds.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    Ok(infeasible_branches)
}

/// Phase constraints of one branch, encoded as polygonal tightenings over
/// the branched neurons and their sources.
fn branch_constraints(branch_neurons: &[BranchNeuron], branch: usize) -> Vec<PolygonalTightening> {
    let mut constraints = Vec::new();
    for (position, branched) in branch_neurons.iter().enumerate() {
        let phase = (branch >> position) & 1;
        let output = NeuronRef::new(branched.layer, branched.neuron);
        let source = branched.source;
        let (source_sign, output_terms, output_value) = match (branched.kind, phase) {
            // Phase 0 constrains the source nonnegative, phase 1
            // nonpositive; the output is pinned to the matching linear
            // piece.
            (LayerKind::Relu, 0) => (1.0, vec![(output, 1.0), (source, -1.0)], 0.0),
            (LayerKind::Relu, _) => (-1.0, vec![(output, 1.0)], 0.0),
            (LayerKind::LeakyRelu, 0) => (1.0, vec![(output, 1.0), (source, -1.0)], 0.0),
            (LayerKind::LeakyRelu, _) => {
                (-1.0, vec![(output, 1.0), (source, -branched.alpha)], 0.0)
            }
            (LayerKind::AbsoluteValue, 0) => (1.0, vec![(output, 1.0), (source, -1.0)], 0.0),
            (LayerKind::AbsoluteValue, _) => (-1.0, vec![(output, 1.0), (source, 1.0)], 0.0),
            (LayerKind::Sign, 0) => (1.0, vec![(output, 1.0)], 1.0),
            (LayerKind::Sign, _) => (-1.0, vec![(output, 1.0)], -1.0),
            _ => continue,
        };
        // Source half-space.
        if source_sign > 0.0 {
            constraints.push(PolygonalTightening::lower(vec![(source, 1.0)], 0.0));
        } else {
            constraints.push(PolygonalTightening::upper(vec![(source, 1.0)], 0.0));
        }
        // Output equality as a pair of one-sided constraints.
        constraints.push(PolygonalTightening::lower(
            output_terms.clone(),
            output_value,
        ));
        constraints.push(PolygonalTightening::upper(output_terms, output_value));
    }
    constraints
}

/// Sequential single-solver variant: encode the graph incrementally, layer
/// by layer, and tighten each layer's neurons as soon as it is encoded.
pub fn tighten_incremental<S: LpOracle>(
    graph: &mut LayerGraph,
    listener: &dyn TighteningListener,
    options: &TightenerOptions,
    solver: &mut S,
) -> Result<TighteningStats> {
    let mut stats = TighteningStats::default();
    let cutoff_value = options.cutoff.unwrap_or(0.0);
    let indices: Vec<usize> = graph.layers().map(|(index, _)| index).collect();

    for index in indices {
        {
            let builder = RelaxationBuilder::new(&*graph, &options.relaxation);
            let layer = graph.layer(index)?;
            builder.add_layer(solver, layer, false)?;
        }
        let size = graph.layer(index)?.size();
        for neuron in 0..size {
            let layer = graph.layer(index)?;
            if layer.neuron_eliminated(neuron) {
                continue;
            }
            let current_lb = layer.lb(neuron);
            let current_ub = layer.ub(neuron);
            if let Some(cutoff) = options.cutoff {
                if current_lb >= cutoff || current_ub <= cutoff {
                    continue;
                }
            }
            let variable = layer.neuron_to_variable(neuron)?;
            let name = variable_name(variable);

            solver.reset();
            let ub = optimize(
                solver,
                Objective::Maximize,
                &name,
                cutoff_value,
                None,
                options.time_limit,
            )?;
            if ub < current_ub {
                solver.set_upper_bound(&name, ub);
                if tolerance::is_positive(current_ub) && !tolerance::is_positive(ub) {
                    stats.sign_changes += 1;
                }
                graph.layer_mut(index)?.set_ub(neuron, ub)?;
                listener.receive_tighter_bound(Tightening::upper(variable, ub));
                stats.tighter_bounds += 1;
                if options.cutoff.map(|c| ub < c).unwrap_or(false) {
                    stats.cutoffs += 1;
                    continue;
                }
            }

            solver.reset();
            let lb = optimize(
                solver,
                Objective::Minimize,
                &name,
                cutoff_value,
                None,
                options.time_limit,
            )?;
            if lb > current_lb {
                solver.set_lower_bound(&name, lb);
                if tolerance::is_negative(current_lb) && !tolerance::is_negative(lb) {
                    stats.sign_changes += 1;
                }
                graph.layer_mut(index)?.set_lb(neuron, lb)?;
                listener.receive_tighter_bound(Tightening::lower(variable, lb));
                stats.tighter_bounds += 1;
                if options.cutoff.map(|c| lb > c).unwrap_or(false) {
                    stats.cutoffs += 1;
                }
            }
        }
    }

    info!(
        tighter_bounds = stats.tighter_bounds,
        sign_changes = stats.sign_changes,
        cutoffs = stats.cutoffs,
        "incremental LP bound tightening done"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minilp_oracle::MinilpOracle;
    use veribound_graph::CollectingListener;

    /// x in [-1, 1] -> a = 2x + 1 -> r = relu(a) with deliberately loose
    /// seed bounds on the relu output.
    fn relu_graph() -> LayerGraph {
        let mut graph = LayerGraph::new();
        graph.add_layer(0, LayerKind::Input, 1).unwrap();
        graph.add_layer(1, LayerKind::WeightedSum, 1).unwrap();
        graph.add_layer(2, LayerKind::Relu, 1).unwrap();
        graph.add_dependency(0, 1).unwrap();
        graph.add_dependency(1, 2).unwrap();
        graph.set_weight(0, 0, 1, 0, 2.0).unwrap();
        graph.set_bias(1, 0, 1.0).unwrap();
        graph.add_activation_source(1, 0, 2, 0).unwrap();
        graph.set_neuron_variable(NeuronRef::new(0, 0), 0).unwrap();
        graph.set_neuron_variable(NeuronRef::new(1, 0), 1).unwrap();
        graph.set_neuron_variable(NeuronRef::new(2, 0), 2).unwrap();
        graph
            .layer_mut(0)
            .unwrap()
            .overwrite_bounds(0, -1.0, 1.0)
            .unwrap();
        graph
            .layer_mut(1)
            .unwrap()
            .overwrite_bounds(0, -5.0, 5.0)
            .unwrap();
        graph
            .layer_mut(2)
            .unwrap()
            .overwrite_bounds(0, -5.0, 5.0)
            .unwrap();
        graph
    }

    fn options(mode: TighteningMode, workers: usize) -> TightenerOptions {
        TightenerOptions {
            workers,
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn forward_sweep_tightens_the_chain() {
        let mut graph = relu_graph();
        let listener = CollectingListener::new();
        let stats = tighten_bounds(
            &mut graph,
            &listener,
            &[],
            &options(TighteningMode::Forward, 1),
            MinilpOracle::new,
        )
        .unwrap();
        // a = 2x + 1 in [-1, 3]; relu in [0, 3].
        let a = graph.layer(1).unwrap();
        assert!((a.lb(0) + 1.0).abs() < 1e-4);
        assert!((a.ub(0) - 3.0).abs() < 1e-4);
        let r = graph.layer(2).unwrap();
        assert!(r.lb(0).abs() < 1e-4);
        assert!((r.ub(0) - 3.0).abs() < 1e-4);
        assert!(stats.tighter_bounds >= 4);
        assert!(!listener.is_empty());
    }

    #[test]
    fn parallel_sweep_matches_sequential() {
        let mut sequential = relu_graph();
        tighten_bounds(
            &mut sequential,
            &veribound_graph::types::NullListener,
            &[],
            &options(TighteningMode::Forward, 1),
            MinilpOracle::new,
        )
        .unwrap();

        let mut parallel = relu_graph();
        tighten_bounds(
            &mut parallel,
            &veribound_graph::types::NullListener,
            &[],
            &options(TighteningMode::Forward, 4),
            MinilpOracle::new,
        )
        .unwrap();

        for index in [1, 2] {
            let a = sequential.layer(index).unwrap();
            let b = parallel.layer(index).unwrap();
            assert!((a.lb(0) - b.lb(0)).abs() < 1e-6);
            assert!((a.ub(0) - b.ub(0)).abs() < 1e-6);
        }
    }

    #[test]
    fn backward_converge_repeats_until_stable() {
        let mut graph = relu_graph();
        let listener = CollectingListener::new();
        tighten_bounds(
            &mut graph,
            &listener,
            &[],
            &options(TighteningMode::BackwardConverge, 1),
            MinilpOracle::new,
        )
        .unwrap();
        // The backward ball around the relu pins y >= 0; the weighted sum
        // tightens against the input box.
        let r = graph.layer(2).unwrap();
        assert!(r.lb(0).abs() < 1e-4);
        let a = graph.layer(1).unwrap();
        assert!((a.lb(0) + 1.0).abs() < 1e-4);
        assert!((a.ub(0) - 3.0).abs() < 1e-4);
    }

    #[test]
    fn infeasible_polygonal_cut_reports_infeasibility() {
        let mut graph = relu_graph();
        let listener = CollectingListener::new();
        // x >= 2 contradicts the input box.
        let cut = PolygonalTightening::lower(vec![(NeuronRef::new(0, 0), 1.0)], 2.0);
        let error = tighten_bounds(
            &mut graph,
            &listener,
            &[cut],
            &options(TighteningMode::Forward, 1),
            MinilpOracle::new,
        )
        .unwrap_err();
        assert!(error.is_infeasible());
    }

    #[test]
    fn cutoff_skips_resolved_neurons() {
        let mut graph = relu_graph();
        // The relu output already resolves against a cutoff of -1.
        let listener = CollectingListener::new();
        let mut opts = options(TighteningMode::Forward, 1);
        opts.cutoff = Some(-10.0);
        let stats = tighten_bounds(&mut graph, &listener, &[], &opts, MinilpOracle::new).unwrap();
        // Every neuron's lower bound is already above the cutoff.
        assert_eq!(stats.tighter_bounds, 0);
    }

    #[test]
    fn simulation_hints_skip_bound_queries() {
        let mut graph = relu_graph();
        // All samples of the relu output sit above the cutoff: the lower
        // query is skipped, the upper one still runs.
        graph
            .layer_mut(2)
            .unwrap()
            .set_simulations(vec![vec![1.0, 2.0, 2.5]])
            .unwrap();
        let listener = CollectingListener::new();
        let mut opts = options(TighteningMode::Forward, 1);
        opts.cutoff = Some(0.5);
        tighten_bounds(&mut graph, &listener, &[], &opts, MinilpOracle::new).unwrap();
        let received = listener.drain();
        assert!(received
            .iter()
            .all(|t| !(t.variable == 2 && t.kind == veribound_graph::BoundKind::Lower)));
        assert!(received
            .iter()
            .any(|t| t.variable == 2 && t.kind == veribound_graph::BoundKind::Upper));
    }

    #[test]
    fn pmnr_branches_the_relu_phase() {
        let mut graph = relu_graph();
        let listener = CollectingListener::new();
        let stats = tighten_bounds(
            &mut graph,
            &listener,
            &[],
            &options(TighteningMode::BackwardPmnr, 1),
            MinilpOracle::new,
        )
        .unwrap();
        assert!(stats.infeasible_branches.is_empty());
        let r = graph.layer(2).unwrap();
        assert!(r.lb(0).abs() < 1e-4);
        assert!((r.ub(0) - 3.0).abs() < 1e-4);
    }

    #[test]
    fn incremental_variant_matches_the_pool() {
        let mut pooled = relu_graph();
        tighten_bounds(
            &mut pooled,
            &veribound_graph::types::NullListener,
            &[],
            &options(TighteningMode::Forward, 1),
            MinilpOracle::new,
        )
        .unwrap();

        let mut incremental = relu_graph();
        let mut solver = MinilpOracle::new();
        tighten_incremental(
            &mut incremental,
            &veribound_graph::types::NullListener,
            &options(TighteningMode::Forward, 1),
            &mut solver,
        )
        .unwrap();

        for index in [1, 2] {
            let a = pooled.layer(index).unwrap();
            let b = incremental.layer(index).unwrap();
            assert!((a.lb(0) - b.lb(0)).abs() < 1e-4);
            assert!((a.ub(0) - b.ub(0)).abs() < 1e-4);
        }
    }

    #[test]
    fn single_layer_entry_point_only_touches_its_target() {
        let mut graph = relu_graph();
        let listener = CollectingListener::new();
        tighten_single_layer(
            &mut graph,
            &listener,
            &[],
            &options(TighteningMode::Forward, 1),
            MinilpOracle::new,
            2,
        )
        .unwrap();
        let received = listener.drain();
        assert!(!received.is_empty());
        assert!(received.iter().all(|t| t.variable == 2));
        // The untargeted weighted sum keeps its loose seed bounds.
        let a = graph.layer(1).unwrap();
        assert_eq!(a.lb(0), -5.0);
        assert_eq!(a.ub(0), 5.0);
    }
}
