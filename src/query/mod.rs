//! The canonical feasibility problem: variables, per-variable bounds, linear
//! equations, non-linear constraints, designated input and output variables,
//! and the solution assignment produced by the solver.

pub mod lift;
pub mod serialize;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::constraints::{PiecewiseConstraint, ReluConstraint};
use crate::errors::{VfError, VfResult};
use crate::nlr::reasoner::{NetworkReasoner, PropagationOutcome};
use crate::sparse::SparseRow;
use crate::types::{BoundKind, Tightening, Variable};

/// Equation comparison operators. The integer tags are part of the wire
/// format; changing them is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquationKind {
    Equality,
    GreaterEq,
    LessEq,
}

impl EquationKind {
    pub fn tag(self) -> i64 {
        match self {
            EquationKind::Equality => 0,
            EquationKind::GreaterEq => 1,
            EquationKind::LessEq => 2,
        }
    }

    pub fn from_tag(tag: i64) -> VfResult<Self> {
        Ok(match tag {
            0 => EquationKind::Equality,
            1 => EquationKind::GreaterEq,
            2 => EquationKind::LessEq,
            other => return Err(VfError::InvalidEquationType(other)),
        })
    }
}

/// A linear expression `sum(coefficient * variable) op scalar`. Addends with
/// the same variable merge on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Equation {
    kind: EquationKind,
    scalar: f64,
    addends: SparseRow<f64>,
    /// Insertion order of the addend variables, kept for serialization.
    order: Vec<Variable>,
}

impl Equation {
    pub fn new(kind: EquationKind) -> Self {
        Self {
            kind,
            scalar: 0.0,
            addends: SparseRow::new(0),
            order: Vec::new(),
        }
    }

    pub fn kind(&self) -> EquationKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: EquationKind) {
        self.kind = kind;
    }

    pub fn scalar(&self) -> f64 {
        self.scalar
    }

    pub fn set_scalar(&mut self, scalar: f64) {
        self.scalar = scalar;
    }

    pub fn add_addend(&mut self, coefficient: f64, variable: Variable) {
        if !self.order.contains(&variable) {
            self.order.push(variable);
        }
        if variable >= self.addends.size() {
            while self.addends.size() <= variable {
                self.addends.increment_size();
            }
        }
        self.addends.add(variable, coefficient);
    }

    pub fn coefficient(&self, variable: Variable) -> f64 {
        self.addends.get(variable)
    }

    pub fn num_addends(&self) -> usize {
        self.addends.nnz()
    }

    /// Addends in insertion order; merged-away (zero) entries are skipped.
    pub fn addends(&self) -> Vec<(Variable, f64)> {
        self.order
            .iter()
            .filter_map(|&v| {
                let c = self.addends.get(v);
                (c != 0.0).then_some((v, c))
            })
            .collect()
    }

    pub fn participating_variables(&self) -> Vec<Variable> {
        let mut vars: Vec<Variable> = self.addends.iter().map(|e| e.index).collect();
        vars.sort_unstable();
        vars
    }

    /// Renames `old` to `new`, uniting addends that collide.
    pub fn update_variable_index(&mut self, old: Variable, new: Variable) {
        if new >= self.addends.size() {
            while self.addends.size() <= new {
                self.addends.increment_size();
            }
        }
        self.addends.merge_entries(old, new);
        if let Some(pos) = self.order.iter().position(|&v| v == old) {
            if self.order.contains(&new) {
                self.order.remove(pos);
            } else {
                self.order[pos] = new;
            }
        }
    }
}

impl PartialEq for Equation {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.scalar == other.scalar && self.addends == other.addends
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (variable, coefficient)) in self.addends().into_iter().enumerate() {
            if i > 0 {
                write!(f, " + ")?;
            }
            write!(f, "{coefficient}*x{variable}")?;
        }
        let op = match self.kind {
            EquationKind::Equality => "=",
            EquationKind::GreaterEq => ">=",
            EquationKind::LessEq => "<=",
        };
        write!(f, " {op} {}", self.scalar)
    }
}

/// A linear functional `sum(coefficient * variable) + constant`, accumulated
/// by the constraints' SoI cost contributions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearExpression {
    pub coefficients: BTreeMap<Variable, f64>,
    pub constant: f64,
}

impl LinearExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_term(&mut self, coefficient: f64, variable: Variable) {
        let merged = self.coefficients.entry(variable).or_insert(0.0);
        *merged += coefficient;
        if *merged == 0.0 {
            self.coefficients.remove(&variable);
        }
    }

    pub fn evaluate(&self, assignment: &BTreeMap<Variable, f64>) -> f64 {
        self.constant
            + self
                .coefficients
                .iter()
                .map(|(v, c)| c * assignment.get(v).copied().unwrap_or(0.0))
                .sum::<f64>()
    }
}

/// Per-variable bound pairs. Unset lower defaults to -inf, unset upper to
/// +inf. Tightenings are accepted only when strictly tighter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundStore {
    num_variables: usize,
    lower: BTreeMap<Variable, f64>,
    upper: BTreeMap<Variable, f64>,
}

impl BoundStore {
    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    pub fn set_num_variables(&mut self, n: usize) {
        self.num_variables = n;
    }

    pub fn new_variable(&mut self) -> Variable {
        let v = self.num_variables;
        self.num_variables += 1;
        v
    }

    pub fn lower(&self, variable: Variable) -> f64 {
        self.lower
            .get(&variable)
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }

    pub fn upper(&self, variable: Variable) -> f64 {
        self.upper.get(&variable).copied().unwrap_or(f64::INFINITY)
    }

    pub fn has_lower(&self, variable: Variable) -> bool {
        self.lower.contains_key(&variable)
    }

    pub fn has_upper(&self, variable: Variable) -> bool {
        self.upper.contains_key(&variable)
    }

    pub fn set_lower(&mut self, variable: Variable, bound: f64) {
        self.lower.insert(variable, bound);
    }

    pub fn set_upper(&mut self, variable: Variable, bound: f64) {
        self.upper.insert(variable, bound);
    }

    /// Stores `bound` only if strictly tighter than the current lower bound.
    pub fn tighten_lower(&mut self, variable: Variable, bound: f64) -> bool {
        match self.lower.get(&variable) {
            Some(&current) if current >= bound => false,
            _ => {
                self.lower.insert(variable, bound);
                true
            }
        }
    }

    pub fn tighten_upper(&mut self, variable: Variable, bound: f64) -> bool {
        match self.upper.get(&variable) {
            Some(&current) if current <= bound => false,
            _ => {
                self.upper.insert(variable, bound);
                true
            }
        }
    }

    pub fn stored_lower_bounds(&self) -> &BTreeMap<Variable, f64> {
        &self.lower
    }

    pub fn stored_upper_bounds(&self) -> &BTreeMap<Variable, f64> {
        &self.upper
    }

    pub fn clear_bounds(&mut self) {
        self.lower.clear();
        self.upper.clear();
    }
}

/// The canonical feasibility query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    bounds: BoundStore,
    equations: Vec<Equation>,
    piecewise: Vec<Box<dyn PiecewiseConstraint>>,
    nonlinear: Vec<Box<dyn PiecewiseConstraint>>,
    variable_to_input_index: BTreeMap<Variable, usize>,
    input_index_to_variable: BTreeMap<usize, Variable>,
    variable_to_output_index: BTreeMap<Variable, usize>,
    output_index_to_variable: BTreeMap<usize, Variable>,
    solution: BTreeMap<Variable, f64>,
    debugging_solution: BTreeMap<Variable, f64>,
    /// Disposable cache: dropping and rebuilding the layer graph is legal.
    #[serde(skip)]
    network: Option<NetworkReasoner>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_variable(&self, variable: Variable, context: &'static str) -> VfResult<()> {
        if variable >= self.bounds.num_variables() {
            return Err(VfError::VariableIndexOutOfRange {
                variable,
                num_variables: self.bounds.num_variables(),
                context,
            });
        }
        Ok(())
    }

    pub fn num_variables(&self) -> usize {
        self.bounds.num_variables()
    }

    pub fn set_num_variables(&mut self, n: usize) {
        self.bounds.set_num_variables(n);
    }

    /// Mints a fresh variable at the end of the variable space.
    pub fn new_variable(&mut self) -> Variable {
        self.bounds.new_variable()
    }

    pub fn bounds(&self) -> &BoundStore {
        &self.bounds
    }

    pub fn bounds_mut(&mut self) -> &mut BoundStore {
        &mut self.bounds
    }

    pub fn set_lower(&mut self, variable: Variable, bound: f64) -> VfResult<()> {
        self.check_variable(variable, "set_lower")?;
        self.bounds.set_lower(variable, bound);
        Ok(())
    }

    pub fn set_upper(&mut self, variable: Variable, bound: f64) -> VfResult<()> {
        self.check_variable(variable, "set_upper")?;
        self.bounds.set_upper(variable, bound);
        Ok(())
    }

    pub fn lower_bound(&self, variable: Variable) -> VfResult<f64> {
        self.check_variable(variable, "lower_bound")?;
        Ok(self.bounds.lower(variable))
    }

    pub fn upper_bound(&self, variable: Variable) -> VfResult<f64> {
        self.check_variable(variable, "upper_bound")?;
        Ok(self.bounds.upper(variable))
    }

    /// Stores the bound only if strictly tighter; reports whether it changed.
    pub fn tighten_lower(&mut self, variable: Variable, bound: f64) -> VfResult<bool> {
        self.check_variable(variable, "tighten_lower")?;
        Ok(self.bounds.tighten_lower(variable, bound))
    }

    pub fn tighten_upper(&mut self, variable: Variable, bound: f64) -> VfResult<bool> {
        self.check_variable(variable, "tighten_upper")?;
        Ok(self.bounds.tighten_upper(variable, bound))
    }

    pub fn add_equation(&mut self, equation: Equation) {
        self.equations.push(equation);
    }

    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    pub fn num_equations(&self) -> usize {
        self.equations.len()
    }

    pub fn remove_equation(&mut self, equation: &Equation) {
        self.equations.retain(|e| e != equation);
    }

    /// Removes the equations at the given positions.
    pub fn remove_equations_at(&mut self, indices: &BTreeSet<usize>) {
        let mut index = 0usize;
        self.equations.retain(|_| {
            let keep = !indices.contains(&index);
            index += 1;
            keep
        });
    }

    pub(crate) fn set_equations(&mut self, equations: Vec<Equation>) {
        self.equations = equations;
    }

    pub fn add_piecewise(&mut self, constraint: Box<dyn PiecewiseConstraint>) {
        self.piecewise.push(constraint);
    }

    pub fn add_nonlinear(&mut self, constraint: Box<dyn PiecewiseConstraint>) {
        self.nonlinear.push(constraint);
    }

    pub fn piecewise_constraints(&self) -> &[Box<dyn PiecewiseConstraint>] {
        &self.piecewise
    }

    pub fn piecewise_constraints_mut(&mut self) -> &mut Vec<Box<dyn PiecewiseConstraint>> {
        &mut self.piecewise
    }

    pub fn nonlinear_constraints(&self) -> &[Box<dyn PiecewiseConstraint>] {
        &self.nonlinear
    }

    pub fn nonlinear_constraints_mut(&mut self) -> &mut Vec<Box<dyn PiecewiseConstraint>> {
        &mut self.nonlinear
    }

    pub fn mark_input(&mut self, variable: Variable, input_index: usize) {
        self.variable_to_input_index.insert(variable, input_index);
        self.input_index_to_variable.insert(input_index, variable);
    }

    pub fn mark_output(&mut self, variable: Variable, output_index: usize) {
        self.variable_to_output_index.insert(variable, output_index);
        self.output_index_to_variable.insert(output_index, variable);
    }

    pub fn input_variable_by_index(&self, index: usize) -> Option<Variable> {
        self.input_index_to_variable.get(&index).copied()
    }

    pub fn output_variable_by_index(&self, index: usize) -> Option<Variable> {
        self.output_index_to_variable.get(&index).copied()
    }

    pub fn num_input_variables(&self) -> usize {
        self.input_index_to_variable.len()
    }

    pub fn num_output_variables(&self) -> usize {
        self.output_index_to_variable.len()
    }

    /// Input variables ordered by variable index.
    pub fn input_variables(&self) -> Vec<Variable> {
        self.variable_to_input_index.keys().copied().collect()
    }

    pub fn output_variables(&self) -> Vec<Variable> {
        self.variable_to_output_index.keys().copied().collect()
    }

    pub(crate) fn input_markings(&self) -> &BTreeMap<usize, Variable> {
        &self.input_index_to_variable
    }

    pub(crate) fn output_markings(&self) -> &BTreeMap<usize, Variable> {
        &self.output_index_to_variable
    }

    /// Rewrites every equation and constraint to use `v2` instead of `v1`.
    /// Merging an input or output variable away is an error.
    pub fn merge_identical_variables(&mut self, v1: Variable, v2: Variable) -> VfResult<()> {
        self.check_variable(v1, "merge_identical_variables")?;
        self.check_variable(v2, "merge_identical_variables")?;
        if self.variable_to_input_index.contains_key(&v1) {
            return Err(VfError::MergedInputVariable(v1));
        }
        if self.variable_to_output_index.contains_key(&v1) {
            return Err(VfError::MergedOutputVariable(v1));
        }

        for equation in self.equations.iter_mut() {
            equation.update_variable_index(v1, v2);
        }
        for constraint in self.piecewise.iter_mut().chain(self.nonlinear.iter_mut()) {
            if constraint.participates_in(v1) {
                debug_assert!(!constraint.participates_in(v2));
                constraint.update_variable_index(v1, v2);
            }
        }
        Ok(())
    }

    pub fn set_solution_value(&mut self, variable: Variable, value: f64) {
        self.solution.insert(variable, value);
    }

    pub fn solution_value(&self, variable: Variable) -> VfResult<f64> {
        self.solution
            .get(&variable)
            .copied()
            .ok_or(VfError::VariableNotInSolution(variable))
    }

    pub fn store_debugging_solution(&mut self, variable: Variable, value: f64) {
        self.debugging_solution.insert(variable, value);
    }

    pub fn debugging_solution_value(&self, variable: Variable) -> Option<f64> {
        self.debugging_solution.get(&variable).copied()
    }

    pub fn count_infinite_bounds(&self) -> usize {
        let mut result = 0;
        for v in 0..self.bounds.num_variables() {
            if !self.bounds.lower(v).is_finite() {
                result += 1;
            }
            if !self.bounds.upper(v).is_finite() {
                result += 1;
            }
        }
        result
    }

    /// Encodes `f = clip(b, floor, ceiling)` with two ReLUs and three
    /// equations.
    pub fn add_clip(&mut self, b: Variable, f: Variable, floor: f64, ceiling: f64) {
        // aux1 = b - floor
        let aux1 = self.new_variable();
        let mut eq1 = Equation::new(EquationKind::Equality);
        eq1.add_addend(1.0, b);
        eq1.add_addend(-1.0, aux1);
        eq1.set_scalar(floor);
        self.add_equation(eq1);

        // aux2 = relu(aux1)
        let aux2 = self.new_variable();
        self.add_piecewise(Box::new(ReluConstraint::new(aux1, aux2)));

        // aux3 = -aux2 - floor + ceiling
        let aux3 = self.new_variable();
        let mut eq2 = Equation::new(EquationKind::Equality);
        eq2.add_addend(-1.0, aux2);
        eq2.add_addend(-1.0, aux3);
        eq2.set_scalar(floor - ceiling);
        self.add_equation(eq2);

        // aux4 = relu(aux3)
        let aux4 = self.new_variable();
        self.add_piecewise(Box::new(ReluConstraint::new(aux3, aux4)));

        // f = -aux4 + ceiling
        let mut eq3 = Equation::new(EquationKind::Equality);
        eq3.add_addend(-1.0, aux4);
        eq3.add_addend(-1.0, f);
        eq3.set_scalar(-ceiling);
        self.add_equation(eq3);
    }

    pub fn network(&self) -> Option<&NetworkReasoner> {
        self.network.as_ref()
    }

    pub fn network_mut(&mut self) -> Option<&mut NetworkReasoner> {
        self.network.as_mut()
    }

    pub(crate) fn set_network(&mut self, network: Option<NetworkReasoner>) {
        self.network = network;
    }

    /// Evaluates the network on a concrete input assignment, in input-layer
    /// neuron order.
    pub fn evaluate(&mut self, inputs: &[f64]) -> VfResult<Vec<f64>> {
        let mut network = self
            .network
            .take()
            .expect("construct the network-level reasoner before evaluating");
        let result = network.evaluate(inputs);
        self.network = Some(network);
        result
    }

    /// Runs the network-level reasoner to a fixed point (or until the sweep
    /// budget or deadline is hit) and publishes all tightenings into the
    /// query's bounds. Constraints still owned by the query are notified of
    /// every accepted tightening.
    pub fn propagate_bounds(
        &mut self,
        config: &Config,
        deadline: Option<Instant>,
    ) -> VfResult<PropagationOutcome> {
        let Some(mut network) = self.network.take() else {
            warn!("propagate_bounds called without a network-level reasoner");
            return Ok(PropagationOutcome::FixedPoint);
        };

        let result = network.propagate(&mut self.bounds, config, deadline);
        let published: Vec<Tightening> = network.tightening_log().to_vec();
        self.network = Some(network);
        let outcome = result?;

        self.notify_constraints(&published, config)?;
        Ok(outcome)
    }

    /// Notifies query-owned constraints of bound changes and folds their
    /// entailed tightenings back into the store, to quiescence.
    pub(crate) fn notify_constraints(
        &mut self,
        tightenings: &[Tightening],
        config: &Config,
    ) -> VfResult<()> {
        let mut pending: Vec<Tightening> = tightenings.to_vec();
        let mut rounds = 0usize;
        while !pending.is_empty() && rounds <= config.sweep_budget {
            rounds += 1;
            for t in &pending {
                for constraint in self.piecewise.iter_mut().chain(self.nonlinear.iter_mut()) {
                    if !constraint.participates_in(t.variable) {
                        continue;
                    }
                    match t.kind {
                        BoundKind::Lower => constraint.notify_lower_bound(t.variable, t.value),
                        BoundKind::Upper => constraint.notify_upper_bound(t.variable, t.value),
                    }
                }
            }

            let mut entailed = Vec::new();
            for constraint in self.piecewise.iter().chain(self.nonlinear.iter()) {
                constraint.entailed_tightenings(&mut entailed);
            }

            pending.clear();
            for t in entailed {
                if t.variable >= self.bounds.num_variables() {
                    continue;
                }
                let changed = match t.kind {
                    BoundKind::Lower => self.bounds.tighten_lower(t.variable, t.value),
                    BoundKind::Upper => self.bounds.tighten_upper(t.variable, t.value),
                };
                if changed {
                    let lower = self.bounds.lower(t.variable);
                    let upper = self.bounds.upper(t.variable);
                    if lower > upper + config.epsilon {
                        return Err(VfError::InfeasibleBounds {
                            variable: t.variable,
                            lower,
                            upper,
                        });
                    }
                    pending.push(t);
                }
            }
        }
        Ok(())
    }

    /// Dumps all bounds, constraints and equations through tracing.
    pub fn dump(&self) {
        tracing::debug!("Total number of variables: {}", self.num_variables());
        for v in 0..self.num_variables() {
            tracing::debug!("\tx{}: [{}, {}]", v, self.bounds.lower(v), self.bounds.upper(v));
        }
        for constraint in self.piecewise.iter().chain(self.nonlinear.iter()) {
            tracing::debug!("\t{}", constraint.serialize_line());
        }
        for equation in &self.equations {
            tracing::debug!("\t{equation}");
        }
    }
}
