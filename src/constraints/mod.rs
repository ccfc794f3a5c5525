//! The protocol shared by every piecewise-linear and smooth non-linear
//! constraint: identity and structure, bound watching, case splits with the
//! complementarity law, auxiliary-variable transformations, cost-function
//! contributions, and elimination.

pub mod absolute_value;
pub mod bilinear;
pub mod disjunction;
pub mod leaky_relu;
pub mod max;
pub mod relu;
pub mod round;
pub mod sigmoid;
pub mod sign;
pub mod softmax;

pub use absolute_value::AbsoluteValueConstraint;
pub use bilinear::BilinearConstraint;
pub use disjunction::DisjunctionConstraint;
pub use leaky_relu::LeakyReluConstraint;
pub use max::MaxConstraint;
pub use relu::ReluConstraint;
pub use round::RoundConstraint;
pub use sigmoid::SigmoidConstraint;
pub use sign::SignConstraint;
pub use softmax::SoftmaxConstraint;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};

use crate::errors::{VfError, VfResult};
use crate::query::{Equation, LinearExpression, Query};
use crate::types::{Tightening, Variable};

/// Epsilon used by the constraints' local phase decisions.
pub const COMPARISON_EPSILON: f64 = 1e-9;

pub(crate) fn is_zero(x: f64) -> bool {
    x.abs() <= COMPARISON_EPSILON
}

pub(crate) fn is_positive(x: f64) -> bool {
    x > COMPARISON_EPSILON
}

pub(crate) fn is_negative(x: f64) -> bool {
    x < -COMPARISON_EPSILON
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    Relu,
    LeakyRelu,
    Sign,
    AbsoluteValue,
    Max,
    Round,
    Sigmoid,
    Softmax,
    Bilinear,
    Disjunction,
}

impl ConstraintKind {
    /// Wire tag used by the one-line serialization.
    pub fn tag(self) -> &'static str {
        match self {
            ConstraintKind::Relu => "relu",
            ConstraintKind::LeakyRelu => "leaky_relu",
            ConstraintKind::Sign => "sign",
            ConstraintKind::AbsoluteValue => "absoluteValue",
            ConstraintKind::Max => "max",
            ConstraintKind::Round => "round",
            ConstraintKind::Sigmoid => "sigmoid",
            ConstraintKind::Softmax => "softmax",
            ConstraintKind::Bilinear => "bilinear",
            ConstraintKind::Disjunction => "disj",
        }
    }

    pub fn from_tag(tag: &str) -> VfResult<Self> {
        Ok(match tag {
            "relu" => ConstraintKind::Relu,
            "leaky_relu" => ConstraintKind::LeakyRelu,
            "sign" => ConstraintKind::Sign,
            "absoluteValue" => ConstraintKind::AbsoluteValue,
            "max" => ConstraintKind::Max,
            "round" => ConstraintKind::Round,
            "sigmoid" => ConstraintKind::Sigmoid,
            "softmax" => ConstraintKind::Softmax,
            "bilinear" => ConstraintKind::Bilinear,
            "disj" => ConstraintKind::Disjunction,
            other => return Err(VfError::UnsupportedConstraintKind(other.to_string())),
        })
    }
}

/// The discrete choice that, once fixed, makes a non-linear constraint
/// linear. `Case(k)` is used by constraints with one phase per element
/// (max, disjunction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    NotFixed,
    Active,
    Inactive,
    Positive,
    Negative,
    Case(usize),
}

/// One case of a case split: bound tightenings plus equations to conjoin
/// with the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PieceSplit {
    pub tightenings: Vec<Tightening>,
    pub equations: Vec<Equation>,
}

impl PieceSplit {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Cached view of the watched variables' bounds, updated through the notify
/// callbacks. Only strictly tighter values are stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchedBounds {
    lower: BTreeMap<Variable, f64>,
    upper: BTreeMap<Variable, f64>,
}

impl WatchedBounds {
    /// Returns whether the stored bound changed.
    pub fn update_lower(&mut self, variable: Variable, bound: f64) -> bool {
        match self.lower.get(&variable) {
            Some(&current) if current >= bound => false,
            _ => {
                self.lower.insert(variable, bound);
                true
            }
        }
    }

    pub fn update_upper(&mut self, variable: Variable, bound: f64) -> bool {
        match self.upper.get(&variable) {
            Some(&current) if current <= bound => false,
            _ => {
                self.upper.insert(variable, bound);
                true
            }
        }
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

    pub fn rename(&mut self, old: Variable, new: Variable) {
        if let Some(value) = self.lower.remove(&old) {
            self.update_lower(new, value);
        }
        if let Some(value) = self.upper.remove(&old) {
            self.update_upper(new, value);
        }
    }
}

/// The contract every non-linear constraint implements. The lifter relies on
/// it to classify constraints into typed layers; the propagation loop relies
/// on it to react to bound events.
#[typetag::serde]
pub trait PiecewiseConstraint: std::fmt::Debug + DynClone + Send + Sync {
    fn kind(&self) -> ConstraintKind;

    /// Ordered list of participating variables, stable across calls.
    fn participating_variables(&self) -> Vec<Variable>;

    fn participates_in(&self, variable: Variable) -> bool {
        self.participating_variables().contains(&variable)
    }

    fn as_any(&self) -> &dyn Any;

    /// Copies all mutable state from `other`, preserving identity. Used to
    /// undo case splits.
    fn restore_state(&mut self, other: &dyn PiecewiseConstraint);

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64);
    fn notify_upper_bound(&mut self, variable: Variable, bound: f64);

    /// Bound tightenings implied by the current cached bounds. May over-emit;
    /// the store only accepts strict improvements.
    fn entailed_tightenings(&self, out: &mut Vec<Tightening>);

    fn phase(&self) -> Phase;

    fn phase_fixed(&self) -> bool {
        self.phase() != Phase::NotFixed
    }

    /// Ordered case list. The split at position i, conjoined with the
    /// negations of the splits before it, is equivalent to the constraint.
    /// Empty for the smooth family.
    fn all_cases(&self) -> Vec<Phase> {
        Vec::new()
    }

    fn case_split(&self, _phase: Phase) -> Option<PieceSplit> {
        None
    }

    /// The split corresponding to the fixed phase, if any.
    fn valid_split(&self) -> Option<PieceSplit> {
        match self.phase() {
            Phase::NotFixed => None,
            phase => self.case_split(phase),
        }
    }

    /// Adds fresh variables and equations that make the constraint linearly
    /// expressible up to a simpler residual constraint.
    fn transform_to_use_aux(&mut self, _query: &mut Query) {}

    /// Adds the linear expression that is zero exactly when the constraint
    /// holds in `phase`. Used by the sum-of-infeasibilities search.
    fn cost_term(&self, _phase: Phase, _cost: &mut LinearExpression) {}

    fn eliminate_variable(&mut self, variable: Variable, value: f64);
    fn update_variable_index(&mut self, old: Variable, new: Variable);
    fn is_obsolete(&self) -> bool;

    /// One-line text form, `kind,v1,v2,...[,params]`.
    fn serialize_line(&self) -> String;
}

dyn_clone::clone_trait_object!(PiecewiseConstraint);

/// Parses a serialized one-line constraint back into a boxed trait object.
pub fn deserialize_line(line: &str) -> VfResult<Box<dyn PiecewiseConstraint>> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.is_empty() {
        return Err(VfError::ParseError("empty constraint line".into()));
    }
    let kind = ConstraintKind::from_tag(parts[0])?;
    Ok(match kind {
        ConstraintKind::Relu => Box::new(ReluConstraint::parse_line(&parts[1..])?),
        ConstraintKind::LeakyRelu => Box::new(LeakyReluConstraint::parse_line(&parts[1..])?),
        ConstraintKind::Sign => Box::new(SignConstraint::parse_line(&parts[1..])?),
        ConstraintKind::AbsoluteValue => {
            Box::new(AbsoluteValueConstraint::parse_line(&parts[1..])?)
        }
        ConstraintKind::Max => Box::new(MaxConstraint::parse_line(&parts[1..])?),
        ConstraintKind::Round => Box::new(RoundConstraint::parse_line(&parts[1..])?),
        ConstraintKind::Sigmoid => Box::new(SigmoidConstraint::parse_line(&parts[1..])?),
        ConstraintKind::Softmax => Box::new(SoftmaxConstraint::parse_line(&parts[1..])?),
        ConstraintKind::Bilinear => Box::new(BilinearConstraint::parse_line(&parts[1..])?),
        ConstraintKind::Disjunction => Box::new(DisjunctionConstraint::parse_line(&parts[1..])?),
    })
}

pub(crate) fn parse_variable(token: &str) -> VfResult<Variable> {
    token
        .trim()
        .parse::<Variable>()
        .map_err(|_| VfError::ParseError(format!("expected a variable index, got `{token}`")))
}

pub(crate) fn parse_scalar(token: &str) -> VfResult<f64> {
    token
        .trim()
        .parse::<f64>()
        .map_err(|_| VfError::ParseError(format!("expected a scalar, got `{token}`")))
}

pub(crate) fn join_variables(out: &mut String, variables: &[Variable]) {
    for v in variables {
        let _ = write!(out, ",{v}");
    }
}
