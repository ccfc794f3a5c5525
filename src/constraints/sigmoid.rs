//! f = 1 / (1 + e^(-b)). Smooth; contributes monotone entailed tightenings.

use std::any::Any;

use serde::{Deserialize, Serialize};

use super::{parse_variable, ConstraintKind, Phase, PiecewiseConstraint, WatchedBounds};
use crate::errors::{VfError, VfResult};
use crate::types::{Tightening, Variable};

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid_derivative(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

/// Inverse of the sigmoid on (0, 1).
pub fn logit(y: f64) -> f64 {
    (y / (1.0 - y)).ln()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigmoidConstraint {
    b: Variable,
    f: Variable,
    bounds: WatchedBounds,
    have_eliminated_variables: bool,
}

impl SigmoidConstraint {
    pub fn new(b: Variable, f: Variable) -> Self {
        Self {
            b,
            f,
            bounds: WatchedBounds::default(),
            have_eliminated_variables: false,
        }
    }

    pub fn b(&self) -> Variable {
        self.b
    }

    pub fn f(&self) -> Variable {
        self.f
    }

    pub(crate) fn parse_line(parts: &[&str]) -> VfResult<Self> {
        if parts.len() != 2 {
            return Err(VfError::ParseError(format!(
                "sigmoid expects 2 fields, got {}",
                parts.len()
            )));
        }
        let f = parse_variable(parts[0])?;
        let b = parse_variable(parts[1])?;
        Ok(Self::new(b, f))
    }
}

#[typetag::serde]
impl PiecewiseConstraint for SigmoidConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Sigmoid
    }

    fn participating_variables(&self) -> Vec<Variable> {
        vec![self.b, self.f]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore_state(&mut self, other: &dyn PiecewiseConstraint) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .expect("restore_state requires a sigmoid");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        self.bounds.update_lower(variable, bound);
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        self.bounds.update_upper(variable, bound);
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let b_lb = self.bounds.lower(self.b);
        let b_ub = self.bounds.upper(self.b);
        let f_lb = self.bounds.lower(self.f);
        let f_ub = self.bounds.upper(self.f);

        out.push(Tightening::lower(self.f, sigmoid(b_lb)));
        out.push(Tightening::upper(self.f, sigmoid(b_ub)));
        if f_lb > 0.0 && f_lb < 1.0 {
            out.push(Tightening::lower(self.b, logit(f_lb)));
        }
        if f_ub > 0.0 && f_ub < 1.0 {
            out.push(Tightening::upper(self.b, logit(f_ub)));
        }
    }

    fn phase(&self) -> Phase {
        Phase::NotFixed
    }

    fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
        self.have_eliminated_variables = true;
    }

    fn update_variable_index(&mut self, old: Variable, new: Variable) {
        if self.b == old {
            self.b = new;
        }
        if self.f == old {
            self.f = new;
        }
        self.bounds.rename(old, new);
    }

    fn is_obsolete(&self) -> bool {
        self.have_eliminated_variables
    }

    fn serialize_line(&self) -> String {
        format!("sigmoid,{},{}", self.f, self.b)
    }
}
