//! f = round(b), ties to even. Discrete in semantics but handled uniformly
//! with the smooth family: no phases, no case splits.

use std::any::Any;

use serde::{Deserialize, Serialize};

use super::{
    parse_variable, ConstraintKind, Phase, PiecewiseConstraint, WatchedBounds,
};
use crate::errors::{VfError, VfResult};
use crate::types::{Tightening, Variable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundConstraint {
    b: Variable,
    f: Variable,
    bounds: WatchedBounds,
    have_eliminated_variables: bool,
}

impl RoundConstraint {
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
                "round expects 2 fields, got {}",
                parts.len()
            )));
        }
        let f = parse_variable(parts[0])?;
        let b = parse_variable(parts[1])?;
        Ok(Self::new(b, f))
    }
}

#[typetag::serde]
impl PiecewiseConstraint for RoundConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Round
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
            .expect("restore_state requires a round");
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

        if b_lb.is_finite() {
            out.push(Tightening::lower(self.f, b_lb.round_ties_even()));
        }
        if b_ub.is_finite() {
            out.push(Tightening::upper(self.f, b_ub.round_ties_even()));
        }
        // b never strays more than half a unit from f.
        if f_lb.is_finite() {
            out.push(Tightening::lower(self.b, f_lb - 0.5));
        }
        if f_ub.is_finite() {
            out.push(Tightening::upper(self.b, f_ub + 0.5));
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
        format!("round,{},{}", self.f, self.b)
    }
}
