//! f = sign(b): +1 when b >= 0, -1 otherwise.

use std::any::Any;

use serde::{Deserialize, Serialize};

use super::{
    is_negative, parse_variable, ConstraintKind, Phase, PieceSplit, PiecewiseConstraint,
    WatchedBounds,
};
use crate::errors::{VfError, VfResult};
use crate::query::LinearExpression;
use crate::types::{Tightening, Variable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignConstraint {
    b: Variable,
    f: Variable,
    phase: Phase,
    bounds: WatchedBounds,
    have_eliminated_variables: bool,
}

impl SignConstraint {
    pub fn new(b: Variable, f: Variable) -> Self {
        Self {
            b,
            f,
            phase: Phase::NotFixed,
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
                "sign expects 2 fields, got {}",
                parts.len()
            )));
        }
        let f = parse_variable(parts[0])?;
        let b = parse_variable(parts[1])?;
        Ok(Self::new(b, f))
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == Phase::NotFixed {
            self.phase = phase;
        }
    }

    fn positive_split(&self) -> PieceSplit {
        let mut split = PieceSplit::new();
        split.tightenings.push(Tightening::lower(self.b, 0.0));
        split.tightenings.push(Tightening::lower(self.f, 1.0));
        split.tightenings.push(Tightening::upper(self.f, 1.0));
        split
    }

    fn negative_split(&self) -> PieceSplit {
        let mut split = PieceSplit::new();
        split.tightenings.push(Tightening::upper(self.b, 0.0));
        split.tightenings.push(Tightening::lower(self.f, -1.0));
        split.tightenings.push(Tightening::upper(self.f, -1.0));
        split
    }
}

#[typetag::serde]
impl PiecewiseConstraint for SignConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Sign
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
            .expect("restore_state requires a sign");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        if !self.bounds.update_lower(variable, bound) {
            return;
        }
        if variable == self.b && !is_negative(bound) {
            self.set_phase(Phase::Positive);
        } else if variable == self.f && bound > -1.0 + super::COMPARISON_EPSILON {
            self.set_phase(Phase::Positive);
        }
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        if !self.bounds.update_upper(variable, bound) {
            return;
        }
        if variable == self.b && is_negative(bound) {
            self.set_phase(Phase::Negative);
        } else if variable == self.f && bound < 1.0 - super::COMPARISON_EPSILON {
            self.set_phase(Phase::Negative);
        }
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        out.push(Tightening::lower(self.f, -1.0));
        out.push(Tightening::upper(self.f, 1.0));
        match self.phase {
            Phase::Positive => {
                out.push(Tightening::lower(self.f, 1.0));
                out.push(Tightening::lower(self.b, 0.0));
            }
            Phase::Negative => {
                out.push(Tightening::upper(self.f, -1.0));
                out.push(Tightening::upper(self.b, 0.0));
            }
            _ => {}
        }
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn all_cases(&self) -> Vec<Phase> {
        vec![Phase::Negative, Phase::Positive]
    }

    fn case_split(&self, phase: Phase) -> Option<PieceSplit> {
        match phase {
            Phase::Positive => Some(self.positive_split()),
            Phase::Negative => Some(self.negative_split()),
            _ => None,
        }
    }

    fn cost_term(&self, _phase: Phase, _cost: &mut LinearExpression) {
        // Sign does not contribute to the SoI objective.
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
        format!("sign,{},{}", self.f, self.b)
    }
}
