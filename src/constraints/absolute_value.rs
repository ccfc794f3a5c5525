//! f = |b|. Phases: positive (f = b) and negative (f = -b).

use std::any::Any;

use serde::{Deserialize, Serialize};

use super::{
    is_negative, is_positive, parse_variable, ConstraintKind, Phase, PieceSplit,
    PiecewiseConstraint, WatchedBounds,
};
use crate::errors::{VfError, VfResult};
use crate::query::{Equation, EquationKind, LinearExpression, Query};
use crate::types::{Tightening, Variable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsoluteValueConstraint {
    b: Variable,
    f: Variable,
    phase: Phase,
    aux_positive: Option<Variable>,
    aux_negative: Option<Variable>,
    bounds: WatchedBounds,
    have_eliminated_variables: bool,
}

impl AbsoluteValueConstraint {
    pub fn new(b: Variable, f: Variable) -> Self {
        Self {
            b,
            f,
            phase: Phase::NotFixed,
            aux_positive: None,
            aux_negative: None,
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
                "absoluteValue expects 2 fields, got {}",
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
        if let Some(aux) = self.aux_positive {
            split.tightenings.push(Tightening::upper(aux, 0.0));
        } else {
            // f = b
            let mut eq = Equation::new(EquationKind::Equality);
            eq.add_addend(1.0, self.f);
            eq.add_addend(-1.0, self.b);
            eq.set_scalar(0.0);
            split.equations.push(eq);
        }
        split
    }

    fn negative_split(&self) -> PieceSplit {
        let mut split = PieceSplit::new();
        split.tightenings.push(Tightening::upper(self.b, 0.0));
        if let Some(aux) = self.aux_negative {
            split.tightenings.push(Tightening::upper(aux, 0.0));
        } else {
            // f = -b
            let mut eq = Equation::new(EquationKind::Equality);
            eq.add_addend(1.0, self.f);
            eq.add_addend(1.0, self.b);
            eq.set_scalar(0.0);
            split.equations.push(eq);
        }
        split
    }
}

#[typetag::serde]
impl PiecewiseConstraint for AbsoluteValueConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::AbsoluteValue
    }

    fn participating_variables(&self) -> Vec<Variable> {
        let mut vars = vec![self.b, self.f];
        vars.extend(self.aux_positive);
        vars.extend(self.aux_negative);
        vars
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore_state(&mut self, other: &dyn PiecewiseConstraint) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .expect("restore_state requires an absolute value");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        if !self.bounds.update_lower(variable, bound) {
            return;
        }
        if variable == self.b && !is_negative(bound) {
            self.set_phase(Phase::Positive);
        } else if variable == self.f && is_positive(bound) {
            // |b| has a positive floor; the phase fixes once b's sign does.
            let b_lb = self.bounds.lower(self.b);
            let b_ub = self.bounds.upper(self.b);
            if b_lb > -bound + super::COMPARISON_EPSILON {
                self.set_phase(Phase::Positive);
            } else if b_ub < bound - super::COMPARISON_EPSILON {
                self.set_phase(Phase::Negative);
            }
        }
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        if !self.bounds.update_upper(variable, bound) {
            return;
        }
        if variable == self.b && !is_positive(bound) {
            self.set_phase(Phase::Negative);
        }
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let b_lb = self.bounds.lower(self.b);
        let b_ub = self.bounds.upper(self.b);
        let f_ub = self.bounds.upper(self.f);

        out.push(Tightening::lower(self.f, 0.0));
        if b_lb.is_finite() && b_ub.is_finite() {
            out.push(Tightening::upper(self.f, (-b_lb).max(b_ub)));
        }
        if b_lb > 0.0 {
            out.push(Tightening::lower(self.f, b_lb));
        }
        if b_ub < 0.0 {
            out.push(Tightening::lower(self.f, -b_ub));
        }
        if f_ub.is_finite() {
            out.push(Tightening::upper(self.b, f_ub));
            out.push(Tightening::lower(self.b, -f_ub));
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

    fn transform_to_use_aux(&mut self, query: &mut Query) {
        if self.aux_positive.is_some() {
            return;
        }

        // aux_positive = f - b, non-negative.
        let aux_positive = query.new_variable();
        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(1.0, self.f);
        eq.add_addend(-1.0, self.b);
        eq.add_addend(-1.0, aux_positive);
        eq.set_scalar(0.0);
        query.add_equation(eq);
        let _ = query.set_lower(aux_positive, 0.0);

        // aux_negative = f + b, non-negative.
        let aux_negative = query.new_variable();
        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(1.0, self.f);
        eq.add_addend(1.0, self.b);
        eq.add_addend(-1.0, aux_negative);
        eq.set_scalar(0.0);
        query.add_equation(eq);
        let _ = query.set_lower(aux_negative, 0.0);

        self.aux_positive = Some(aux_positive);
        self.aux_negative = Some(aux_negative);
    }

    fn cost_term(&self, phase: Phase, cost: &mut LinearExpression) {
        match phase {
            Phase::Positive => {
                cost.add_term(1.0, self.f);
                cost.add_term(-1.0, self.b);
            }
            Phase::Negative => {
                cost.add_term(1.0, self.f);
                cost.add_term(1.0, self.b);
            }
            _ => {}
        }
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
        if self.aux_positive == Some(old) {
            self.aux_positive = Some(new);
        }
        if self.aux_negative == Some(old) {
            self.aux_negative = Some(new);
        }
        self.bounds.rename(old, new);
    }

    fn is_obsolete(&self) -> bool {
        self.have_eliminated_variables
    }

    fn serialize_line(&self) -> String {
        format!("absoluteValue,{},{}", self.f, self.b)
    }
}
