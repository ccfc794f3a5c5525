//! f = max(b, 0). Phases: active (f = b, b >= 0) and inactive (f = 0, b <= 0).

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
pub struct ReluConstraint {
    b: Variable,
    f: Variable,
    phase: Phase,
    aux_active: Option<Variable>,
    aux_inactive: Option<Variable>,
    bounds: WatchedBounds,
    have_eliminated_variables: bool,
}

impl ReluConstraint {
    pub fn new(b: Variable, f: Variable) -> Self {
        Self {
            b,
            f,
            phase: Phase::NotFixed,
            aux_active: None,
            aux_inactive: None,
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

    pub fn aux_variables_in_use(&self) -> bool {
        self.aux_active.is_some()
    }

    pub(crate) fn parse_line(parts: &[&str]) -> VfResult<Self> {
        if parts.len() != 2 {
            return Err(VfError::ParseError(format!(
                "relu expects 2 fields, got {}",
                parts.len()
            )));
        }
        let f = parse_variable(parts[0])?;
        let b = parse_variable(parts[1])?;
        Ok(Self::new(b, f))
    }

    fn set_phase(&mut self, phase: Phase) {
        // Monotone: once fixed, only restore_state can unfix.
        if self.phase == Phase::NotFixed {
            self.phase = phase;
        }
    }

    fn active_split(&self) -> PieceSplit {
        let mut split = PieceSplit::new();
        split.tightenings.push(Tightening::lower(self.b, 0.0));
        if let Some(aux) = self.aux_active {
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

    fn inactive_split(&self) -> PieceSplit {
        let mut split = PieceSplit::new();
        split.tightenings.push(Tightening::upper(self.b, 0.0));
        split.tightenings.push(Tightening::upper(self.f, 0.0));
        split.tightenings.push(Tightening::lower(self.f, 0.0));
        split
    }
}

#[typetag::serde]
impl PiecewiseConstraint for ReluConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Relu
    }

    fn participating_variables(&self) -> Vec<Variable> {
        let mut vars = vec![self.b, self.f];
        vars.extend(self.aux_active);
        vars.extend(self.aux_inactive);
        vars
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore_state(&mut self, other: &dyn PiecewiseConstraint) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .expect("restore_state requires a relu");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        if !self.bounds.update_lower(variable, bound) {
            return;
        }
        if variable == self.b && !is_negative(bound) {
            self.set_phase(Phase::Active);
        } else if variable == self.f && is_positive(bound) {
            self.set_phase(Phase::Active);
        }
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        if !self.bounds.update_upper(variable, bound) {
            return;
        }
        if (variable == self.b || variable == self.f) && !is_positive(bound) {
            self.set_phase(Phase::Inactive);
        }
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let b_lb = self.bounds.lower(self.b);
        let b_ub = self.bounds.upper(self.b);
        let f_lb = self.bounds.lower(self.f);
        let f_ub = self.bounds.upper(self.f);

        out.push(Tightening::lower(self.f, 0.0));
        if b_lb.is_finite() {
            out.push(Tightening::lower(self.f, b_lb));
        }
        if b_ub.is_finite() {
            out.push(Tightening::upper(self.f, b_ub.max(0.0)));
        }
        // b <= f always, and when f is known positive the two coincide.
        if f_ub.is_finite() {
            out.push(Tightening::upper(self.b, f_ub));
        }
        if is_positive(f_lb) {
            out.push(Tightening::lower(self.b, f_lb));
        }
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn all_cases(&self) -> Vec<Phase> {
        vec![Phase::Inactive, Phase::Active]
    }

    fn case_split(&self, phase: Phase) -> Option<PieceSplit> {
        match phase {
            Phase::Active => Some(self.active_split()),
            Phase::Inactive => Some(self.inactive_split()),
            _ => None,
        }
    }

    fn transform_to_use_aux(&mut self, query: &mut Query) {
        if self.aux_active.is_some() {
            return;
        }

        // aux_active = f - b, non-negative.
        let aux_active = query.new_variable();
        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(1.0, self.f);
        eq.add_addend(-1.0, self.b);
        eq.add_addend(-1.0, aux_active);
        eq.set_scalar(0.0);
        query.add_equation(eq);
        let _ = query.set_lower(aux_active, 0.0);

        // aux_inactive = f, non-negative.
        let aux_inactive = query.new_variable();
        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(1.0, self.f);
        eq.add_addend(-1.0, aux_inactive);
        eq.set_scalar(0.0);
        query.add_equation(eq);
        let _ = query.set_lower(aux_inactive, 0.0);

        self.aux_active = Some(aux_active);
        self.aux_inactive = Some(aux_inactive);
    }

    fn cost_term(&self, phase: Phase, cost: &mut LinearExpression) {
        match phase {
            // Zero exactly when f = b.
            Phase::Active => {
                cost.add_term(1.0, self.f);
                cost.add_term(-1.0, self.b);
            }
            // Zero exactly when f = 0.
            Phase::Inactive => cost.add_term(1.0, self.f),
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
        if self.aux_active == Some(old) {
            self.aux_active = Some(new);
        }
        if self.aux_inactive == Some(old) {
            self.aux_inactive = Some(new);
        }
        self.bounds.rename(old, new);
    }

    fn is_obsolete(&self) -> bool {
        self.have_eliminated_variables
    }

    fn serialize_line(&self) -> String {
        format!("relu,{},{}", self.f, self.b)
    }
}
