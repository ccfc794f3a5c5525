//! f = b1 * b2. Smooth; interval reasoning over the four corner products.

use std::any::Any;

use serde::{Deserialize, Serialize};

use super::{parse_variable, ConstraintKind, Phase, PiecewiseConstraint, WatchedBounds};
use crate::errors::{VfError, VfResult};
use crate::types::{Tightening, Variable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BilinearConstraint {
    bs: [Variable; 2],
    f: Variable,
    bounds: WatchedBounds,
    have_eliminated_variables: bool,
}

impl BilinearConstraint {
    pub fn new(b1: Variable, b2: Variable, f: Variable) -> Self {
        Self {
            bs: [b1, b2],
            f,
            bounds: WatchedBounds::default(),
            have_eliminated_variables: false,
        }
    }

    pub fn bs(&self) -> [Variable; 2] {
        self.bs
    }

    pub fn f(&self) -> Variable {
        self.f
    }

    pub(crate) fn parse_line(parts: &[&str]) -> VfResult<Self> {
        if parts.len() != 3 {
            return Err(VfError::ParseError(format!(
                "bilinear expects 3 fields, got {}",
                parts.len()
            )));
        }
        let f = parse_variable(parts[0])?;
        let b1 = parse_variable(parts[1])?;
        let b2 = parse_variable(parts[2])?;
        Ok(Self::new(b1, b2, f))
    }
}

#[typetag::serde]
impl PiecewiseConstraint for BilinearConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Bilinear
    }

    fn participating_variables(&self) -> Vec<Variable> {
        vec![self.bs[0], self.bs[1], self.f]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore_state(&mut self, other: &dyn PiecewiseConstraint) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .expect("restore_state requires a bilinear");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        self.bounds.update_lower(variable, bound);
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        self.bounds.update_upper(variable, bound);
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let x_lb = self.bounds.lower(self.bs[0]);
        let x_ub = self.bounds.upper(self.bs[0]);
        let y_lb = self.bounds.lower(self.bs[1]);
        let y_ub = self.bounds.upper(self.bs[1]);

        if x_lb.is_finite() && x_ub.is_finite() && y_lb.is_finite() && y_ub.is_finite() {
            let corners = [x_lb * y_lb, x_lb * y_ub, x_ub * y_lb, x_ub * y_ub];
            let lb = corners.iter().copied().fold(f64::INFINITY, f64::min);
            let ub = corners.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            out.push(Tightening::lower(self.f, lb));
            out.push(Tightening::upper(self.f, ub));
        }
    }

    fn phase(&self) -> Phase {
        Phase::NotFixed
    }

    fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
        self.have_eliminated_variables = true;
    }

    fn update_variable_index(&mut self, old: Variable, new: Variable) {
        for b in self.bs.iter_mut() {
            if *b == old {
                *b = new;
            }
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
        format!("bilinear,{},{},{}", self.f, self.bs[0], self.bs[1])
    }
}
