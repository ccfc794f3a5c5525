//! f = max(x_1, ..., x_k). One phase per element; the phase fixes when some
//! element's lower bound dominates every other element's upper bound.

use std::any::Any;

use serde::{Deserialize, Serialize};

use super::{
    join_variables, parse_variable, ConstraintKind, Phase, PieceSplit, PiecewiseConstraint,
    WatchedBounds, COMPARISON_EPSILON,
};
use crate::errors::{VfError, VfResult};
use crate::query::{Equation, EquationKind, LinearExpression};
use crate::types::{Tightening, Variable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxConstraint {
    f: Variable,
    elements: Vec<Variable>,
    phase: Phase,
    bounds: WatchedBounds,
    /// Largest value among eliminated elements; still a candidate for the max.
    max_value_of_eliminated: Option<f64>,
    obsolete: bool,
}

impl MaxConstraint {
    pub fn new(f: Variable, elements: Vec<Variable>) -> Self {
        assert!(!elements.is_empty(), "max requires at least one element");
        Self {
            f,
            elements,
            phase: Phase::NotFixed,
            bounds: WatchedBounds::default(),
            max_value_of_eliminated: None,
            obsolete: false,
        }
    }

    pub fn f(&self) -> Variable {
        self.f
    }

    pub fn elements(&self) -> &[Variable] {
        &self.elements
    }

    pub(crate) fn parse_line(parts: &[&str]) -> VfResult<Self> {
        if parts.len() < 2 {
            return Err(VfError::ParseError(format!(
                "max expects at least 2 fields, got {}",
                parts.len()
            )));
        }
        let f = parse_variable(parts[0])?;
        let elements = parts[1..]
            .iter()
            .map(|t| parse_variable(t))
            .collect::<VfResult<Vec<_>>>()?;
        Ok(Self::new(f, elements))
    }

    /// Re-examines the cached bounds; fixes the phase when one element's
    /// lower bound strictly dominates every other element's upper bound.
    fn check_phase(&mut self) {
        if self.phase != Phase::NotFixed {
            return;
        }
        let mut winner = 0usize;
        let mut max_lb = f64::NEG_INFINITY;
        for (i, &element) in self.elements.iter().enumerate() {
            let lb = self.bounds.lower(element);
            if lb > max_lb {
                max_lb = lb;
                winner = i;
            }
        }
        if !max_lb.is_finite() {
            return;
        }
        if let Some(eliminated) = self.max_value_of_eliminated {
            if eliminated > max_lb - COMPARISON_EPSILON {
                return;
            }
        }
        for (i, &element) in self.elements.iter().enumerate() {
            if i != winner && self.bounds.upper(element) - max_lb > COMPARISON_EPSILON {
                return;
            }
        }
        self.phase = Phase::Case(winner);
    }
}

#[typetag::serde]
impl PiecewiseConstraint for MaxConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Max
    }

    fn participating_variables(&self) -> Vec<Variable> {
        let mut vars = vec![self.f];
        vars.extend_from_slice(&self.elements);
        vars
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore_state(&mut self, other: &dyn PiecewiseConstraint) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .expect("restore_state requires a max");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        if self.bounds.update_lower(variable, bound) {
            self.check_phase();
        }
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        if self.bounds.update_upper(variable, bound) {
            self.check_phase();
        }
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        let mut max_lb = self.max_value_of_eliminated.unwrap_or(f64::NEG_INFINITY);
        let mut max_ub = self.max_value_of_eliminated.unwrap_or(f64::NEG_INFINITY);
        for &element in &self.elements {
            max_lb = max_lb.max(self.bounds.lower(element));
            max_ub = max_ub.max(self.bounds.upper(element));
        }
        if max_lb.is_finite() {
            out.push(Tightening::lower(self.f, max_lb));
        }
        if max_ub.is_finite() {
            out.push(Tightening::upper(self.f, max_ub));
        }
        // Every element stays below the max.
        let f_ub = self.bounds.upper(self.f);
        if f_ub.is_finite() {
            for &element in &self.elements {
                out.push(Tightening::upper(element, f_ub));
            }
        }
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn all_cases(&self) -> Vec<Phase> {
        (0..self.elements.len()).map(Phase::Case).collect()
    }

    fn case_split(&self, phase: Phase) -> Option<PieceSplit> {
        let Phase::Case(winner) = phase else {
            return None;
        };
        let winner_var = *self.elements.get(winner)?;
        let mut split = PieceSplit::new();

        // f = x_winner
        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(1.0, self.f);
        eq.add_addend(-1.0, winner_var);
        eq.set_scalar(0.0);
        split.equations.push(eq);

        // x_winner >= x_j for every other element
        for &other in &self.elements {
            if other == winner_var {
                continue;
            }
            let mut ge = Equation::new(EquationKind::GreaterEq);
            ge.add_addend(1.0, winner_var);
            ge.add_addend(-1.0, other);
            ge.set_scalar(0.0);
            split.equations.push(ge);
        }

        if let Some(eliminated) = self.max_value_of_eliminated {
            split
                .tightenings
                .push(Tightening::lower(winner_var, eliminated));
        }

        Some(split)
    }

    fn cost_term(&self, phase: Phase, cost: &mut LinearExpression) {
        if let Phase::Case(winner) = phase {
            if let Some(&winner_var) = self.elements.get(winner) {
                // Zero exactly when f = x_winner.
                cost.add_term(1.0, self.f);
                cost.add_term(-1.0, winner_var);
            }
        }
    }

    fn eliminate_variable(&mut self, variable: Variable, value: f64) {
        if variable == self.f {
            self.obsolete = true;
            return;
        }
        self.elements.retain(|&e| e != variable);
        let best = self.max_value_of_eliminated.unwrap_or(f64::NEG_INFINITY);
        if value > best {
            self.max_value_of_eliminated = Some(value);
        }
        if self.elements.is_empty() {
            self.obsolete = true;
        }
    }

    fn update_variable_index(&mut self, old: Variable, new: Variable) {
        if self.f == old {
            self.f = new;
        }
        for element in self.elements.iter_mut() {
            if *element == old {
                *element = new;
            }
        }
        self.bounds.rename(old, new);
    }

    fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    fn serialize_line(&self) -> String {
        let mut line = format!("max,{}", self.f);
        join_variables(&mut line, &self.elements);
        line
    }
}
