//! A disjunction over groups of bound tightenings and linear equations.
//! Compiled from `or` terms of property files; the search enumerates the
//! disjuncts as cases.

use std::any::Any;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use super::{
    parse_scalar, parse_variable, ConstraintKind, Phase, PieceSplit, PiecewiseConstraint,
    WatchedBounds, COMPARISON_EPSILON,
};
use crate::errors::{VfError, VfResult};
use crate::query::{Equation, EquationKind};
use crate::types::{BoundKind, Tightening, Variable};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisjunctionConstraint {
    disjuncts: Vec<PieceSplit>,
    /// Disjuncts ruled out by the bounds seen so far. Never shrinks except
    /// through restore_state.
    infeasible: Vec<bool>,
    bounds: WatchedBounds,
    obsolete: bool,
}

impl DisjunctionConstraint {
    pub fn new(disjuncts: Vec<PieceSplit>) -> Self {
        assert!(!disjuncts.is_empty(), "disjunction requires disjuncts");
        let infeasible = vec![false; disjuncts.len()];
        Self {
            disjuncts,
            infeasible,
            bounds: WatchedBounds::default(),
            obsolete: false,
        }
    }

    pub fn disjuncts(&self) -> &[PieceSplit] {
        &self.disjuncts
    }

    pub fn feasible_disjuncts(&self) -> Vec<usize> {
        (0..self.disjuncts.len())
            .filter(|&i| !self.infeasible[i])
            .collect()
    }

    fn refresh_feasibility(&mut self) {
        for (i, disjunct) in self.disjuncts.iter().enumerate() {
            if self.infeasible[i] {
                continue;
            }
            for t in &disjunct.tightenings {
                let contradicted = match t.kind {
                    // Requiring v <= x is impossible once lb(v) > x.
                    BoundKind::Upper => self.bounds.lower(t.variable) > t.value + COMPARISON_EPSILON,
                    BoundKind::Lower => self.bounds.upper(t.variable) < t.value - COMPARISON_EPSILON,
                };
                if contradicted {
                    self.infeasible[i] = true;
                    break;
                }
            }
        }
    }

    pub(crate) fn parse_line(parts: &[&str]) -> VfResult<Self> {
        fn next<'a>(parts: &[&'a str], cursor: &mut usize, what: &str) -> VfResult<&'a str> {
            let token = parts
                .get(*cursor)
                .copied()
                .ok_or_else(|| VfError::ParseError(format!("disj: missing {what}")))?;
            *cursor += 1;
            Ok(token)
        }

        let mut cursor = 0usize;
        let mut next = |what: &str| next(parts, &mut cursor, what);

        let num_disjuncts: usize = next("disjunct count")?
            .parse()
            .map_err(|_| VfError::ParseError("disj: bad disjunct count".into()))?;
        let mut disjuncts = Vec::with_capacity(num_disjuncts);
        for _ in 0..num_disjuncts {
            let mut split = PieceSplit::new();
            let num_bounds: usize = next("bound count")?
                .parse()
                .map_err(|_| VfError::ParseError("disj: bad bound count".into()))?;
            for _ in 0..num_bounds {
                let variable = parse_variable(next("bound variable")?)?;
                let kind = match next("bound kind")? {
                    "l" => BoundKind::Lower,
                    "u" => BoundKind::Upper,
                    other => {
                        return Err(VfError::ParseError(format!(
                            "disj: bad bound kind `{other}`"
                        )))
                    }
                };
                let value = parse_scalar(next("bound value")?)?;
                split.tightenings.push(Tightening {
                    variable,
                    value,
                    kind,
                });
            }
            let num_equations: usize = next("equation count")?
                .parse()
                .map_err(|_| VfError::ParseError("disj: bad equation count".into()))?;
            for _ in 0..num_equations {
                let tag: i64 = next("equation type")?
                    .parse()
                    .map_err(|_| VfError::ParseError("disj: bad equation type".into()))?;
                let kind = EquationKind::from_tag(tag)?;
                let scalar = parse_scalar(next("equation scalar")?)?;
                let num_addends: usize = next("addend count")?
                    .parse()
                    .map_err(|_| VfError::ParseError("disj: bad addend count".into()))?;
                let mut eq = Equation::new(kind);
                eq.set_scalar(scalar);
                for _ in 0..num_addends {
                    let variable = parse_variable(next("addend variable")?)?;
                    let coefficient = parse_scalar(next("addend coefficient")?)?;
                    eq.add_addend(coefficient, variable);
                }
                split.equations.push(eq);
            }
            disjuncts.push(split);
        }
        Ok(Self::new(disjuncts))
    }
}

#[typetag::serde]
impl PiecewiseConstraint for DisjunctionConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Disjunction
    }

    fn participating_variables(&self) -> Vec<Variable> {
        let mut vars: Vec<Variable> = Vec::new();
        for disjunct in &self.disjuncts {
            for t in &disjunct.tightenings {
                vars.push(t.variable);
            }
            for eq in &disjunct.equations {
                vars.extend(eq.participating_variables());
            }
        }
        vars.sort_unstable();
        vars.dedup();
        vars
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore_state(&mut self, other: &dyn PiecewiseConstraint) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .expect("restore_state requires a disjunction");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        if self.bounds.update_lower(variable, bound) {
            self.refresh_feasibility();
        }
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        if self.bounds.update_upper(variable, bound) {
            self.refresh_feasibility();
        }
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        // With a single surviving disjunct its tightenings hold outright.
        let feasible = self.feasible_disjuncts();
        if feasible.len() == 1 {
            out.extend(self.disjuncts[feasible[0]].tightenings.iter().copied());
        }
    }

    fn phase(&self) -> Phase {
        let feasible = self.feasible_disjuncts();
        if feasible.len() == 1 {
            Phase::Case(feasible[0])
        } else {
            Phase::NotFixed
        }
    }

    fn all_cases(&self) -> Vec<Phase> {
        (0..self.disjuncts.len()).map(Phase::Case).collect()
    }

    fn case_split(&self, phase: Phase) -> Option<PieceSplit> {
        match phase {
            Phase::Case(i) => self.disjuncts.get(i).cloned(),
            _ => None,
        }
    }

    fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
        self.obsolete = true;
    }

    fn update_variable_index(&mut self, old: Variable, new: Variable) {
        for disjunct in self.disjuncts.iter_mut() {
            for t in disjunct.tightenings.iter_mut() {
                if t.variable == old {
                    t.variable = new;
                }
            }
            for eq in disjunct.equations.iter_mut() {
                eq.update_variable_index(old, new);
            }
        }
        self.bounds.rename(old, new);
    }

    fn is_obsolete(&self) -> bool {
        self.obsolete
    }

    fn serialize_line(&self) -> String {
        let mut line = format!("disj,{}", self.disjuncts.len());
        for disjunct in &self.disjuncts {
            let _ = write!(line, ",{}", disjunct.tightenings.len());
            for t in &disjunct.tightenings {
                let kind = match t.kind {
                    BoundKind::Lower => "l",
                    BoundKind::Upper => "u",
                };
                let _ = write!(line, ",{},{},{}", t.variable, kind, t.value);
            }
            let _ = write!(line, ",{}", disjunct.equations.len());
            for eq in &disjunct.equations {
                let _ = write!(line, ",{},{},{}", eq.kind().tag(), eq.scalar(), eq.num_addends());
                for (variable, coefficient) in eq.addends() {
                    let _ = write!(line, ",{variable},{coefficient}");
                }
            }
        }
        line
    }
}
