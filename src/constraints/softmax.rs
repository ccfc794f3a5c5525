//! y_i = e^(x_i) / sum_j e^(x_j) over a group of k inputs and k outputs.
//! Smooth; the shared exponential helpers here also feed the layer envelopes.

use std::any::Any;

use serde::{Deserialize, Serialize};

use super::{
    join_variables, parse_variable, ConstraintKind, Phase, PiecewiseConstraint, WatchedBounds,
};
use crate::errors::{VfError, VfResult};
use crate::types::{Tightening, Variable};

/// Numerically stable softmax of `input` into a fresh vector.
pub fn softmax(input: &[f64]) -> Vec<f64> {
    let max = input.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = input.iter().map(|&x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Shifts every component of `input` down by `value`.
pub fn x_tilda(input: &[f64], value: f64) -> Vec<f64> {
    input.iter().map(|&x| x - value).collect()
}

pub fn sum_of_exponential(input: &[f64]) -> f64 {
    input.iter().map(|&x| x.exp()).sum()
}

pub fn log_sum_of_exponential(input: &[f64]) -> f64 {
    sum_of_exponential(input).ln()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxConstraint {
    inputs: Vec<Variable>,
    outputs: Vec<Variable>,
    bounds: WatchedBounds,
    have_eliminated_variables: bool,
}

impl SoftmaxConstraint {
    pub fn new(inputs: Vec<Variable>, outputs: Vec<Variable>) -> Self {
        assert_eq!(
            inputs.len(),
            outputs.len(),
            "softmax requires matching input/output arity"
        );
        assert!(!inputs.is_empty(), "softmax requires at least one input");
        Self {
            inputs,
            outputs,
            bounds: WatchedBounds::default(),
            have_eliminated_variables: false,
        }
    }

    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }

    /// The output paired with the given input variable.
    pub fn output_for_input(&self, input: Variable) -> Option<Variable> {
        self.inputs
            .iter()
            .position(|&v| v == input)
            .map(|i| self.outputs[i])
    }

    pub(crate) fn parse_line(parts: &[&str]) -> VfResult<Self> {
        let separator = parts.iter().position(|&t| t == "sep").ok_or_else(|| {
            VfError::ParseError("softmax: missing input/output separator".into())
        })?;
        let inputs = parts[..separator]
            .iter()
            .map(|t| parse_variable(t))
            .collect::<VfResult<Vec<_>>>()?;
        let outputs = parts[separator + 1..]
            .iter()
            .map(|t| parse_variable(t))
            .collect::<VfResult<Vec<_>>>()?;
        if inputs.len() != outputs.len() || inputs.is_empty() {
            return Err(VfError::ParseError(
                "softmax: input/output arity mismatch".into(),
            ));
        }
        Ok(Self::new(inputs, outputs))
    }
}

#[typetag::serde]
impl PiecewiseConstraint for SoftmaxConstraint {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Softmax
    }

    fn participating_variables(&self) -> Vec<Variable> {
        let mut vars = self.inputs.clone();
        vars.extend_from_slice(&self.outputs);
        vars
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn restore_state(&mut self, other: &dyn PiecewiseConstraint) {
        let other = other
            .as_any()
            .downcast_ref::<Self>()
            .expect("restore_state requires a softmax");
        *self = other.clone();
    }

    fn notify_lower_bound(&mut self, variable: Variable, bound: f64) {
        self.bounds.update_lower(variable, bound);
    }

    fn notify_upper_bound(&mut self, variable: Variable, bound: f64) {
        self.bounds.update_upper(variable, bound);
    }

    fn entailed_tightenings(&self, out: &mut Vec<Tightening>) {
        for &output in &self.outputs {
            out.push(Tightening::lower(output, 0.0));
            out.push(Tightening::upper(output, 1.0));
        }
    }

    fn phase(&self) -> Phase {
        Phase::NotFixed
    }

    fn eliminate_variable(&mut self, _variable: Variable, _value: f64) {
        self.have_eliminated_variables = true;
    }

    fn update_variable_index(&mut self, old: Variable, new: Variable) {
        for v in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if *v == old {
                *v = new;
            }
        }
        self.bounds.rename(old, new);
    }

    fn is_obsolete(&self) -> bool {
        self.have_eliminated_variables
    }

    fn serialize_line(&self) -> String {
        let mut line = String::from("softmax");
        join_variables(&mut line, &self.inputs);
        line.push_str(",sep");
        join_variables(&mut line, &self.outputs);
        line
    }
}
