//! Line-oriented ASCII persistence of queries, and the SAT assignment export.
//!
//! Layout: five counts (variables, lower bounds, upper bounds, equations,
//! non-linear constraints), the input and output markings, the stored bounds
//! at ten decimal digits, the equations, then one line per constraint.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::{Equation, EquationKind, Query};
use crate::constraints::{deserialize_line, ConstraintKind};
use crate::errors::{VfError, VfResult};

fn parse_usize(token: &str, what: &str) -> VfResult<usize> {
    token
        .trim()
        .parse::<usize>()
        .map_err(|_| VfError::ParseError(format!("{what}: expected an integer, got `{token}`")))
}

fn parse_f64(token: &str, what: &str) -> VfResult<f64> {
    token
        .trim()
        .parse::<f64>()
        .map_err(|_| VfError::ParseError(format!("{what}: expected a number, got `{token}`")))
}

impl Query {
    /// Writes the query in the persisted ASCII format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VfResult<()> {
        let mut out = String::new();

        let num_constraints =
            self.piecewise_constraints().len() + self.nonlinear_constraints().len();
        let _ = writeln!(out, "{}", self.num_variables());
        let _ = writeln!(out, "{}", self.bounds().stored_lower_bounds().len());
        let _ = writeln!(out, "{}", self.bounds().stored_upper_bounds().len());
        let _ = writeln!(out, "{}", self.num_equations());
        let _ = writeln!(out, "{num_constraints}");

        let _ = writeln!(out, "{}", self.num_input_variables());
        for (index, variable) in self.input_markings() {
            let _ = writeln!(out, "{index},{variable}");
        }
        let _ = writeln!(out, "{}", self.num_output_variables());
        for (index, variable) in self.output_markings() {
            let _ = writeln!(out, "{index},{variable}");
        }

        for (variable, bound) in self.bounds().stored_lower_bounds() {
            let _ = writeln!(out, "{variable},{bound:.10}");
        }
        for (variable, bound) in self.bounds().stored_upper_bounds() {
            let _ = writeln!(out, "{variable},{bound:.10}");
        }

        for (i, equation) in self.equations().iter().enumerate() {
            let _ = write!(
                out,
                "{i},{},{:.10}",
                equation.kind().tag(),
                equation.scalar()
            );
            for (variable, coefficient) in equation.addends() {
                let _ = write!(out, ",{variable},{coefficient:.10}");
            }
            out.push('\n');
        }

        let constraints = self
            .piecewise_constraints()
            .iter()
            .chain(self.nonlinear_constraints().iter());
        for (i, constraint) in constraints.enumerate() {
            let _ = writeln!(out, "{i},{}", constraint.serialize_line());
        }

        fs::write(path, out)?;
        Ok(())
    }

    /// Reads a query back from the persisted ASCII format.
    pub fn load<P: AsRef<Path>>(path: P) -> VfResult<Query> {
        fn take<'a>(lines: &[&'a str], cursor: &mut usize, what: &str) -> VfResult<&'a str> {
            let line = lines.get(*cursor).copied().ok_or_else(|| {
                VfError::ParseError(format!("unexpected end of query file ({what})"))
            })?;
            *cursor += 1;
            Ok(line)
        }

        let content = fs::read_to_string(path)?;
        let lines: Vec<&str> = content.lines().collect();
        let mut cursor = 0usize;
        let mut next_line = |what: &str| take(&lines, &mut cursor, what);

        let num_variables = parse_usize(next_line("numVariables")?, "numVariables")?;
        let num_lower = parse_usize(next_line("numLowerBounds")?, "numLowerBounds")?;
        let num_upper = parse_usize(next_line("numUpperBounds")?, "numUpperBounds")?;
        let num_equations = parse_usize(next_line("numEquations")?, "numEquations")?;
        let num_constraints = parse_usize(next_line("numConstraints")?, "numConstraints")?;

        debug!(
            num_variables,
            num_lower, num_upper, num_equations, num_constraints, "loading query"
        );

        let mut query = Query::new();
        query.set_num_variables(num_variables);

        let num_inputs = parse_usize(next_line("numInputVariables")?, "numInputVariables")?;
        for _ in 0..num_inputs {
            let line = next_line("input variable")?;
            let (index, variable) = line
                .split_once(',')
                .ok_or_else(|| VfError::ParseError(format!("bad input marking `{line}`")))?;
            query.mark_input(
                parse_usize(variable, "input variable")?,
                parse_usize(index, "input index")?,
            );
        }

        let num_outputs = parse_usize(next_line("numOutputVariables")?, "numOutputVariables")?;
        for _ in 0..num_outputs {
            let line = next_line("output variable")?;
            let (index, variable) = line
                .split_once(',')
                .ok_or_else(|| VfError::ParseError(format!("bad output marking `{line}`")))?;
            query.mark_output(
                parse_usize(variable, "output variable")?,
                parse_usize(index, "output index")?,
            );
        }

        for _ in 0..num_lower {
            let line = next_line("lower bound")?;
            let (variable, bound) = line
                .split_once(',')
                .ok_or_else(|| VfError::ParseError(format!("bad lower bound `{line}`")))?;
            query.set_lower(
                parse_usize(variable, "bound variable")?,
                parse_f64(bound, "lower bound")?,
            )?;
        }
        for _ in 0..num_upper {
            let line = next_line("upper bound")?;
            let (variable, bound) = line
                .split_once(',')
                .ok_or_else(|| VfError::ParseError(format!("bad upper bound `{line}`")))?;
            query.set_upper(
                parse_usize(variable, "bound variable")?,
                parse_f64(bound, "upper bound")?,
            )?;
        }

        for _ in 0..num_equations {
            let line = next_line("equation")?;
            let tokens: Vec<&str> = line.split(',').collect();
            if tokens.len() < 3 || tokens.len() % 2 == 0 {
                return Err(VfError::ParseError(format!("bad equation line `{line}`")));
            }
            let kind = EquationKind::from_tag(tokens[1].trim().parse::<i64>().map_err(|_| {
                VfError::ParseError(format!("bad equation type `{}`", tokens[1]))
            })?)?;
            let mut equation = Equation::new(kind);
            equation.set_scalar(parse_f64(tokens[2], "equation scalar")?);
            for pair in tokens[3..].chunks(2) {
                let variable = parse_usize(pair[0], "addend variable")?;
                let coefficient = parse_f64(pair[1], "addend coefficient")?;
                equation.add_addend(coefficient, variable);
            }
            query.add_equation(equation);
        }

        for _ in 0..num_constraints {
            let line = next_line("constraint")?;
            let (_index, serialized) = line
                .split_once(',')
                .ok_or_else(|| VfError::ParseError(format!("bad constraint line `{line}`")))?;
            let constraint = deserialize_line(serialized)?;
            match constraint.kind() {
                ConstraintKind::Relu
                | ConstraintKind::LeakyRelu
                | ConstraintKind::Sign
                | ConstraintKind::AbsoluteValue
                | ConstraintKind::Max
                | ConstraintKind::Disjunction => query.add_piecewise(constraint),
                ConstraintKind::Softmax => {
                    // The encoding implies the outputs sum to one. Skip the
                    // equation when an identical one is already present so
                    // that save/load round-trips exactly.
                    let softmax = constraint
                        .as_any()
                        .downcast_ref::<crate::constraints::SoftmaxConstraint>()
                        .expect("kind() said softmax");
                    let mut sum = Equation::new(EquationKind::Equality);
                    for &output in softmax.outputs() {
                        sum.add_addend(1.0, output);
                    }
                    sum.set_scalar(1.0);
                    if !query.equations().contains(&sum) {
                        query.add_equation(sum);
                    }
                    query.add_nonlinear(constraint);
                }
                ConstraintKind::Round | ConstraintKind::Sigmoid | ConstraintKind::Bilinear => {
                    query.add_nonlinear(constraint)
                }
            }
        }

        Ok(query)
    }

    /// JSON snapshot of the whole query, constraints included. Unlike the
    /// line-oriented format this preserves full floating-point precision.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> VfResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VfError::ParseError(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> VfResult<Query> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| VfError::ParseError(e.to_string()))
    }

    /// Writes the satisfying assignment: the variable count, then one
    /// `index,value` line per variable.
    pub fn export_solution<P: AsRef<Path>>(&self, path: P) -> VfResult<()> {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.num_variables());
        for variable in 0..self.num_variables() {
            let value = self.solution_value(variable)?;
            let _ = writeln!(out, "{variable},{value:.6}");
        }
        fs::write(path, out)?;
        Ok(())
    }
}
