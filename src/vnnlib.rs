//! Parser for the restricted VNN-LIB property subset: `declare-const X_i /
//! Y_i Real`, `assert` over `<=` / `>=` with `+`, `-`, `(* constant
//! variable)` terms, `and`, and a top-level `or` that compiles to a
//! disjunction constraint.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use tracing::debug;

use crate::constraints::{DisjunctionConstraint, PieceSplit};
use crate::query::{Equation, EquationKind, Query};
use crate::types::{BoundKind, Tightening, Variable};

/// A parsed linear term: coefficients plus a constant offset.
#[derive(Debug, Clone, Default)]
struct LinearTerm {
    coefficients: BTreeMap<Variable, f64>,
    constant: f64,
}

impl LinearTerm {
    fn constant(value: f64) -> Self {
        Self {
            coefficients: BTreeMap::new(),
            constant: value,
        }
    }

    fn variable(variable: Variable) -> Self {
        let mut term = Self::default();
        term.coefficients.insert(variable, 1.0);
        term
    }

    fn add(&mut self, other: &LinearTerm) {
        for (&variable, &coefficient) in &other.coefficients {
            *self.coefficients.entry(variable).or_insert(0.0) += coefficient;
        }
        self.constant += other.constant;
    }

    fn subtract(&mut self, other: &LinearTerm) {
        for (&variable, &coefficient) in &other.coefficients {
            *self.coefficients.entry(variable).or_insert(0.0) -= coefficient;
        }
        self.constant -= other.constant;
    }

    fn scale(&mut self, factor: f64) {
        for coefficient in self.coefficients.values_mut() {
            *coefficient *= factor;
        }
        self.constant *= factor;
    }

    fn single_variable(&self) -> Option<(Variable, f64)> {
        let mut nonzero = self.coefficients.iter().filter(|(_, &c)| c != 0.0);
        let (&variable, &coefficient) = nonzero.next()?;
        nonzero.next().is_none().then_some((variable, coefficient))
    }
}

/// One conjunct of a property: a bound on a single variable, or a general
/// linear condition.
#[derive(Debug, Clone)]
enum Assertion {
    Bound(Tightening),
    Linear(Equation),
}

#[derive(Debug)]
enum Condition {
    Conjunction(Vec<Assertion>),
    Disjunction(Vec<Vec<Assertion>>),
}

fn tokenize(content: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = content.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ';' => {
                // Comment to end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '(' | ')' | '+' | '*' => {
                tokens.push(c.to_string());
                chars.next();
            }
            '<' | '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(format!("{c}="));
                } else {
                    tokens.push(c.to_string());
                }
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                // A symbol or a (possibly negative) literal; a lone '-' is
                // the arithmetic operator.
                let mut symbol = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                        symbol.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if symbol.is_empty() {
                    // Unknown character; emit it alone and let parsing reject it.
                    symbol.push(c);
                    chars.next();
                }
                tokens.push(symbol);
            }
        }
    }
    tokens
}

struct Parser<'a> {
    tokens: Vec<String>,
    query: &'a mut Query,
}

impl<'a> Parser<'a> {
    fn token(&self, pos: usize) -> Result<&str> {
        self.tokens
            .get(pos)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("unexpected end of property file"))
    }

    fn expect(&self, pos: usize, expected: &str) -> Result<usize> {
        let token = self.token(pos)?;
        if token != expected {
            bail!("expected `{expected}`, got `{token}`");
        }
        Ok(pos + 1)
    }

    fn resolve_variable(&self, name: &str) -> Result<Variable> {
        if let Some(index) = name.strip_prefix("X_") {
            let index: usize = index.parse().map_err(|_| anyhow!("bad input index {name}"))?;
            return self
                .query
                .input_variable_by_index(index)
                .ok_or_else(|| anyhow!("unknown input variable {name}"));
        }
        if let Some(index) = name.strip_prefix("Y_") {
            let index: usize = index
                .parse()
                .map_err(|_| anyhow!("bad output index {name}"))?;
            return self
                .query
                .output_variable_by_index(index)
                .ok_or_else(|| anyhow!("unknown output variable {name}"));
        }
        bail!("unknown variable `{name}`")
    }

    fn parse_script(&mut self) -> Result<()> {
        let mut pos = 0;
        while pos < self.tokens.len() {
            pos = self.expect(pos, "(")?;
            pos = self.parse_command(pos)?;
            pos = self.expect(pos, ")")?;
        }
        Ok(())
    }

    fn parse_command(&mut self, pos: usize) -> Result<usize> {
        match self.token(pos)? {
            "declare-const" => self.parse_declare_const(pos + 1),
            "assert" => self.parse_assert(pos + 1),
            other => bail!("unsupported command `{other}`"),
        }
    }

    fn parse_declare_const(&mut self, pos: usize) -> Result<usize> {
        let name = self.token(pos)?.to_string();
        let sort = self.token(pos + 1)?;
        if sort != "Real" {
            bail!("unsupported sort `{sort}` for `{name}`");
        }
        // The declaration must refer to a marked input or output.
        self.resolve_variable(&name)?;
        debug!(name = %name, "declared property variable");
        Ok(pos + 2)
    }

    fn parse_assert(&mut self, pos: usize) -> Result<usize> {
        let (condition, pos) = self.parse_condition(pos)?;
        match condition {
            Condition::Conjunction(assertions) => {
                for assertion in assertions {
                    self.apply_assertion(assertion)?;
                }
            }
            Condition::Disjunction(disjuncts) => {
                let splits: Vec<PieceSplit> = disjuncts
                    .into_iter()
                    .map(|assertions| {
                        let mut split = PieceSplit::new();
                        for assertion in assertions {
                            match assertion {
                                Assertion::Bound(t) => split.tightenings.push(t),
                                Assertion::Linear(eq) => split.equations.push(eq),
                            }
                        }
                        split
                    })
                    .collect();
                self.query
                    .add_piecewise(Box::new(DisjunctionConstraint::new(splits)));
            }
        }
        Ok(pos)
    }

    fn apply_assertion(&mut self, assertion: Assertion) -> Result<()> {
        match assertion {
            Assertion::Bound(t) => {
                match t.kind {
                    BoundKind::Lower => self.query.tighten_lower(t.variable, t.value)?,
                    BoundKind::Upper => self.query.tighten_upper(t.variable, t.value)?,
                };
            }
            Assertion::Linear(eq) => self.query.add_equation(eq),
        }
        Ok(())
    }

    fn parse_condition(&mut self, pos: usize) -> Result<(Condition, usize)> {
        let mut pos = self.expect(pos, "(")?;
        let op = self.token(pos)?.to_string();
        pos += 1;
        match op.as_str() {
            "<=" | ">=" => {
                let (lhs, next) = self.parse_term(pos)?;
                let (rhs, next) = self.parse_term(next)?;
                let next = self.expect(next, ")")?;
                let assertion = self.build_assertion(&op, lhs, rhs)?;
                Ok((Condition::Conjunction(vec![assertion]), next))
            }
            "and" => {
                let mut assertions = Vec::new();
                while self.token(pos)? != ")" {
                    let (condition, next) = self.parse_condition(pos)?;
                    match condition {
                        Condition::Conjunction(inner) => assertions.extend(inner),
                        Condition::Disjunction(_) => bail!("`or` must appear at the top level"),
                    }
                    pos = next;
                }
                Ok((Condition::Conjunction(assertions), pos + 1))
            }
            "or" => {
                let mut disjuncts = Vec::new();
                while self.token(pos)? != ")" {
                    let (condition, next) = self.parse_condition(pos)?;
                    match condition {
                        Condition::Conjunction(inner) => disjuncts.push(inner),
                        Condition::Disjunction(_) => bail!("nested `or` is not supported"),
                    }
                    pos = next;
                }
                Ok((Condition::Disjunction(disjuncts), pos + 1))
            }
            other => bail!("unsupported operator `{other}`"),
        }
    }

    fn parse_term(&mut self, pos: usize) -> Result<(LinearTerm, usize)> {
        let token = self.token(pos)?.to_string();
        if token != "(" {
            return Ok((self.parse_symbol(&token)?, pos + 1));
        }

        let mut pos = pos + 1;
        let op = self.token(pos)?.to_string();
        pos += 1;
        let mut args = Vec::new();
        while self.token(pos)? != ")" {
            let (term, next) = self.parse_term(pos)?;
            args.push(term);
            pos = next;
        }
        pos += 1;

        let term = match op.as_str() {
            "+" => {
                let mut sum = LinearTerm::default();
                for arg in &args {
                    sum.add(arg);
                }
                sum
            }
            "-" => {
                let mut iter = args.iter();
                let first = iter
                    .next()
                    .ok_or_else(|| anyhow!("`-` requires at least one argument"))?;
                if args.len() == 1 {
                    let mut negated = LinearTerm::default();
                    negated.subtract(first);
                    negated
                } else {
                    let mut difference = first.clone();
                    for arg in iter {
                        difference.subtract(arg);
                    }
                    difference
                }
            }
            "*" => {
                if args.len() != 2 {
                    bail!("`*` requires exactly two arguments");
                }
                let (constant, variable) = match (
                    args[0].coefficients.is_empty(),
                    args[1].coefficients.is_empty(),
                ) {
                    (true, false) => (args[0].constant, args[1].clone()),
                    (false, true) => (args[1].constant, args[0].clone()),
                    (true, true) => {
                        return Ok((
                            LinearTerm::constant(args[0].constant * args[1].constant),
                            pos,
                        ))
                    }
                    (false, false) => bail!("`*` supports only constant times variable"),
                };
                let mut scaled = variable;
                scaled.scale(constant);
                scaled
            }
            other => bail!("unsupported term operator `{other}`"),
        };
        Ok((term, pos))
    }

    fn parse_symbol(&self, token: &str) -> Result<LinearTerm> {
        if token.starts_with("X_") || token.starts_with("Y_") {
            Ok(LinearTerm::variable(self.resolve_variable(token)?))
        } else {
            let value: f64 = token
                .parse()
                .map_err(|_| anyhow!("`{token}` is not a scalar"))?;
            Ok(LinearTerm::constant(value))
        }
    }

    /// Normalizes `lhs op rhs` into a bound (single variable against a
    /// constant) or a linear condition.
    fn build_assertion(&self, op: &str, lhs: LinearTerm, rhs: LinearTerm) -> Result<Assertion> {
        let mut difference = lhs;
        difference.subtract(&rhs);

        // difference <= -constant (for <=) over the variable part.
        let scalar = -difference.constant;
        let upper = op == "<=";

        if let Some((variable, coefficient)) = difference.single_variable() {
            let value = scalar / coefficient;
            let upper = if coefficient > 0.0 { upper } else { !upper };
            let tightening = if upper {
                Tightening::upper(variable, value)
            } else {
                Tightening::lower(variable, value)
            };
            return Ok(Assertion::Bound(tightening));
        }

        if difference.coefficients.values().all(|&c| c == 0.0) {
            bail!("assertion contains no variables");
        }

        let kind = if upper {
            EquationKind::LessEq
        } else {
            EquationKind::GreaterEq
        };
        let mut equation = Equation::new(kind);
        equation.set_scalar(scalar);
        for (variable, coefficient) in difference.coefficients {
            if coefficient != 0.0 {
                equation.add_addend(coefficient, variable);
            }
        }
        Ok(Assertion::Linear(equation))
    }
}

/// Parses a property text and applies it to the query. Variables `X_i` and
/// `Y_i` map onto the query's marked input and output variables.
pub fn parse_property_text(content: &str, query: &mut Query) -> Result<()> {
    let tokens = tokenize(content);
    let mut parser = Parser { tokens, query };
    parser.parse_script()
}

pub fn parse_property_file<P: AsRef<Path>>(path: P, query: &mut Query) -> Result<()> {
    let content = fs::read_to_string(path)?;
    parse_property_text(&content, query)
}
