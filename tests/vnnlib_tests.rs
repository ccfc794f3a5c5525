use veriflow::constraints::{ConstraintKind, DisjunctionConstraint};
use veriflow::vnnlib::parse_property_text;
use veriflow::{BoundKind, EquationKind, Query};

/// A query shaped like a loaded network: two inputs, two outputs.
fn build_query() -> Query {
    let mut query = Query::new();
    query.set_num_variables(4);
    query.mark_input(0, 0);
    query.mark_input(1, 1);
    query.mark_output(2, 0);
    query.mark_output(3, 1);
    query
}

#[test]
fn test_bound_asserts_become_bounds() {
    let mut query = build_query();
    let property = "\
; perturbation box
(declare-const X_0 Real)
(declare-const X_1 Real)
(declare-const Y_0 Real)
(assert (<= X_0 0.5))
(assert (>= X_0 -0.5))
(assert (<= X_1 0.25))
(assert (>= Y_0 0.1))
";
    parse_property_text(property, &mut query).unwrap();

    assert_eq!(query.upper_bound(0).unwrap(), 0.5);
    assert_eq!(query.lower_bound(0).unwrap(), -0.5);
    assert_eq!(query.upper_bound(1).unwrap(), 0.25);
    assert_eq!(query.lower_bound(2).unwrap(), 0.1);
}

#[test]
fn test_scaled_and_reversed_bounds() {
    let mut query = build_query();
    // 2*x0 <= 1 is the bound x0 <= 0.5; -x0 <= 1 is the bound x0 >= -1.
    let property = "\
(assert (<= (* 2.0 X_0) 1.0))
(assert (<= (* -1.0 X_0) 1.0))
";
    parse_property_text(property, &mut query).unwrap();
    assert_eq!(query.upper_bound(0).unwrap(), 0.5);
    assert_eq!(query.lower_bound(0).unwrap(), -1.0);
}

#[test]
fn test_linear_asserts_become_equations() {
    let mut query = build_query();
    // y0 - y1 <= 0, i.e. the adversarial "output 0 does not win".
    let property = "(assert (<= (- Y_0 Y_1) 0.0))";
    parse_property_text(property, &mut query).unwrap();

    assert_eq!(query.num_equations(), 1);
    let eq = &query.equations()[0];
    assert_eq!(eq.kind(), EquationKind::LessEq);
    assert_eq!(eq.coefficient(2), 1.0);
    assert_eq!(eq.coefficient(3), -1.0);
    assert_eq!(eq.scalar(), 0.0);
}

#[test]
fn test_sum_terms() {
    let mut query = build_query();
    // x0 + x1 >= 0.2 as a general linear condition.
    let property = "(assert (>= (+ X_0 X_1) 0.2))";
    parse_property_text(property, &mut query).unwrap();

    let eq = &query.equations()[0];
    assert_eq!(eq.kind(), EquationKind::GreaterEq);
    assert_eq!(eq.coefficient(0), 1.0);
    assert_eq!(eq.coefficient(1), 1.0);
    assert!((eq.scalar() - 0.2).abs() < 1e-12);
}

#[test]
fn test_top_level_or_compiles_to_disjunction() {
    let mut query = build_query();
    let property = "\
(assert (or
    (and (<= Y_0 0.1) (>= X_0 0.0))
    (and (>= Y_0 0.9))
))
";
    parse_property_text(property, &mut query).unwrap();

    assert_eq!(query.piecewise_constraints().len(), 1);
    let constraint = &query.piecewise_constraints()[0];
    assert_eq!(constraint.kind(), ConstraintKind::Disjunction);

    let disj = constraint
        .as_any()
        .downcast_ref::<DisjunctionConstraint>()
        .unwrap();
    assert_eq!(disj.disjuncts().len(), 2);

    let first = &disj.disjuncts()[0];
    assert_eq!(first.tightenings.len(), 2);
    assert_eq!(first.tightenings[0].variable, 2);
    assert_eq!(first.tightenings[0].kind, BoundKind::Upper);
    assert_eq!(first.tightenings[1].variable, 0);
    assert_eq!(first.tightenings[1].kind, BoundKind::Lower);

    let second = &disj.disjuncts()[1];
    assert_eq!(second.tightenings.len(), 1);
    assert_eq!(second.tightenings[0].value, 0.9);
}

#[test]
fn test_or_with_linear_disjuncts() {
    let mut query = build_query();
    let property = "(assert (or (<= (- Y_0 Y_1) 0.0) (>= X_0 0.5)))";
    parse_property_text(property, &mut query).unwrap();

    let disj = query.piecewise_constraints()[0]
        .as_any()
        .downcast_ref::<DisjunctionConstraint>()
        .unwrap();
    assert_eq!(disj.disjuncts().len(), 2);
    assert_eq!(disj.disjuncts()[0].equations.len(), 1);
    assert_eq!(disj.disjuncts()[1].tightenings.len(), 1);
}

#[test]
fn test_unknown_variable_is_rejected() {
    let mut query = build_query();
    assert!(parse_property_text("(assert (<= X_9 1.0))", &mut query).is_err());
    assert!(parse_property_text("(declare-const Z_0 Real)", &mut query).is_err());
}

#[test]
fn test_declarations_require_real_sort() {
    let mut query = build_query();
    assert!(parse_property_text("(declare-const X_0 Int)", &mut query).is_err());
    assert!(parse_property_text("(declare-const X_0 Real)", &mut query).is_ok());
}
