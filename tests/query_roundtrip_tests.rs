use std::path::PathBuf;

use veriflow::constraints::{
    PiecewiseConstraint, ReluConstraint, SigmoidConstraint, SoftmaxConstraint,
};
use veriflow::{Equation, EquationKind, Query, VfError};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("veriflow_{}_{}", std::process::id(), name))
}

/// A small two-hidden-layer query: one input, two ReLUs, two sigmoids, one
/// output.
fn build_query() -> Query {
    let mut query = Query::new();
    query.set_num_variables(10);

    query.mark_input(0, 0);
    query.set_lower(0, 0.0).unwrap();
    query.set_upper(0, 1.0).unwrap();

    query.set_lower(3, 0.0).unwrap();
    query.set_lower(4, 0.0).unwrap();
    query.set_lower(7, 0.0).unwrap();
    query.set_lower(8, 0.0).unwrap();

    query.mark_output(9, 0);
    query.set_upper(9, 3.0).unwrap();

    let mut eq0 = Equation::new(EquationKind::Equality);
    eq0.add_addend(-1.0, 1);
    eq0.add_addend(1.0, 0);
    eq0.set_scalar(0.5);
    query.add_equation(eq0);

    let mut eq1 = Equation::new(EquationKind::Equality);
    eq1.add_addend(-1.0, 2);
    eq1.add_addend(-1.0, 0);
    eq1.set_scalar(-0.5);
    query.add_equation(eq1);

    query.add_piecewise(Box::new(ReluConstraint::new(1, 3)));
    query.add_piecewise(Box::new(ReluConstraint::new(2, 4)));

    let mut eq2 = Equation::new(EquationKind::Equality);
    eq2.add_addend(-1.0, 5);
    eq2.add_addend(-1.0, 3);
    eq2.add_addend(1.0, 4);
    eq2.set_scalar(0.5);
    query.add_equation(eq2);

    let mut eq3 = Equation::new(EquationKind::Equality);
    eq3.add_addend(-1.0, 6);
    eq3.add_addend(-1.0, 3);
    eq3.add_addend(1.0, 4);
    eq3.set_scalar(0.5);
    query.add_equation(eq3);

    query.add_nonlinear(Box::new(SigmoidConstraint::new(5, 7)));
    query.add_nonlinear(Box::new(SigmoidConstraint::new(6, 8)));

    let mut eq4 = Equation::new(EquationKind::Equality);
    eq4.add_addend(-1.0, 9);
    eq4.add_addend(-1.0, 7);
    eq4.add_addend(1.0, 8);
    eq4.set_scalar(0.0);
    query.add_equation(eq4);

    query
}

fn assert_queries_equal(a: &Query, b: &Query) {
    assert_eq!(a.num_variables(), b.num_variables());
    assert_eq!(a.bounds(), b.bounds());
    assert_eq!(a.equations(), b.equations());
    assert_eq!(a.num_input_variables(), b.num_input_variables());
    assert_eq!(a.num_output_variables(), b.num_output_variables());
    for index in 0..a.num_input_variables() {
        assert_eq!(
            a.input_variable_by_index(index),
            b.input_variable_by_index(index)
        );
    }
    for index in 0..a.num_output_variables() {
        assert_eq!(
            a.output_variable_by_index(index),
            b.output_variable_by_index(index)
        );
    }

    let lines = |constraints: &[Box<dyn PiecewiseConstraint>]| -> Vec<String> {
        constraints.iter().map(|c| c.serialize_line()).collect()
    };
    assert_eq!(
        lines(a.piecewise_constraints()),
        lines(b.piecewise_constraints())
    );
    assert_eq!(
        lines(a.nonlinear_constraints()),
        lines(b.nonlinear_constraints())
    );
}

#[test]
fn test_save_load_round_trip() {
    let query = build_query();
    let path = temp_path("roundtrip.txt");

    query.save(&path).unwrap();
    let loaded = Query::load(&path).unwrap();
    assert_queries_equal(&query, &loaded);

    // Saving the reloaded query reproduces the file byte for byte.
    let path2 = temp_path("roundtrip2.txt");
    loaded.save(&path2).unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        std::fs::read_to_string(&path2).unwrap()
    );

    std::fs::remove_file(path).ok();
    std::fs::remove_file(path2).ok();
}

#[test]
fn test_softmax_round_trip_keeps_one_sum_equation() {
    let mut query = Query::new();
    query.set_num_variables(6);
    for i in 0..3 {
        query.mark_input(i, i);
        query.set_lower(i, -1.0).unwrap();
        query.set_upper(i, 1.0).unwrap();
    }

    query.add_nonlinear(Box::new(SoftmaxConstraint::new(
        vec![0, 1, 2],
        vec![3, 4, 5],
    )));
    // The sum-to-one equation the encoding implies.
    let mut sum = Equation::new(EquationKind::Equality);
    sum.add_addend(1.0, 3);
    sum.add_addend(1.0, 4);
    sum.add_addend(1.0, 5);
    sum.set_scalar(1.0);
    query.add_equation(sum);

    let path = temp_path("softmax.txt");
    query.save(&path).unwrap();
    let loaded = Query::load(&path).unwrap();

    // The loader must not add a second copy.
    assert_eq!(loaded.num_equations(), 1);
    assert_queries_equal(&query, &loaded);

    // A query saved without the equation gains it on load.
    let mut bare = Query::new();
    bare.set_num_variables(4);
    bare.mark_input(0, 0);
    bare.mark_input(1, 1);
    bare.add_nonlinear(Box::new(SoftmaxConstraint::new(vec![0, 1], vec![2, 3])));
    bare.save(&path).unwrap();
    let loaded = Query::load(&path).unwrap();
    assert_eq!(loaded.num_equations(), 1);
    let sum = &loaded.equations()[0];
    assert_eq!(sum.scalar(), 1.0);
    assert_eq!(sum.participating_variables(), vec![2, 3]);

    std::fs::remove_file(path).ok();
}

#[test]
fn test_json_round_trip_with_trait_objects() {
    let query = build_query();
    let path = temp_path("snapshot.json");

    query.save_json(&path).unwrap();
    let restored = Query::load_json(&path).unwrap();
    assert_queries_equal(&query, &restored);

    // The snapshot is plain serde, usable directly as well.
    let json = serde_json::to_string(&query).unwrap();
    let restored: Query = serde_json::from_str(&json).unwrap();
    assert_queries_equal(&query, &restored);

    std::fs::remove_file(path).ok();
}

#[test]
fn test_merge_identical_variables() {
    let mut query = Query::new();
    query.set_num_variables(4);

    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(2.0, 1);
    eq.add_addend(3.0, 2);
    eq.set_scalar(1.0);
    query.add_equation(eq);
    query.add_piecewise(Box::new(ReluConstraint::new(1, 3)));

    query.merge_identical_variables(1, 2).unwrap();

    // 2x1 + 3x2 becomes 5x2 once x1 folds into x2.
    let merged = &query.equations()[0];
    assert_eq!(merged.coefficient(1), 0.0);
    assert_eq!(merged.coefficient(2), 5.0);
    assert_eq!(
        query.piecewise_constraints()[0].serialize_line(),
        "relu,3,2"
    );
}

#[test]
fn test_merging_marked_variables_is_rejected() {
    let mut query = Query::new();
    query.set_num_variables(4);
    query.mark_input(0, 0);
    query.mark_output(1, 0);

    assert!(matches!(
        query.merge_identical_variables(0, 2),
        Err(VfError::MergedInputVariable(0))
    ));
    assert!(matches!(
        query.merge_identical_variables(1, 2),
        Err(VfError::MergedOutputVariable(1))
    ));
}

#[test]
fn test_solution_values_and_export() {
    let mut query = Query::new();
    query.set_num_variables(3);

    assert!(matches!(
        query.solution_value(0),
        Err(VfError::VariableNotInSolution(0))
    ));

    query.set_solution_value(0, 0.25);
    query.set_solution_value(1, -1.5);
    query.set_solution_value(2, 2.0);
    assert_eq!(query.solution_value(1).unwrap(), -1.5);

    let path = temp_path("solution.txt");
    query.export_solution(&path).unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "3");
    assert_eq!(lines[1], "0,0.250000");
    assert_eq!(lines[2], "1,-1.500000");

    std::fs::remove_file(path).ok();
}

#[test]
fn test_bound_tightening_is_strict() {
    let mut query = Query::new();
    query.set_num_variables(2);

    assert!(query.tighten_lower(0, 1.0).unwrap());
    assert!(!query.tighten_lower(0, 0.5).unwrap());
    assert!(query.tighten_lower(0, 2.0).unwrap());

    assert!(query.tighten_upper(0, 5.0).unwrap());
    assert!(!query.tighten_upper(0, 6.0).unwrap());
    assert_eq!(query.lower_bound(0).unwrap(), 2.0);
    assert_eq!(query.upper_bound(0).unwrap(), 5.0);

    assert!(matches!(
        query.tighten_lower(7, 0.0),
        Err(VfError::VariableIndexOutOfRange { variable: 7, .. })
    ));
}

#[test]
fn test_clip_lowers_to_relus_and_equations() {
    let mut query = Query::new();
    query.set_num_variables(2);

    query.add_clip(0, 1, -1.0, 1.0);

    assert_eq!(query.num_variables(), 6);
    assert_eq!(query.num_equations(), 3);
    assert_eq!(query.piecewise_constraints().len(), 2);
    for constraint in query.piecewise_constraints() {
        assert!(constraint.serialize_line().starts_with("relu,"));
    }
}

#[test]
fn test_count_infinite_bounds() {
    let mut query = Query::new();
    query.set_num_variables(2);
    assert_eq!(query.count_infinite_bounds(), 4);

    query.set_lower(0, 0.0).unwrap();
    query.set_upper(1, 1.0).unwrap();
    assert_eq!(query.count_infinite_bounds(), 2);
}
