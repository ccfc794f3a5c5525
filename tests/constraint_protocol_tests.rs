use veriflow::constraints::{
    deserialize_line, AbsoluteValueConstraint, BilinearConstraint, ConstraintKind,
    DisjunctionConstraint, LeakyReluConstraint, MaxConstraint, Phase, PieceSplit,
    PiecewiseConstraint, ReluConstraint, RoundConstraint, SigmoidConstraint, SignConstraint,
    SoftmaxConstraint,
};
use veriflow::{BoundKind, EquationKind, LinearExpression, Query, Tightening};

fn contains(tightenings: &[Tightening], expected: Tightening) -> bool {
    tightenings.iter().any(|t| {
        t.variable == expected.variable
            && t.kind == expected.kind
            && (t.value - expected.value).abs() < 1e-9
    })
}

#[test]
fn test_relu_phase_fixes_and_stays_fixed() {
    let mut relu = ReluConstraint::new(1, 2);
    assert_eq!(relu.phase(), Phase::NotFixed);

    relu.notify_lower_bound(1, -2.0);
    relu.notify_upper_bound(1, 3.0);
    assert_eq!(relu.phase(), Phase::NotFixed);

    relu.notify_lower_bound(1, 1.0);
    assert_eq!(relu.phase(), Phase::Active);

    // Once fixed the phase never unfixes, whatever arrives later.
    relu.notify_upper_bound(2, 0.0);
    assert_eq!(relu.phase(), Phase::Active);
}

#[test]
fn test_relu_phase_depends_only_on_final_bounds() {
    // Same final bounds through two different notification orders.
    let mut first = ReluConstraint::new(0, 1);
    first.notify_lower_bound(0, -1.0);
    first.notify_upper_bound(0, -0.5);

    let mut second = ReluConstraint::new(0, 1);
    second.notify_upper_bound(0, -0.5);
    second.notify_lower_bound(0, -1.0);

    assert_eq!(first.phase(), Phase::Inactive);
    assert_eq!(first.phase(), second.phase());
}

#[test]
fn test_relu_entailed_tightenings() {
    let mut relu = ReluConstraint::new(1, 2);
    relu.notify_lower_bound(1, -2.0);
    relu.notify_upper_bound(1, 3.0);

    let mut tightenings = Vec::new();
    relu.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(2, 0.0)));
    assert!(contains(&tightenings, Tightening::upper(2, 3.0)));
}

#[test]
fn test_relu_case_splits_are_complementary() {
    let relu = ReluConstraint::new(1, 2);
    let cases = relu.all_cases();
    assert_eq!(cases, vec![Phase::Inactive, Phase::Active]);

    // Inactive: b <= 0 and f pinned to zero.
    let inactive = relu.case_split(Phase::Inactive).unwrap();
    assert!(contains(&inactive.tightenings, Tightening::upper(1, 0.0)));
    assert!(contains(&inactive.tightenings, Tightening::upper(2, 0.0)));
    assert!(inactive.equations.is_empty());

    // Active: b >= 0 and the equation f = b.
    let active = relu.case_split(Phase::Active).unwrap();
    assert!(contains(&active.tightenings, Tightening::lower(1, 0.0)));
    assert_eq!(active.equations.len(), 1);
    let eq = &active.equations[0];
    assert_eq!(eq.kind(), EquationKind::Equality);
    assert_eq!(eq.coefficient(2), 1.0);
    assert_eq!(eq.coefficient(1), -1.0);
    assert_eq!(eq.scalar(), 0.0);
}

#[test]
fn test_relu_valid_split_follows_phase() {
    let mut relu = ReluConstraint::new(1, 2);
    assert!(relu.valid_split().is_none());

    relu.notify_lower_bound(1, 0.5);
    let split = relu.valid_split().unwrap();
    assert_eq!(split.equations.len(), 1);
}

#[test]
fn test_relu_aux_transformation() {
    let mut query = Query::new();
    query.set_num_variables(2);
    let mut relu = ReluConstraint::new(0, 1);

    relu.transform_to_use_aux(&mut query);

    // Two fresh non-negative aux variables and their defining equations.
    assert_eq!(query.num_variables(), 4);
    assert_eq!(query.num_equations(), 2);
    assert_eq!(query.lower_bound(2).unwrap(), 0.0);
    assert_eq!(query.lower_bound(3).unwrap(), 0.0);
    assert!(relu.participating_variables().contains(&2));
    assert!(relu.participating_variables().contains(&3));

    // With aux variables in use, splits tighten instead of adding equations.
    let active = relu.case_split(Phase::Active).unwrap();
    assert!(active.equations.is_empty());
    assert!(contains(&active.tightenings, Tightening::upper(2, 0.0)));
}

#[test]
fn test_relu_cost_terms() {
    let relu = ReluConstraint::new(1, 2);

    let mut active = LinearExpression::new();
    relu.cost_term(Phase::Active, &mut active);
    assert_eq!(active.coefficients.get(&2), Some(&1.0));
    assert_eq!(active.coefficients.get(&1), Some(&-1.0));

    let mut inactive = LinearExpression::new();
    relu.cost_term(Phase::Inactive, &mut inactive);
    assert_eq!(inactive.coefficients.get(&2), Some(&1.0));
    assert_eq!(inactive.coefficients.get(&1), None);
}

#[test]
fn test_duplicate_is_independent() {
    let original: Box<dyn PiecewiseConstraint> = Box::new(ReluConstraint::new(0, 1));
    let mut clone = original.clone();

    clone.notify_lower_bound(0, 1.0);
    assert_eq!(clone.phase(), Phase::Active);
    assert_eq!(original.phase(), Phase::NotFixed);
}

#[test]
fn test_restore_state_undoes_a_fixed_phase() {
    let checkpoint: Box<dyn PiecewiseConstraint> = Box::new(ReluConstraint::new(0, 1));
    let mut live = checkpoint.clone();

    live.notify_lower_bound(0, 2.0);
    assert_eq!(live.phase(), Phase::Active);

    live.restore_state(checkpoint.as_ref());
    assert_eq!(live.phase(), Phase::NotFixed);
}

#[test]
fn test_leaky_relu_entailed_and_splits() {
    let mut leaky = LeakyReluConstraint::new(1, 2, 0.1);
    leaky.notify_lower_bound(1, -10.0);
    leaky.notify_upper_bound(1, 5.0);

    let mut tightenings = Vec::new();
    leaky.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(2, -1.0)));
    assert!(contains(&tightenings, Tightening::upper(2, 5.0)));

    // Inactive case: f = slope * b.
    let inactive = leaky.case_split(Phase::Inactive).unwrap();
    let eq = &inactive.equations[0];
    assert_eq!(eq.coefficient(2), 1.0);
    assert!((eq.coefficient(1) + 0.1).abs() < 1e-12);

    let mut cost = LinearExpression::new();
    leaky.cost_term(Phase::Inactive, &mut cost);
    assert!((cost.coefficients[&1] + 0.1).abs() < 1e-12);
}

#[test]
fn test_sign_phases_and_entailed() {
    let mut sign = SignConstraint::new(0, 1);
    sign.notify_lower_bound(0, 0.0);
    assert_eq!(sign.phase(), Phase::Positive);

    let mut tightenings = Vec::new();
    sign.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(1, 1.0)));
    assert!(contains(&tightenings, Tightening::upper(1, 1.0)));

    let mut negative = SignConstraint::new(0, 1);
    negative.notify_upper_bound(0, -0.5);
    assert_eq!(negative.phase(), Phase::Negative);
}

#[test]
fn test_absolute_value_phases_and_splits() {
    let mut abs = AbsoluteValueConstraint::new(0, 1);
    abs.notify_lower_bound(0, -3.0);
    abs.notify_upper_bound(0, -1.0);
    assert_eq!(abs.phase(), Phase::Negative);

    let mut tightenings = Vec::new();
    abs.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(1, 1.0)));
    assert!(contains(&tightenings, Tightening::upper(1, 3.0)));

    // Negative split carries f = -b.
    let split = abs.case_split(Phase::Negative).unwrap();
    let eq = &split.equations[0];
    assert_eq!(eq.coefficient(1), 1.0);
    assert_eq!(eq.coefficient(0), 1.0);
}

#[test]
fn test_max_phase_fixes_on_dominating_element() {
    let mut max = MaxConstraint::new(10, vec![0, 1, 2]);
    max.notify_lower_bound(0, 5.0);
    max.notify_upper_bound(0, 6.0);
    max.notify_upper_bound(1, 1.0);
    max.notify_lower_bound(1, 0.0);
    max.notify_upper_bound(2, 4.0);
    max.notify_lower_bound(2, 0.0);

    assert_eq!(max.phase(), Phase::Case(0));

    let mut tightenings = Vec::new();
    max.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(10, 5.0)));
    assert!(contains(&tightenings, Tightening::upper(10, 6.0)));

    // The winning split pins f to the element and dominates the others.
    let split = max.case_split(Phase::Case(0)).unwrap();
    assert_eq!(split.equations.len(), 3);
    assert_eq!(split.equations[0].kind(), EquationKind::Equality);
    assert_eq!(split.equations[1].kind(), EquationKind::GreaterEq);

    let mut cost = LinearExpression::new();
    max.cost_term(Phase::Case(0), &mut cost);
    assert_eq!(cost.coefficients.get(&10), Some(&1.0));
    assert_eq!(cost.coefficients.get(&0), Some(&-1.0));
}

#[test]
fn test_max_elimination() {
    let mut max = MaxConstraint::new(5, vec![0, 1]);
    max.eliminate_variable(0, 2.0);
    assert!(!max.is_obsolete());

    max.eliminate_variable(5, 2.0);
    assert!(max.is_obsolete());
}

#[test]
fn test_round_entailed_tightenings() {
    let mut round = RoundConstraint::new(0, 1);
    round.notify_lower_bound(0, 1.2);
    round.notify_upper_bound(0, 3.7);
    round.notify_lower_bound(1, 0.0);
    round.notify_upper_bound(1, 10.0);

    let mut tightenings = Vec::new();
    round.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(1, 1.0)));
    assert!(contains(&tightenings, Tightening::upper(1, 4.0)));
    assert!(contains(&tightenings, Tightening::upper(0, 10.5)));
}

#[test]
fn test_sigmoid_entailed_tightenings() {
    let mut sigmoid = SigmoidConstraint::new(0, 1);
    sigmoid.notify_lower_bound(0, 0.0);
    sigmoid.notify_upper_bound(0, 2.0);

    let mut tightenings = Vec::new();
    sigmoid.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(1, 0.5)));
    let expected = 1.0 / (1.0 + (-2.0f64).exp());
    assert!(contains(&tightenings, Tightening::upper(1, expected)));
}

#[test]
fn test_bilinear_entailed_tightenings() {
    let mut bilinear = BilinearConstraint::new(0, 1, 2);
    bilinear.notify_lower_bound(0, -1.0);
    bilinear.notify_upper_bound(0, 2.0);
    bilinear.notify_lower_bound(1, 3.0);
    bilinear.notify_upper_bound(1, 5.0);

    let mut tightenings = Vec::new();
    bilinear.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(2, -5.0)));
    assert!(contains(&tightenings, Tightening::upper(2, 10.0)));
}

#[test]
fn test_softmax_pairs_inputs_with_outputs() {
    let softmax = SoftmaxConstraint::new(vec![0, 1, 2], vec![3, 4, 5]);
    assert_eq!(softmax.output_for_input(1), Some(4));
    assert_eq!(softmax.output_for_input(7), None);

    let mut tightenings = Vec::new();
    softmax.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(3, 0.0)));
    assert!(contains(&tightenings, Tightening::upper(5, 1.0)));
}

#[test]
fn test_disjunction_narrows_to_single_case() {
    let mut left = PieceSplit::new();
    left.tightenings.push(Tightening::upper(0, 1.0));
    let mut right = PieceSplit::new();
    right.tightenings.push(Tightening::lower(0, 5.0));

    let mut disj = DisjunctionConstraint::new(vec![left, right]);
    assert_eq!(disj.all_cases(), vec![Phase::Case(0), Phase::Case(1)]);
    assert_eq!(disj.phase(), Phase::NotFixed);

    // Raising x0 past 1 rules the first disjunct out.
    disj.notify_lower_bound(0, 2.0);
    assert_eq!(disj.phase(), Phase::Case(1));

    let mut tightenings = Vec::new();
    disj.entailed_tightenings(&mut tightenings);
    assert!(contains(&tightenings, Tightening::lower(0, 5.0)));
}

#[test]
fn test_serialization_round_trips_every_kind() {
    let constraints: Vec<Box<dyn PiecewiseConstraint>> = vec![
        Box::new(ReluConstraint::new(1, 2)),
        Box::new(LeakyReluConstraint::new(1, 2, 0.25)),
        Box::new(SignConstraint::new(3, 4)),
        Box::new(AbsoluteValueConstraint::new(5, 6)),
        Box::new(MaxConstraint::new(9, vec![5, 6, 7])),
        Box::new(RoundConstraint::new(0, 1)),
        Box::new(SigmoidConstraint::new(2, 3)),
        Box::new(SoftmaxConstraint::new(vec![0, 1], vec![2, 3])),
        Box::new(BilinearConstraint::new(0, 1, 2)),
    ];

    for constraint in constraints {
        let line = constraint.serialize_line();
        let reparsed = deserialize_line(&line).unwrap();
        assert_eq!(reparsed.kind(), constraint.kind());
        assert_eq!(reparsed.serialize_line(), line);
        assert_eq!(
            reparsed.participating_variables(),
            constraint.participating_variables()
        );
    }
}

#[test]
fn test_disjunction_serialization_round_trip() {
    let mut left = PieceSplit::new();
    left.tightenings.push(Tightening::upper(0, 0.5));
    let mut right = PieceSplit::new();
    right.tightenings.push(Tightening {
        variable: 0,
        value: 0.9,
        kind: BoundKind::Lower,
    });
    let mut eq = veriflow::Equation::new(EquationKind::LessEq);
    eq.add_addend(1.0, 1);
    eq.add_addend(-1.0, 2);
    eq.set_scalar(0.0);
    right.equations.push(eq);

    let disj = DisjunctionConstraint::new(vec![left, right]);
    let line = disj.serialize_line();
    assert!(line.starts_with("disj,2,"));

    let reparsed = deserialize_line(&line).unwrap();
    assert_eq!(reparsed.kind(), ConstraintKind::Disjunction);
    assert_eq!(reparsed.serialize_line(), line);
}

#[test]
fn test_obsolete_after_elimination() {
    let mut relu = ReluConstraint::new(0, 1);
    assert!(!relu.is_obsolete());
    relu.eliminate_variable(1, 0.0);
    assert!(relu.is_obsolete());
}
