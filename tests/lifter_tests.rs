use std::collections::BTreeSet;
use std::path::PathBuf;

use veriflow::constraints::ReluConstraint;
use veriflow::nlr::LayerKind;
use veriflow::{Config, Equation, EquationKind, Query};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("veriflow_{}_{}", std::process::id(), name))
}

fn lift(query: &mut Query, config: &Config) -> (Vec<Equation>, BTreeSet<usize>) {
    let mut unhandled_equations = Vec::new();
    let mut unhandled_vars = BTreeSet::new();
    assert!(query.construct_network_level_reasoner(
        &mut unhandled_equations,
        &mut unhandled_vars,
        config
    ));
    (unhandled_equations, unhandled_vars)
}

/// input(2) -> weighted sum(2) -> relu(2) -> weighted sum(1).
fn build_network_query() -> Query {
    let mut query = Query::new();
    query.set_num_variables(7);
    query.mark_input(0, 0);
    query.mark_input(1, 1);
    query.mark_output(6, 0);
    for i in 0..2 {
        query.set_lower(i, -1.0).unwrap();
        query.set_upper(i, 1.0).unwrap();
    }

    let weights = [[0.5, -1.0], [2.0, 0.25]];
    for neuron in 0..2 {
        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(weights[neuron][0], 0);
        eq.add_addend(weights[neuron][1], 1);
        eq.add_addend(-1.0, 2 + neuron);
        eq.set_scalar(0.125 * neuron as f64);
        query.add_equation(eq);
    }

    query.add_piecewise(Box::new(ReluConstraint::new(2, 4)));
    query.add_piecewise(Box::new(ReluConstraint::new(3, 5)));

    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(1.0, 4);
    eq.add_addend(-2.0, 5);
    eq.add_addend(-1.0, 6);
    eq.set_scalar(0.5);
    query.add_equation(eq);

    query
}

/// Scenario: lift, serialize, reload, lift again. The two graphs must agree
/// in topology, weights (bit-exact) and neuron-variable maps.
#[test]
fn test_lift_then_relift_is_stable() {
    let config = Config::default();

    let mut query = build_network_query();
    lift(&mut query, &config);

    let path = temp_path("relift.txt");
    query.save(&path).unwrap();
    let mut reloaded = Query::load(&path).unwrap();
    lift(&mut reloaded, &config);
    std::fs::remove_file(path).ok();

    let first = query.network().unwrap();
    let second = reloaded.network().unwrap();

    assert_eq!(first.topology(), second.topology());
    assert_eq!(first.neuron_variable_map(), second.neuron_variable_map());

    // Weighted-sum layers compare bit-exact.
    for index in 0..first.num_layers() {
        let a = first.layer(index);
        let b = second.layer(index);
        assert_eq!(a.kind(), b.kind());
        if a.kind() != LayerKind::WeightedSum {
            continue;
        }
        for (&source, &source_size) in a.source_layers() {
            for j in 0..source_size {
                for i in 0..a.size() {
                    assert_eq!(a.weight(source, j, i), b.weight(source, j, i));
                }
            }
            for i in 0..a.size() {
                assert_eq!(a.bias(i), b.bias(i));
            }
        }
    }
}

#[test]
fn test_expected_topology_and_wiring() {
    let config = Config::default();
    let mut query = build_network_query();
    lift(&mut query, &config);

    let network = query.network().unwrap();
    let kinds: Vec<LayerKind> = network.topology().iter().map(|t| t.0).collect();
    assert_eq!(
        kinds,
        vec![
            LayerKind::Input,
            LayerKind::WeightedSum,
            LayerKind::Relu,
            LayerKind::WeightedSum
        ]
    );

    // The equation coefficients land transposed into the weight matrix.
    let hidden = network.layer(1);
    assert_eq!(hidden.weight(0, 0, 0), 0.5);
    assert_eq!(hidden.weight(0, 1, 0), -1.0);
    assert_eq!(hidden.weight(0, 0, 1), 2.0);
    assert_eq!(hidden.weight(0, 1, 1), 0.25);
    // The equation scalar is the negated bias: y = sum(w*x) - scalar.
    assert_eq!(hidden.bias(1), -0.125);

    // Both relus were hoisted into the graph in topological order.
    assert_eq!(network.constraints_in_topological_order().len(), 2);
    assert!(query.piecewise_constraints().is_empty());
}

#[test]
fn test_unhandled_equations_are_reported() {
    let config = Config::default();
    let mut query = build_network_query();

    // An inequality over the inputs can never become a weighted-sum layer.
    let mut extra = Equation::new(EquationKind::GreaterEq);
    extra.add_addend(1.0, 0);
    extra.add_addend(1.0, 1);
    extra.set_scalar(-0.5);
    query.add_equation(extra.clone());

    let (unhandled, vars) = lift(&mut query, &config);
    assert_eq!(unhandled, vec![extra]);
    assert!(vars.contains(&0));
    assert!(vars.contains(&1));
}

#[test]
fn test_same_source_layer_splits_activation_layers() {
    // Two relus whose sources live in different layers: one reads the input,
    // the other reads a weighted sum.
    let build = || {
        let mut query = Query::new();
        query.set_num_variables(5);
        query.mark_input(0, 0);
        query.set_lower(0, -1.0).unwrap();
        query.set_upper(0, 1.0).unwrap();

        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(2.0, 0);
        eq.add_addend(-1.0, 1);
        eq.set_scalar(0.0);
        query.add_equation(eq);

        query.add_piecewise(Box::new(ReluConstraint::new(0, 2)));
        query.add_piecewise(Box::new(ReluConstraint::new(1, 3)));
        query
    };

    let strict = Config::default();
    let mut query = build();
    lift(&mut query, &strict);
    let kinds: Vec<LayerKind> = query
        .network()
        .unwrap()
        .topology()
        .iter()
        .map(|t| t.0)
        .collect();
    assert_eq!(
        kinds,
        vec![
            LayerKind::Input,
            LayerKind::WeightedSum,
            LayerKind::Relu,
            LayerKind::Relu
        ]
    );

    let mut permissive = Config::default();
    permissive.ensure_same_source_layer = false;
    let mut query = build();
    lift(&mut query, &permissive);
    let kinds: Vec<LayerKind> = query
        .network()
        .unwrap()
        .topology()
        .iter()
        .map(|t| t.0)
        .collect();
    assert_eq!(
        kinds,
        vec![LayerKind::Input, LayerKind::WeightedSum, LayerKind::Relu]
    );
}

#[test]
fn test_lifting_without_inputs_fails() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(2);
    query.add_piecewise(Box::new(ReluConstraint::new(0, 1)));

    let mut unhandled_equations = Vec::new();
    let mut unhandled_vars = BTreeSet::new();
    assert!(!query.construct_network_level_reasoner(
        &mut unhandled_equations,
        &mut unhandled_vars,
        &config
    ));
    assert!(query.network().is_none());
}

/// Consecutive weighted-sum layers compose: h = 2x, z = 3h + 1 becomes
/// z = 6x + 1. The pass is idempotent.
#[test]
fn test_merge_consecutive_weighted_sum_layers() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(3);
    query.mark_input(0, 0);
    query.mark_output(2, 0);
    query.set_lower(0, -1.0).unwrap();
    query.set_upper(0, 1.0).unwrap();

    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(2.0, 0);
    eq.add_addend(-1.0, 1);
    eq.set_scalar(0.0);
    query.add_equation(eq);

    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(3.0, 1);
    eq.add_addend(-1.0, 2);
    eq.set_scalar(-1.0);
    query.add_equation(eq);

    let (unhandled, unhandled_vars) = lift(&mut query, &config);
    assert_eq!(query.network().unwrap().num_layers(), 3);

    let merged = query.merge_consecutive_weighted_sum_layers(&unhandled, &unhandled_vars);
    assert_eq!(merged, 1);

    let network = query.network().unwrap();
    assert_eq!(network.num_layers(), 2);
    let output = network.layer(1);
    assert_eq!(output.kind(), LayerKind::WeightedSum);
    assert_eq!(output.weight(0, 0, 0), 6.0);
    assert_eq!(output.bias(0), 1.0);

    // The affine layers are re-encoded as query equations: z = 6x + 1.
    assert_eq!(query.num_equations(), 1);
    let eq = &query.equations()[0];
    assert_eq!(eq.coefficient(0), 6.0);
    assert_eq!(eq.coefficient(2), -1.0);
    assert_eq!(eq.scalar(), -1.0);

    // Idempotent.
    let merged = query.merge_consecutive_weighted_sum_layers(&unhandled, &unhandled_vars);
    assert_eq!(merged, 0);

    // The merged graph still evaluates the original function.
    let outputs = query.evaluate(&[0.5]).unwrap();
    assert!((outputs[0] - 4.0).abs() < 1e-9);
}
