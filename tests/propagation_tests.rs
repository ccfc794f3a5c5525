use std::collections::BTreeSet;

use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use veriflow::constraints::{
    BilinearConstraint, LeakyReluConstraint, Phase, ReluConstraint, SoftmaxConstraint,
};
use veriflow::nlr::{LayerKind, PropagationOutcome};
use veriflow::{Config, Equation, EquationKind, Query};

fn lift(query: &mut Query, config: &Config) -> (Vec<Equation>, BTreeSet<usize>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut unhandled_equations = Vec::new();
    let mut unhandled_vars = BTreeSet::new();
    assert!(query.construct_network_level_reasoner(
        &mut unhandled_equations,
        &mut unhandled_vars,
        config
    ));
    (unhandled_equations, unhandled_vars)
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

/// Scenario: a single ReLU over b in [-2, 3]. One sweep bounds f to [0, 3]
/// without fixing the phase; raising b's lower bound to 1 activates it.
#[test]
fn test_relu_triangle() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(2);
    query.mark_input(0, 0);
    query.set_lower(0, -2.0).unwrap();
    query.set_upper(0, 3.0).unwrap();
    query.add_piecewise(Box::new(ReluConstraint::new(0, 1)));

    lift(&mut query, &config);
    query.propagate_bounds(&config, None).unwrap();

    assert_close(query.lower_bound(1).unwrap(), 0.0);
    assert_close(query.upper_bound(1).unwrap(), 3.0);

    let relu = &query.network().unwrap().constraints_in_topological_order()[0];
    assert_eq!(relu.phase(), Phase::NotFixed);

    // Tightening b past zero activates the constraint and drags f along.
    assert!(query.tighten_lower(0, 1.0).unwrap());
    query.propagate_bounds(&config, None).unwrap();

    assert_close(query.lower_bound(1).unwrap(), 1.0);
    let relu = &query.network().unwrap().constraints_in_topological_order()[0];
    assert_eq!(relu.phase(), Phase::Active);

    // The fixed phase implies the linear equation f = b.
    let split = relu.valid_split().unwrap();
    assert_eq!(split.equations.len(), 1);
    let eq = &split.equations[0];
    assert_eq!(eq.coefficient(1), 1.0);
    assert_eq!(eq.coefficient(0), -1.0);
}

/// Scenario: leaky ReLU with slope 0.1 over b in [-10, 5]. The chord forms
/// the upper envelope, the area heuristic picks slope alpha for the lower.
#[test]
fn test_leaky_relu_envelopes() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(2);
    query.mark_input(0, 0);
    query.set_lower(0, -10.0).unwrap();
    query.set_upper(0, 5.0).unwrap();
    query.add_piecewise(Box::new(LeakyReluConstraint::new(0, 1, 0.1)));

    lift(&mut query, &config);
    query.propagate_bounds(&config, None).unwrap();

    assert_close(query.lower_bound(1).unwrap(), -1.0);
    assert_close(query.upper_bound(1).unwrap(), 5.0);

    let network = query.network().unwrap();
    assert_eq!(network.layer(1).kind(), LayerKind::LeakyRelu);
    let sym = network.layer(1).symbolic().unwrap();

    // Upper envelope: chord slope (u - alpha*l)/(u - l) = 0.4 with bias
    // (alpha - 1)*u*l/(u - l) = 3.
    assert_close(sym.ub[[0, 0]], 0.4);
    assert_close(sym.upper_bias[0], 3.0);

    // Lower envelope: |u| < |l|, so the slope collapses to alpha.
    assert_close(sym.lb[[0, 0]], 0.1);
    assert_close(sym.lower_bias[0], 0.0);
}

/// Scenario: two inputs in [0, 1]^2, a weighted sum h = [[1,1],[1,-1]]x,
/// and a softmax output layer.
#[test]
fn test_two_layer_network_with_softmax_output() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(6);
    for i in 0..2 {
        query.mark_input(i, i);
        query.set_lower(i, 0.0).unwrap();
        query.set_upper(i, 1.0).unwrap();
    }
    query.mark_output(4, 0);
    query.mark_output(5, 1);

    // h0 = x0 + x1, h1 = x0 - x1.
    let mut eq0 = Equation::new(EquationKind::Equality);
    eq0.add_addend(1.0, 0);
    eq0.add_addend(1.0, 1);
    eq0.add_addend(-1.0, 2);
    eq0.set_scalar(0.0);
    query.add_equation(eq0);

    let mut eq1 = Equation::new(EquationKind::Equality);
    eq1.add_addend(1.0, 0);
    eq1.add_addend(-1.0, 1);
    eq1.add_addend(-1.0, 3);
    eq1.set_scalar(0.0);
    query.add_equation(eq1);

    query.add_nonlinear(Box::new(SoftmaxConstraint::new(vec![2, 3], vec![4, 5])));
    // The sum-to-one equation implied by the softmax encoding.
    let mut sum = Equation::new(EquationKind::Equality);
    sum.add_addend(1.0, 4);
    sum.add_addend(1.0, 5);
    sum.set_scalar(1.0);
    query.add_equation(sum);

    let (unhandled, _) = lift(&mut query, &config);
    // The sum equation stays with the query.
    assert_eq!(unhandled.len(), 1);
    assert_eq!(unhandled[0].participating_variables(), vec![4, 5]);

    let topology = query.network().unwrap().topology();
    assert_eq!(topology.len(), 3);
    assert_eq!(topology[1].0, LayerKind::WeightedSum);
    assert_eq!(topology[2].0, LayerKind::Softmax);

    query.propagate_bounds(&config, None).unwrap();

    assert_close(query.lower_bound(2).unwrap(), 0.0);
    assert_close(query.upper_bound(2).unwrap(), 2.0);
    assert_close(query.lower_bound(3).unwrap(), -1.0);
    assert_close(query.upper_bound(3).unwrap(), 1.0);

    // y0 = 1/(1 + e^(h1 - h0)) with h1 - h0 in [-3, 1], and dually for y1.
    assert_close(query.lower_bound(4).unwrap(), 1.0 / (1.0 + 1.0f64.exp()));
    assert_close(query.upper_bound(4).unwrap(), 1.0 / (1.0 + (-3.0f64).exp()));
    assert_close(query.lower_bound(5).unwrap(), 1.0 / (1.0 + 3.0f64.exp()));
    assert_close(query.upper_bound(5).unwrap(), 1.0 / (1.0 + (-1.0f64).exp()));

    // Concrete evaluation agrees with the closed form at the box center.
    let outputs = query.evaluate(&[0.5, 0.5]).unwrap();
    let expected = 1.0f64.exp() / (1.0f64.exp() + 1.0);
    assert_close(outputs[0], expected);
    assert_close(outputs[1], 1.0 - expected);
}

/// Scenario: a ReLU whose source is confined to [-5, -2]. The output pins to
/// zero, the constraint goes inactive and obsolete after elimination, and a
/// downstream weighted sum treats it as the constant zero.
#[test]
fn test_unreachable_relu_becomes_constant() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(4);
    query.mark_input(0, 0);
    query.set_lower(0, 0.0).unwrap();
    query.set_upper(0, 3.0).unwrap();

    // h = -x - 2, so h in [-5, -2].
    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(-1.0, 0);
    eq.add_addend(-1.0, 1);
    eq.set_scalar(2.0);
    query.add_equation(eq);

    query.add_piecewise(Box::new(ReluConstraint::new(1, 2)));

    // z = f + 1.
    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(1.0, 2);
    eq.add_addend(-1.0, 3);
    eq.set_scalar(-1.0);
    query.add_equation(eq);

    lift(&mut query, &config);
    query.propagate_bounds(&config, None).unwrap();

    assert_close(query.lower_bound(2).unwrap(), 0.0);
    assert_close(query.upper_bound(2).unwrap(), 0.0);
    assert_close(query.lower_bound(3).unwrap(), 1.0);
    assert_close(query.upper_bound(3).unwrap(), 1.0);

    let relu = &query.network().unwrap().constraints_in_topological_order()[0];
    assert_eq!(relu.phase(), Phase::Inactive);

    // Eliminate the pinned output; the constraint declares itself obsolete
    // and the relu neuron turns into a constant for its successors.
    let network = query.network_mut().unwrap();
    network.eliminate_variable(2, 0.0);
    let relu = &network.constraints_in_topological_order()[0];
    assert!(relu.is_obsolete());
    assert!(network.layer(2).neuron_eliminated(0));

    query.propagate_bounds(&config, None).unwrap();
    assert_close(query.lower_bound(3).unwrap(), 1.0);
    assert_close(query.upper_bound(3).unwrap(), 1.0);
}

/// Scenario: z = x * y over x in [-1, 2], y in [3, 5]. Corner products give
/// the interval, McCormick gives the symbolic rows.
#[test]
fn test_bilinear_box() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(3);
    query.mark_input(0, 0);
    query.mark_input(1, 1);
    query.set_lower(0, -1.0).unwrap();
    query.set_upper(0, 2.0).unwrap();
    query.set_lower(1, 3.0).unwrap();
    query.set_upper(1, 5.0).unwrap();

    query.add_nonlinear(Box::new(BilinearConstraint::new(0, 1, 2)));

    lift(&mut query, &config);
    query.propagate_bounds(&config, None).unwrap();

    assert_close(query.lower_bound(2).unwrap(), -5.0);
    assert_close(query.upper_bound(2).unwrap(), 10.0);

    // z >= 3x - y + 3 and z <= 5x - y + 5.
    let network = query.network().unwrap();
    let sym = network.layer(1).symbolic().unwrap();
    assert_close(sym.lb[[0, 0]], 3.0);
    assert_close(sym.lb[[1, 0]], -1.0);
    assert_close(sym.lower_bias[0], 3.0);
    assert_close(sym.ub[[0, 0]], 5.0);
    assert_close(sym.ub[[1, 0]], -1.0);
    assert_close(sym.upper_bias[0], 5.0);

    let outputs = query.evaluate(&[2.0, 3.0]).unwrap();
    assert_close(outputs[0], 6.0);
}

/// Scenario: z = h0 * h1 where both factors are biased weighted sums of one
/// input, h0 = x + 1 in [1, 2] and h1 = 3 - x in [2, 3]. The source biases
/// must flow into the McCormick envelopes, not just the coefficient rows.
#[test]
fn test_bilinear_over_biased_weighted_sums() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(4);
    query.mark_input(0, 0);
    query.set_lower(0, 0.0).unwrap();
    query.set_upper(0, 1.0).unwrap();

    // h0 = x + 1.
    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(1.0, 0);
    eq.add_addend(-1.0, 1);
    eq.set_scalar(-1.0);
    query.add_equation(eq);

    // h1 = 3 - x.
    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(-1.0, 0);
    eq.add_addend(-1.0, 2);
    eq.set_scalar(-3.0);
    query.add_equation(eq);

    query.add_nonlinear(Box::new(BilinearConstraint::new(1, 2, 3)));

    lift(&mut query, &config);
    query.propagate_bounds(&config, None).unwrap();

    assert_close(query.lower_bound(1).unwrap(), 1.0);
    assert_close(query.upper_bound(1).unwrap(), 2.0);
    assert_close(query.lower_bound(2).unwrap(), 2.0);
    assert_close(query.upper_bound(2).unwrap(), 3.0);

    // McCormick over the input:
    //   z >= 2*h0 + h1 - 2 = (2*(x+1)) + (3-x) - 2 = x + 3
    //   z <= 3*h0 + h1 - 3 = (3*(x+1)) + (3-x) - 3 = 2x + 3
    let network = query.network().unwrap();
    assert_eq!(network.layer(2).kind(), LayerKind::Bilinear);
    let sym = network.layer(2).symbolic().unwrap();
    assert_close(sym.lb[[0, 0]], 1.0);
    assert_close(sym.lower_bias[0], 3.0);
    assert_close(sym.ub[[0, 0]], 2.0);
    assert_close(sym.upper_bias[0], 3.0);

    // The envelopes beat the corner-product interval [2, 6] and stay sound:
    // the true range of (x+1)*(3-x) on [0, 1] is [3, 4].
    assert_close(query.lower_bound(3).unwrap(), 3.0);
    assert_close(query.upper_bound(3).unwrap(), 5.0);

    let outputs = query.evaluate(&[0.5]).unwrap();
    assert_close(outputs[0], 3.75);
    assert!(outputs[0] >= query.lower_bound(3).unwrap() - 1e-9);
    assert!(outputs[0] <= query.upper_bound(3).unwrap() + 1e-9);
}

/// After a propagation sweep the concrete interval dominates the symbolic
/// interval on every layer.
#[test]
fn test_concrete_interval_dominates_symbolic() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(6);
    query.mark_input(0, 0);
    query.mark_input(1, 1);
    for i in 0..2 {
        query.set_lower(i, -1.0).unwrap();
        query.set_upper(i, 1.0).unwrap();
    }

    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(1.0, 0);
    eq.add_addend(-0.5, 1);
    eq.add_addend(-1.0, 2);
    eq.set_scalar(0.25);
    query.add_equation(eq);

    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(2.0, 0);
    eq.add_addend(1.0, 1);
    eq.add_addend(-1.0, 3);
    eq.set_scalar(-1.0);
    query.add_equation(eq);

    query.add_piecewise(Box::new(ReluConstraint::new(2, 4)));
    query.add_piecewise(Box::new(ReluConstraint::new(3, 5)));

    lift(&mut query, &config);
    query.propagate_bounds(&config, None).unwrap();

    let network = query.network().unwrap();
    for index in 0..network.num_layers() {
        let layer = network.layer(index);
        let Some(sym) = layer.symbolic() else { continue };
        for neuron in 0..layer.size() {
            assert!(layer.lb(neuron) >= sym.lb_of_lb[neuron] - config.epsilon);
            assert!(layer.ub(neuron) <= sym.ub_of_ub[neuron] + config.epsilon);
            assert!(layer.lb(neuron) <= layer.ub(neuron) + config.epsilon);
        }
    }
}

/// Random networks, random points: forward evaluation stays inside the
/// propagated output bounds.
#[test]
fn test_sampled_assignments_respect_propagated_bounds() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = Config::default();

    for _ in 0..20 {
        let mut query = Query::new();
        query.set_num_variables(7);
        query.mark_input(0, 0);
        query.mark_input(1, 1);
        for i in 0..2 {
            query.set_lower(i, -1.0).unwrap();
            query.set_upper(i, 1.0).unwrap();
        }

        // Hidden weighted sum (2 neurons), relu, then an output sum.
        let weights = Array2::random_using((2, 2), Uniform::new(-2.0, 2.0), &mut rng);
        for neuron in 0..2 {
            let mut eq = Equation::new(EquationKind::Equality);
            eq.add_addend(weights[[0, neuron]], 0);
            eq.add_addend(weights[[1, neuron]], 1);
            eq.add_addend(-1.0, 2 + neuron);
            eq.set_scalar(rng.gen_range(-1.0..1.0));
            query.add_equation(eq);
        }
        query.add_piecewise(Box::new(ReluConstraint::new(2, 4)));
        query.add_piecewise(Box::new(ReluConstraint::new(3, 5)));
        let mut eq = Equation::new(EquationKind::Equality);
        eq.add_addend(rng.gen_range(-2.0..2.0), 4);
        eq.add_addend(rng.gen_range(-2.0..2.0), 5);
        eq.add_addend(-1.0, 6);
        eq.set_scalar(0.0);
        query.add_equation(eq);

        lift(&mut query, &config);
        query.propagate_bounds(&config, None).unwrap();

        let lb = query.lower_bound(6).unwrap();
        let ub = query.upper_bound(6).unwrap();
        for _ in 0..50 {
            let x = [rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)];
            let outputs = query.evaluate(&x).unwrap();
            assert!(
                outputs[0] >= lb - 1e-6 && outputs[0] <= ub + 1e-6,
                "sampled output {} escapes [{}, {}]",
                outputs[0],
                lb,
                ub
            );
        }
    }
}

/// Two propagations from identical state publish identical tightenings in
/// identical order.
#[test]
fn test_propagation_is_deterministic() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(5);
    query.mark_input(0, 0);
    query.mark_input(1, 1);
    for i in 0..2 {
        query.set_lower(i, -2.0).unwrap();
        query.set_upper(i, 2.0).unwrap();
    }
    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(1.0, 0);
    eq.add_addend(1.0, 1);
    eq.add_addend(-1.0, 2);
    eq.set_scalar(0.0);
    query.add_equation(eq);
    let mut eq = Equation::new(EquationKind::Equality);
    eq.add_addend(1.0, 0);
    eq.add_addend(-1.0, 1);
    eq.add_addend(-1.0, 3);
    eq.set_scalar(0.0);
    query.add_equation(eq);
    query.add_piecewise(Box::new(ReluConstraint::new(2, 4)));

    lift(&mut query, &config);
    let mut twin = query.clone();

    query.propagate_bounds(&config, None).unwrap();
    twin.propagate_bounds(&config, None).unwrap();

    assert_eq!(
        query.network().unwrap().tightening_log(),
        twin.network().unwrap().tightening_log()
    );
    assert!(!query.network().unwrap().tightening_log().is_empty());
}

/// A second propagation from a fixed point changes nothing.
#[test]
fn test_propagation_reaches_a_fixed_point() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(2);
    query.mark_input(0, 0);
    query.set_lower(0, -1.0).unwrap();
    query.set_upper(0, 1.0).unwrap();
    query.add_piecewise(Box::new(ReluConstraint::new(0, 1)));

    lift(&mut query, &config);
    query.propagate_bounds(&config, None).unwrap();

    let outcome = query.propagate_bounds(&config, None).unwrap();
    assert_eq!(outcome, PropagationOutcome::FixedPoint);
    assert!(query.network().unwrap().tightening_log().is_empty());
}

/// An already-expired deadline interrupts before any sweep; published bounds
/// are absent but the query is untouched.
#[test]
fn test_expired_deadline_interrupts() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(2);
    query.mark_input(0, 0);
    query.set_lower(0, -1.0).unwrap();
    query.set_upper(0, 1.0).unwrap();
    query.add_piecewise(Box::new(ReluConstraint::new(0, 1)));

    lift(&mut query, &config);
    let deadline = std::time::Instant::now() - std::time::Duration::from_millis(1);
    let outcome = query.propagate_bounds(&config, Some(deadline)).unwrap();
    assert_eq!(outcome, PropagationOutcome::Interrupted);
}

/// Contradictory bounds surface as an infeasibility error.
#[test]
fn test_infeasible_bounds_are_detected() {
    let config = Config::default();
    let mut query = Query::new();
    query.set_num_variables(2);
    query.mark_input(0, 0);
    query.set_lower(0, -5.0).unwrap();
    query.set_upper(0, -2.0).unwrap();
    // f is claimed positive, but the relu pins it to zero.
    query.set_lower(1, 1.0).unwrap();
    query.add_piecewise(Box::new(ReluConstraint::new(0, 1)));

    lift(&mut query, &config);
    let result = query.propagate_bounds(&config, None);
    assert!(result.is_err());
}
