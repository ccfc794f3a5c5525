//! Reconstructs the typed layer graph from the flat constraint system by
//! greedy topological peeling: the inputs form layer 0, then construction
//! attempts run in rounds, each peeling off one layer of a single kind,
//! until no attempt succeeds.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::{Equation, EquationKind, Query};
use crate::config::Config;
use crate::constraints::{
    AbsoluteValueConstraint, BilinearConstraint, ConstraintKind, LeakyReluConstraint,
    MaxConstraint, PiecewiseConstraint, ReluConstraint, RoundConstraint, SigmoidConstraint,
    SignConstraint, SoftmaxConstraint,
};
use crate::nlr::{LayerKind, NetworkReasoner};
use crate::sparse::SparseMatrix;
use crate::types::{NeuronIndex, Variable};

/// b, f, and the slope for unary activation constraints.
fn unary_parts(constraint: &dyn PiecewiseConstraint) -> Option<(Variable, Variable, Option<f64>)> {
    let any = constraint.as_any();
    match constraint.kind() {
        ConstraintKind::Relu => {
            let c = any.downcast_ref::<ReluConstraint>()?;
            Some((c.b(), c.f(), None))
        }
        ConstraintKind::LeakyRelu => {
            let c = any.downcast_ref::<LeakyReluConstraint>()?;
            Some((c.b(), c.f(), Some(c.slope())))
        }
        ConstraintKind::Sign => {
            let c = any.downcast_ref::<SignConstraint>()?;
            Some((c.b(), c.f(), None))
        }
        ConstraintKind::AbsoluteValue => {
            let c = any.downcast_ref::<AbsoluteValueConstraint>()?;
            Some((c.b(), c.f(), None))
        }
        ConstraintKind::Round => {
            let c = any.downcast_ref::<RoundConstraint>()?;
            Some((c.b(), c.f(), None))
        }
        ConstraintKind::Sigmoid => {
            let c = any.downcast_ref::<SigmoidConstraint>()?;
            Some((c.b(), c.f(), None))
        }
        _ => None,
    }
}

fn layer_kind_for(kind: ConstraintKind) -> LayerKind {
    match kind {
        ConstraintKind::Relu => LayerKind::Relu,
        ConstraintKind::LeakyRelu => LayerKind::LeakyRelu,
        ConstraintKind::Sign => LayerKind::Sign,
        ConstraintKind::AbsoluteValue => LayerKind::AbsoluteValue,
        ConstraintKind::Round => LayerKind::Round,
        ConstraintKind::Sigmoid => LayerKind::Sigmoid,
        ConstraintKind::Max => LayerKind::Max,
        ConstraintKind::Bilinear => LayerKind::Bilinear,
        ConstraintKind::Softmax => LayerKind::Softmax,
        ConstraintKind::Disjunction => unreachable!("disjunctions never form layers"),
    }
}

/// Bookkeeping shared by the construction attempts.
struct LiftState {
    handled_variable_to_layer: BTreeMap<Variable, usize>,
    handled_equations: BTreeSet<usize>,
    handled_piecewise: BTreeSet<usize>,
    handled_nonlinear: BTreeSet<usize>,
    /// Piecewise constraint indices in the order their layers were built.
    topological_order: Vec<usize>,
}

impl Query {
    /// Rebuilds the network-level reasoner from the query. Returns whether a
    /// graph with at least one non-input layer was constructed; on success
    /// the unhandled equations and the variables of unhandled constraints
    /// are reported back to the caller.
    pub fn construct_network_level_reasoner(
        &mut self,
        unhandled_equations: &mut Vec<Equation>,
        vars_in_unhandled_constraints: &mut BTreeSet<Variable>,
        config: &Config,
    ) -> bool {
        let inputs = self.input_variables();
        if inputs.is_empty() {
            debug!("no input variables; not constructing a network-level reasoner");
            return false;
        }

        let mut net = NetworkReasoner::new();
        let mut state = LiftState {
            handled_variable_to_layer: BTreeMap::new(),
            handled_equations: BTreeSet::new(),
            handled_piecewise: BTreeSet::new(),
            handled_nonlinear: BTreeSet::new(),
            topological_order: Vec::new(),
        };

        net.add_layer(0, LayerKind::Input, inputs.len());
        for (neuron, &variable) in inputs.iter().enumerate() {
            net.set_neuron_variable(NeuronIndex::new(0, neuron), variable);
            state.handled_variable_to_layer.insert(variable, 0);
            let layer = net.layer_mut(0);
            layer.set_lb(neuron, self.bounds().lower(variable));
            layer.set_ub(neuron, self.bounds().upper(variable));
        }

        let mut new_layer_index = 1;
        loop {
            let added = self.try_weighted_sum_layer(&mut net, &mut state, new_layer_index)
                || self.try_unary_layer(&mut net, &mut state, new_layer_index, ConstraintKind::Relu, config)
                || self.try_unary_layer(&mut net, &mut state, new_layer_index, ConstraintKind::Round, config)
                || self.try_unary_layer(&mut net, &mut state, new_layer_index, ConstraintKind::LeakyRelu, config)
                || self.try_unary_layer(&mut net, &mut state, new_layer_index, ConstraintKind::AbsoluteValue, config)
                || self.try_unary_layer(&mut net, &mut state, new_layer_index, ConstraintKind::Sign, config)
                || self.try_unary_layer(&mut net, &mut state, new_layer_index, ConstraintKind::Sigmoid, config)
                || self.try_max_layer(&mut net, &mut state, new_layer_index, config)
                || self.try_bilinear_layer(&mut net, &mut state, new_layer_index)
                || self.try_softmax_layer(&mut net, &mut state, new_layer_index, config);
            if !added {
                break;
            }
            new_layer_index += 1;
        }

        let success = new_layer_index > 1;
        if !success {
            debug!("network-level reasoner construction unsuccessful");
            return false;
        }

        for (index, equation) in self.equations().iter().enumerate() {
            if !state.handled_equations.contains(&index) {
                unhandled_equations.push(equation.clone());
                vars_in_unhandled_constraints.extend(equation.participating_variables());
            }
        }
        for (index, constraint) in self.piecewise_constraints().iter().enumerate() {
            if !state.handled_piecewise.contains(&index) {
                vars_in_unhandled_constraints.extend(constraint.participating_variables());
            }
        }
        for (index, constraint) in self.nonlinear_constraints().iter().enumerate() {
            if !state.handled_nonlinear.contains(&index) {
                vars_in_unhandled_constraints.extend(constraint.participating_variables());
            }
        }

        // Hoist the classified piecewise constraints into the graph, in
        // topological order. Smooth constraints stay with the query.
        let mut slots: Vec<Option<Box<dyn PiecewiseConstraint>>> = self
            .piecewise_constraints_mut()
            .drain(..)
            .map(Some)
            .collect();
        for &index in &state.topological_order {
            let constraint = slots[index].take().expect("hoisted twice");
            net.add_constraint_in_topological_order(constraint);
        }
        *self.piecewise_constraints_mut() = slots.into_iter().flatten().collect();

        net.finalize(config);

        let total_neurons: usize = (0..net.num_layers()).map(|i| net.layer(i).size()).sum();
        info!(
            layers = net.num_layers(),
            neurons = total_neurons,
            variables = self.num_variables(),
            "constructed a network-level reasoner"
        );

        self.set_network(Some(net));
        true
    }

    /// An equation qualifies when exactly one of its variables has no layer
    /// yet; that variable becomes a neuron of the new weighted-sum layer.
    fn try_weighted_sum_layer(
        &self,
        net: &mut NetworkReasoner,
        state: &mut LiftState,
        new_layer_index: usize,
    ) -> bool {
        struct NewNeuron {
            variable: Variable,
            neuron: usize,
            equation: usize,
        }

        let mut new_neurons: Vec<NewNeuron> = Vec::new();
        for (index, equation) in self.equations().iter().enumerate() {
            if state.handled_equations.contains(&index) {
                continue;
            }
            if equation.kind() != EquationKind::Equality {
                continue;
            }
            let unhandled: Vec<Variable> = equation
                .participating_variables()
                .into_iter()
                .filter(|v| !state.handled_variable_to_layer.contains_key(v))
                .collect();
            if unhandled.len() == 1 {
                new_neurons.push(NewNeuron {
                    variable: unhandled[0],
                    neuron: new_neurons.len(),
                    equation: index,
                });
                state.handled_equations.insert(index);
            }
        }

        if new_neurons.is_empty() {
            return false;
        }

        net.add_layer(new_layer_index, LayerKind::WeightedSum, new_neurons.len());

        // Assemble the per-source weights sparsely, then commit.
        let mut assembled: BTreeMap<usize, SparseMatrix<f64>> = BTreeMap::new();
        for new_neuron in &new_neurons {
            state
                .handled_variable_to_layer
                .insert(new_neuron.variable, new_layer_index);

            let layer = net.layer_mut(new_layer_index);
            layer.set_lb(new_neuron.neuron, self.bounds().lower(new_neuron.variable));
            layer.set_ub(new_neuron.neuron, self.bounds().upper(new_neuron.variable));
            net.set_neuron_variable(
                NeuronIndex::new(new_layer_index, new_neuron.neuron),
                new_neuron.variable,
            );

            // The equation has the form 2x1 + 3x2 - y = 5 with y the new
            // neuron; a coefficient other than -1 on y is normalized away.
            let equation = &self.equations()[new_neuron.equation];
            let own_coefficient = equation.coefficient(new_neuron.variable);
            debug_assert!(own_coefficient != 0.0);
            let factor = -1.0 / own_coefficient;

            net.set_bias(
                new_layer_index,
                new_neuron.neuron,
                factor * -equation.scalar(),
            );

            for (variable, coefficient) in equation.addends() {
                if variable == new_neuron.variable {
                    continue;
                }
                let source_layer = state.handled_variable_to_layer[&variable];
                let source_neuron = net
                    .layer(source_layer)
                    .variable_to_neuron(variable)
                    .expect("handled variable has a neuron");
                assembled
                    .entry(source_layer)
                    .or_insert_with(|| {
                        SparseMatrix::new(net.layer(source_layer).size(), new_neurons.len())
                    })
                    .set(source_neuron, new_neuron.neuron, factor * coefficient);
            }
        }

        for (source_layer, weights) in assembled {
            net.add_layer_dependency(source_layer, new_layer_index);
            for source_neuron in 0..weights.num_rows() {
                for entry in weights.row(source_neuron).iter() {
                    net.set_weight(
                        source_layer,
                        source_neuron,
                        new_layer_index,
                        entry.index,
                        entry.value,
                    );
                }
            }
        }

        true
    }

    /// Takes every unhandled unary constraint of `kind` whose b variable is
    /// already handled and whose f variable is not. Leaky ReLU layers also
    /// require a uniform slope.
    fn try_unary_layer(
        &self,
        net: &mut NetworkReasoner,
        state: &mut LiftState,
        new_layer_index: usize,
        kind: ConstraintKind,
        config: &Config,
    ) -> bool {
        let from_piecewise = !matches!(kind, ConstraintKind::Round | ConstraintKind::Sigmoid);
        let list = if from_piecewise {
            self.piecewise_constraints()
        } else {
            self.nonlinear_constraints()
        };

        let mut new_neurons: Vec<(Variable, Variable)> = Vec::new(); // (f, b)
        let mut taken: Vec<usize> = Vec::new();
        let mut current_source_layer = 0usize;
        let mut alpha: Option<f64> = None;

        for (index, constraint) in list.iter().enumerate() {
            let handled_set = if from_piecewise {
                &state.handled_piecewise
            } else {
                &state.handled_nonlinear
            };
            if handled_set.contains(&index) {
                continue;
            }
            if constraint.kind() != kind {
                continue;
            }
            let (b, f, slope) = unary_parts(constraint.as_ref()).expect("unary constraint");

            let Some(&b_layer) = state.handled_variable_to_layer.get(&b) else {
                continue;
            };
            if config.ensure_same_source_layer
                && !new_neurons.is_empty()
                && b_layer != current_source_layer
            {
                continue;
            }
            if let (Some(existing), Some(slope)) = (alpha, slope) {
                if existing != slope {
                    continue;
                }
            }
            if state.handled_variable_to_layer.contains_key(&f) {
                continue;
            }

            if new_neurons.is_empty() {
                current_source_layer = b_layer;
            }
            if alpha.is_none() {
                alpha = slope;
            }
            new_neurons.push((f, b));
            taken.push(index);
        }

        if new_neurons.is_empty() {
            return false;
        }

        for &index in &taken {
            if from_piecewise {
                state.handled_piecewise.insert(index);
                state.topological_order.push(index);
            } else {
                state.handled_nonlinear.insert(index);
            }
        }

        net.add_layer(new_layer_index, layer_kind_for(kind), new_neurons.len());
        if let Some(alpha) = alpha {
            net.layer_mut(new_layer_index).set_alpha(alpha);
        }

        for (neuron, &(f, b)) in new_neurons.iter().enumerate() {
            state.handled_variable_to_layer.insert(f, new_layer_index);

            let layer = net.layer_mut(new_layer_index);
            layer.set_lb(neuron, self.bounds().lower(f));
            layer.set_ub(neuron, self.bounds().upper(f));

            let source_layer = state.handled_variable_to_layer[&b];
            let source_neuron = net
                .layer(source_layer)
                .variable_to_neuron(b)
                .expect("handled variable has a neuron");

            net.add_layer_dependency(source_layer, new_layer_index);
            net.set_neuron_variable(NeuronIndex::new(new_layer_index, neuron), f);
            net.add_activation_source(
                NeuronIndex::new(source_layer, source_neuron),
                NeuronIndex::new(new_layer_index, neuron),
            );
        }

        true
    }

    /// Max layers require all element variables to be handled already.
    fn try_max_layer(
        &self,
        net: &mut NetworkReasoner,
        state: &mut LiftState,
        new_layer_index: usize,
        config: &Config,
    ) -> bool {
        let mut new_neurons: Vec<(Variable, Vec<Variable>)> = Vec::new();
        let mut current_source_layer = 0usize;

        for (index, constraint) in self.piecewise_constraints().iter().enumerate() {
            if state.handled_piecewise.contains(&index) {
                continue;
            }
            if constraint.kind() != ConstraintKind::Max {
                continue;
            }
            let max = constraint
                .as_any()
                .downcast_ref::<MaxConstraint>()
                .expect("kind() said max");

            let mut missing_input = false;
            let mut source_layer_differs = false;
            for &element in max.elements() {
                match state.handled_variable_to_layer.get(&element) {
                    None => {
                        missing_input = true;
                        break;
                    }
                    Some(&layer) => {
                        if config.ensure_same_source_layer
                            && !new_neurons.is_empty()
                            && layer != current_source_layer
                        {
                            source_layer_differs = true;
                            break;
                        }
                    }
                }
            }
            if missing_input || source_layer_differs {
                continue;
            }
            if state.handled_variable_to_layer.contains_key(&max.f()) {
                continue;
            }

            if new_neurons.is_empty() {
                current_source_layer = state.handled_variable_to_layer[&max.elements()[0]];
            }
            new_neurons.push((max.f(), max.elements().to_vec()));
            state.handled_piecewise.insert(index);
            state.topological_order.push(index);
        }

        if new_neurons.is_empty() {
            return false;
        }

        net.add_layer(new_layer_index, LayerKind::Max, new_neurons.len());
        self.wire_multi_source_layer(net, state, new_layer_index, &new_neurons);
        true
    }

    /// Bilinear layers: both factors handled, the product not.
    fn try_bilinear_layer(
        &self,
        net: &mut NetworkReasoner,
        state: &mut LiftState,
        new_layer_index: usize,
    ) -> bool {
        let mut new_neurons: Vec<(Variable, Vec<Variable>)> = Vec::new();

        for (index, constraint) in self.nonlinear_constraints().iter().enumerate() {
            if state.handled_nonlinear.contains(&index) {
                continue;
            }
            if constraint.kind() != ConstraintKind::Bilinear {
                continue;
            }
            let bilinear = constraint
                .as_any()
                .downcast_ref::<BilinearConstraint>()
                .expect("kind() said bilinear");

            if bilinear
                .bs()
                .iter()
                .any(|b| !state.handled_variable_to_layer.contains_key(b))
            {
                continue;
            }
            if state.handled_variable_to_layer.contains_key(&bilinear.f()) {
                continue;
            }

            new_neurons.push((bilinear.f(), bilinear.bs().to_vec()));
            state.handled_nonlinear.insert(index);
        }

        if new_neurons.is_empty() {
            return false;
        }

        net.add_layer(new_layer_index, LayerKind::Bilinear, new_neurons.len());
        self.wire_multi_source_layer(net, state, new_layer_index, &new_neurons);
        true
    }

    /// Softmax layers: all inputs handled, all outputs not. Within the layer,
    /// outputs follow the neuron order of their paired inputs, so that
    /// neuron i corresponds to the softmax output of source neuron i.
    fn try_softmax_layer(
        &self,
        net: &mut NetworkReasoner,
        state: &mut LiftState,
        new_layer_index: usize,
        config: &Config,
    ) -> bool {
        let mut new_neurons: Vec<(Variable, Vec<Variable>)> = Vec::new();
        let mut current_source_layer = 0usize;

        for (index, constraint) in self.nonlinear_constraints().iter().enumerate() {
            if state.handled_nonlinear.contains(&index) {
                continue;
            }
            if constraint.kind() != ConstraintKind::Softmax {
                continue;
            }
            let softmax = constraint
                .as_any()
                .downcast_ref::<SoftmaxConstraint>()
                .expect("kind() said softmax");

            let mut missing_input = false;
            let mut source_layer_differs = false;
            for input in softmax.inputs() {
                match state.handled_variable_to_layer.get(input) {
                    None => {
                        missing_input = true;
                        break;
                    }
                    Some(&layer) => {
                        if config.ensure_same_source_layer
                            && !new_neurons.is_empty()
                            && layer != current_source_layer
                        {
                            source_layer_differs = true;
                            break;
                        }
                    }
                }
            }
            if missing_input || source_layer_differs {
                continue;
            }
            if softmax
                .outputs()
                .iter()
                .any(|output| state.handled_variable_to_layer.contains_key(output))
            {
                continue;
            }

            let source_layer = state.handled_variable_to_layer[&softmax.inputs()[0]];
            if new_neurons.is_empty() {
                current_source_layer = source_layer;
            }

            let mut by_neuron: Vec<(usize, Variable)> = softmax
                .inputs()
                .iter()
                .map(|&input| {
                    let neuron = net
                        .layer(source_layer)
                        .variable_to_neuron(input)
                        .expect("handled variable has a neuron");
                    let output = softmax.output_for_input(input).expect("paired output");
                    (neuron, output)
                })
                .collect();
            by_neuron.sort_by_key(|&(neuron, _)| neuron);

            for (_, output) in by_neuron {
                new_neurons.push((output, softmax.inputs().to_vec()));
            }
            state.handled_nonlinear.insert(index);
        }

        if new_neurons.is_empty() {
            return false;
        }

        net.add_layer(new_layer_index, LayerKind::Softmax, new_neurons.len());
        self.wire_multi_source_layer(net, state, new_layer_index, &new_neurons);
        true
    }

    fn wire_multi_source_layer(
        &self,
        net: &mut NetworkReasoner,
        state: &mut LiftState,
        new_layer_index: usize,
        new_neurons: &[(Variable, Vec<Variable>)],
    ) {
        for (neuron, (f, sources)) in new_neurons.iter().enumerate() {
            state.handled_variable_to_layer.insert(*f, new_layer_index);

            let layer = net.layer_mut(new_layer_index);
            layer.set_lb(neuron, self.bounds().lower(*f));
            layer.set_ub(neuron, self.bounds().upper(*f));
            net.set_neuron_variable(NeuronIndex::new(new_layer_index, neuron), *f);

            for &source_variable in sources {
                let source_layer = state.handled_variable_to_layer[&source_variable];
                let source_neuron = net
                    .layer(source_layer)
                    .variable_to_neuron(source_variable)
                    .expect("handled variable has a neuron");
                net.add_layer_dependency(source_layer, new_layer_index);
                net.add_activation_source(
                    NeuronIndex::new(source_layer, source_neuron),
                    NeuronIndex::new(new_layer_index, neuron),
                );
            }
        }
    }

    /// Composes consecutive weighted-sum layers in the graph and re-encodes
    /// the affine layers as query equations. Variables marked as inputs or
    /// outputs, or appearing in unhandled constraints, pin their layers.
    pub fn merge_consecutive_weighted_sum_layers(
        &mut self,
        unhandled_equations: &[Equation],
        vars_in_unhandled_constraints: &BTreeSet<Variable>,
    ) -> usize {
        let Some(mut net) = self.network_mut().map(std::mem::take) else {
            return 0;
        };

        let mut protected: BTreeSet<Variable> = vars_in_unhandled_constraints.clone();
        protected.extend(self.input_variables());
        protected.extend(self.output_variables());
        for constraint in self
            .piecewise_constraints()
            .iter()
            .chain(self.nonlinear_constraints().iter())
        {
            protected.extend(constraint.participating_variables());
        }

        let merged = net.merge_consecutive_weighted_sum_layers(&protected);
        if merged > 0 {
            let mut equations = unhandled_equations.to_vec();
            equations.extend(net.encode_affine_layers());
            self.set_equations(equations);
        }
        self.set_network(Some(net));
        merged
    }
}
