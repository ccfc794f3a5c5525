//! Owns the layer arena and drives the propagation passes until a fixed
//! point, the sweep budget, or the deadline. Layers refer to each other by
//! index; a layer only ever reads layers with strictly smaller indices, so
//! every pass works on a split borrow of the arena.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::layer::{Layer, LayerKind};
use crate::config::{BoundTighteningMode, Config};
use crate::constraints::PiecewiseConstraint;
use crate::errors::{VfError, VfResult};
use crate::query::{BoundStore, Equation, EquationKind};
use crate::types::{BoundKind, NeuronIndex, Tightening, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// No bound changed in the last sweep.
    FixedPoint,
    /// The sweep budget ran out while bounds were still moving.
    BudgetExhausted,
    /// The deadline passed; bounds already published remain valid.
    Interrupted,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkReasoner {
    layers: Vec<Layer>,
    /// Constraints hoisted out of the query during lifting, in topological
    /// order.
    constraints: Vec<Box<dyn PiecewiseConstraint>>,
    #[serde(skip)]
    tightening_log: Vec<Tightening>,
}

impl NetworkReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&mut self, index: usize, kind: LayerKind, size: usize) {
        debug_assert_eq!(index, self.layers.len(), "layers are added in order");
        self.layers.push(Layer::new(index, kind, size));
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    pub fn layer_mut(&mut self, index: usize) -> &mut Layer {
        &mut self.layers[index]
    }

    pub fn add_layer_dependency(&mut self, source: usize, target: usize) {
        debug_assert!(source < target, "the DAG has no cycles");
        let source_size = self.layers[source].size();
        self.layers[target].add_source_layer(source, source_size);
    }

    pub fn set_weight(
        &mut self,
        source_layer: usize,
        source_neuron: usize,
        target_layer: usize,
        target_neuron: usize,
        weight: f64,
    ) {
        self.layers[target_layer].set_weight(source_layer, source_neuron, target_neuron, weight);
    }

    pub fn set_bias(&mut self, layer: usize, neuron: usize, bias: f64) {
        self.layers[layer].set_bias(neuron, bias);
    }

    pub fn set_neuron_variable(&mut self, index: NeuronIndex, variable: Variable) {
        self.layers[index.layer].set_neuron_variable(index.neuron, variable);
    }

    pub fn add_activation_source(&mut self, source: NeuronIndex, target: NeuronIndex) {
        self.layers[target.layer].add_activation_source(source, target.neuron);
    }

    pub fn add_constraint_in_topological_order(
        &mut self,
        constraint: Box<dyn PiecewiseConstraint>,
    ) {
        self.constraints.push(constraint);
    }

    pub fn constraints_in_topological_order(&self) -> &[Box<dyn PiecewiseConstraint>] {
        &self.constraints
    }

    pub fn constraints_in_topological_order_mut(
        &mut self,
    ) -> &mut Vec<Box<dyn PiecewiseConstraint>> {
        &mut self.constraints
    }

    /// Allocates the symbolic buffers once the graph is complete.
    pub fn finalize(&mut self, config: &Config) {
        if self.layers.is_empty() {
            return;
        }
        if config.bound_tightening == BoundTighteningMode::SymbolicTightening {
            let input_size = self.layers[0].size();
            for layer in self.layers.iter_mut() {
                layer.allocate_symbolic(input_size);
            }
        }
    }

    /// Tightenings published by the last call to `propagate`, in order.
    pub fn tightening_log(&self) -> &[Tightening] {
        &self.tightening_log
    }

    /// Marks the neuron carrying `variable` as fixed to `value` in every
    /// layer, and informs the hoisted constraints.
    pub fn eliminate_variable(&mut self, variable: Variable, value: f64) {
        for layer in self.layers.iter_mut() {
            layer.eliminate_variable(variable, value);
        }
        for constraint in self.constraints.iter_mut() {
            if constraint.participates_in(variable) {
                constraint.eliminate_variable(variable, value);
            }
        }
    }

    pub fn obtain_current_bounds(&mut self, bounds: &BoundStore) {
        for layer in self.layers.iter_mut() {
            layer.obtain_current_bounds(bounds);
        }
    }

    /// Concrete forward evaluation; `inputs` in input-layer neuron order.
    pub fn evaluate(&mut self, inputs: &[f64]) -> VfResult<Vec<f64>> {
        let input_size = self.layers[0].size();
        if inputs.len() != input_size {
            return Err(VfError::InvalidInputDimension {
                expected: input_size,
                actual: inputs.len(),
            });
        }
        self.layers[0].set_assignment(inputs);
        for index in 1..self.layers.len() {
            let (earlier, rest) = self.layers.split_at_mut(index);
            rest[0].compute_assignment(earlier);
        }
        let output = self.layers.last().expect("at least the input layer");
        Ok((0..output.size()).map(|i| output.assignment(i)).collect())
    }

    /// Runs sweeps until no bound changes, the budget runs out, or the
    /// deadline passes. Accepted tightenings land in the log and in `bounds`,
    /// and the hoisted constraints are notified of each.
    pub fn propagate(
        &mut self,
        bounds: &mut BoundStore,
        config: &Config,
        deadline: Option<Instant>,
    ) -> VfResult<PropagationOutcome> {
        self.tightening_log.clear();
        if self.layers.is_empty() || config.bound_tightening == BoundTighteningMode::None {
            return Ok(PropagationOutcome::FixedPoint);
        }

        let symbolic = config.bound_tightening == BoundTighteningMode::SymbolicTightening;

        for sweep in 0..config.sweep_budget {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    info!(sweep, "propagation interrupted by deadline");
                    return Ok(PropagationOutcome::Interrupted);
                }
            }

            self.obtain_current_bounds(bounds);

            let mut sink = Vec::new();
            if symbolic {
                self.layers[0].symbolic_propagate(&[], config, &mut sink);
            }
            for index in 1..self.layers.len() {
                let (earlier, rest) = self.layers.split_at_mut(index);
                let layer = &mut rest[0];
                layer.interval_propagate(earlier, config, &mut sink);
                if symbolic {
                    layer.symbolic_propagate(earlier, config, &mut sink);
                }
            }

            let mut changed = self.publish(sink, bounds, config)?;
            changed |= self.drain_entailed(bounds, config)?;

            debug!(sweep, changed, "propagation sweep done");
            if !changed {
                return Ok(PropagationOutcome::FixedPoint);
            }
        }

        warn!(
            budget = config.sweep_budget,
            "propagation sweep budget exhausted; keeping the bounds found so far"
        );
        Ok(PropagationOutcome::BudgetExhausted)
    }

    /// Applies tightenings to the store, logs the accepted ones, notifies the
    /// hoisted constraints, and detects empty intervals.
    fn publish(
        &mut self,
        tightenings: Vec<Tightening>,
        bounds: &mut BoundStore,
        config: &Config,
    ) -> VfResult<bool> {
        let mut changed = false;
        for t in tightenings {
            let improved = match t.kind {
                BoundKind::Lower => bounds.tighten_lower(t.variable, t.value),
                BoundKind::Upper => bounds.tighten_upper(t.variable, t.value),
            };
            if !improved {
                continue;
            }
            changed = true;
            self.tightening_log.push(t);

            let lower = bounds.lower(t.variable);
            let upper = bounds.upper(t.variable);
            if lower > upper + config.epsilon {
                return Err(VfError::InfeasibleBounds {
                    variable: t.variable,
                    lower,
                    upper,
                });
            }

            for constraint in self.constraints.iter_mut() {
                if !constraint.participates_in(t.variable) {
                    continue;
                }
                match t.kind {
                    BoundKind::Lower => constraint.notify_lower_bound(t.variable, t.value),
                    BoundKind::Upper => constraint.notify_upper_bound(t.variable, t.value),
                }
            }
        }
        Ok(changed)
    }

    /// Folds the hoisted constraints' entailed tightenings into the store
    /// until quiescent, bounded by the sweep budget.
    fn drain_entailed(&mut self, bounds: &mut BoundStore, config: &Config) -> VfResult<bool> {
        let mut changed = false;
        for _ in 0..=config.sweep_budget {
            let mut entailed = Vec::new();
            for constraint in self.constraints.iter() {
                constraint.entailed_tightenings(&mut entailed);
            }
            let fresh: Vec<Tightening> = entailed
                .into_iter()
                .filter(|t| match t.kind {
                    BoundKind::Lower => t.value > bounds.lower(t.variable),
                    BoundKind::Upper => t.value < bounds.upper(t.variable),
                })
                .collect();
            if fresh.is_empty() {
                return Ok(changed);
            }
            if !self.publish(fresh, bounds, config)? {
                return Ok(changed);
            }
            changed = true;
        }
        Ok(changed)
    }

    /// (kind, size, source layer indices) per layer, for structural
    /// comparison of two graphs.
    pub fn topology(&self) -> Vec<(LayerKind, usize, Vec<usize>)> {
        self.layers
            .iter()
            .map(|layer| {
                (
                    layer.kind(),
                    layer.size(),
                    layer.source_layers().keys().copied().collect(),
                )
            })
            .collect()
    }

    pub fn neuron_variable_map(&self) -> BTreeMap<NeuronIndex, Variable> {
        let mut map = BTreeMap::new();
        for (index, layer) in self.layers.iter().enumerate() {
            for neuron in 0..layer.size() {
                if let Some(variable) = layer.neuron_to_variable(neuron) {
                    map.insert(NeuronIndex::new(index, neuron), variable);
                }
            }
        }
        map
    }

    /// Linear equations re-encoding every weighted-sum layer, used after
    /// merging to rebuild the query's equation list.
    pub fn encode_affine_layers(&self) -> Vec<Equation> {
        let mut equations = Vec::new();
        for layer in &self.layers {
            if layer.kind() != LayerKind::WeightedSum {
                continue;
            }
            for i in 0..layer.size() {
                let Some(f) = layer.neuron_to_variable(i) else {
                    continue;
                };
                let mut eq = Equation::new(EquationKind::Equality);
                let mut scalar = -layer.bias(i);
                for (&source_index, &source_size) in layer.source_layers() {
                    let source = &self.layers[source_index];
                    for j in 0..source_size {
                        let weight = layer.weight(source_index, j, i);
                        if weight == 0.0 {
                            continue;
                        }
                        match source.neuron_to_variable(j) {
                            Some(x) => eq.add_addend(weight, x),
                            None => {
                                let value = source.eliminated_value(j).unwrap_or(0.0);
                                scalar -= weight * value;
                            }
                        }
                    }
                }
                eq.add_addend(-1.0, f);
                eq.set_scalar(scalar);
                equations.push(eq);
            }
        }
        equations
    }

    /// Composes away weighted-sum layers whose single successor is another
    /// weighted-sum layer. `protected` variables pin their layer in place.
    /// Idempotent: a second call merges nothing further.
    pub fn merge_consecutive_weighted_sum_layers(
        &mut self,
        protected: &BTreeSet<Variable>,
    ) -> usize {
        let mut merged = 0;
        loop {
            let Some(middle) = self.find_mergeable_layer(protected) else {
                return merged;
            };
            self.merge_layer_into_successor(middle);
            merged += 1;
            info!(middle, "merged a weighted-sum layer into its successor");
        }
    }

    fn find_mergeable_layer(&self, protected: &BTreeSet<Variable>) -> Option<usize> {
        for middle in 1..self.layers.len().saturating_sub(1) {
            let layer = &self.layers[middle];
            let successor = &self.layers[middle + 1];
            if layer.kind() != LayerKind::WeightedSum
                || successor.kind() != LayerKind::WeightedSum
            {
                continue;
            }
            // The successor must read only the middle layer, and nothing else
            // may read the middle layer.
            if successor.source_layers().len() != 1
                || !successor.source_layers().contains_key(&middle)
            {
                continue;
            }
            let mut middle_read_elsewhere = false;
            for (other_index, other) in self.layers.iter().enumerate() {
                if other_index == middle + 1 {
                    continue;
                }
                if other.source_layers().contains_key(&middle) {
                    middle_read_elsewhere = true;
                    break;
                }
            }
            if middle_read_elsewhere {
                continue;
            }
            if layer.variables().any(|v| protected.contains(&v)) {
                continue;
            }
            return Some(middle);
        }
        None
    }

    fn merge_layer_into_successor(&mut self, middle: usize) {
        let middle_layer = self.layers[middle].clone();
        let w2 = self.layers[middle + 1].weight_matrix(middle).clone();

        // b <- b2 + b1 * W2, W <- W1 * W2 per source of the middle layer.
        let bias_through = middle_layer.bias_vector().dot(&w2);
        {
            let successor = &mut self.layers[middle + 1];
            successor.remove_source_layer(middle);
            for i in 0..successor.size() {
                let bias = successor.bias(i) + bias_through[i];
                successor.set_bias(i, bias);
            }
        }
        for (&source_index, &source_size) in middle_layer.source_layers() {
            let composed = middle_layer.weight_matrix(source_index).dot(&w2);
            let successor = &mut self.layers[middle + 1];
            successor.add_source_layer(source_index, source_size);
            for j in 0..source_size {
                for i in 0..composed.ncols() {
                    successor.set_weight(source_index, j, i, composed[[j, i]]);
                }
            }
        }

        self.layers.remove(middle);
        for (index, layer) in self.layers.iter_mut().enumerate() {
            layer.set_index(index);
            layer.shift_layer_references_after(middle);
        }
    }
}
