//! A typed layer in the reasoner's DAG, with the three per-kind analyses:
//! concrete assignment, interval arithmetic, and symbolic (affine) bounds
//! expressed over the input layer.
//!
//! Weight matrices are stored row-major as (source neuron, target neuron);
//! symbolic coefficient matrices as (input neuron, target neuron). Both are
//! allocated once at construction and zeroed between sweeps.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::softmax_bounds;
use crate::config::{Config, SoftmaxBounds};
use crate::constraints::sigmoid::{sigmoid, sigmoid_derivative};
use crate::query::BoundStore;
use crate::types::{NeuronIndex, Tightening, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    Input,
    WeightedSum,
    Relu,
    LeakyRelu,
    Sign,
    AbsoluteValue,
    Round,
    Sigmoid,
    Softmax,
    Bilinear,
    Max,
}

/// Symbolic rows and the scalars bounding them over the input box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolicState {
    /// (input layer size) x (layer size) coefficient rows.
    pub lb: Array2<f64>,
    pub ub: Array2<f64>,
    pub lower_bias: Array1<f64>,
    pub upper_bias: Array1<f64>,
    pub lb_of_lb: Array1<f64>,
    pub ub_of_lb: Array1<f64>,
    pub lb_of_ub: Array1<f64>,
    pub ub_of_ub: Array1<f64>,
}

impl SymbolicState {
    fn new(input_layer_size: usize, size: usize) -> Self {
        Self {
            lb: Array2::zeros((input_layer_size, size)),
            ub: Array2::zeros((input_layer_size, size)),
            lower_bias: Array1::zeros(size),
            upper_bias: Array1::zeros(size),
            lb_of_lb: Array1::zeros(size),
            ub_of_lb: Array1::zeros(size),
            lb_of_ub: Array1::zeros(size),
            ub_of_ub: Array1::zeros(size),
        }
    }

    fn zero_rows(&mut self) {
        self.lb.fill(0.0);
        self.ub.fill(0.0);
    }
}

/// Collapses the state of eliminated neurons to their constant value.
fn apply_eliminated(sym: &mut SymbolicState, eliminated: &BTreeMap<usize, f64>) {
    for (&i, &value) in eliminated {
        sym.lb.column_mut(i).fill(0.0);
        sym.ub.column_mut(i).fill(0.0);
        sym.lower_bias[i] = value;
        sym.upper_bias[i] = value;
        sym.lb_of_lb[i] = value;
        sym.ub_of_lb[i] = value;
        sym.lb_of_ub[i] = value;
        sym.ub_of_ub[i] = value;
    }
}

/// Copies the source neuron's symbolic column and scalars into slot `i`.
fn inherit_from_source(sym: &mut SymbolicState, i: usize, source: &Layer, source_neuron: usize) {
    let src = source.symbolic().expect("source layer has no symbolic state");
    sym.lb.column_mut(i).assign(&src.lb.column(source_neuron));
    sym.ub.column_mut(i).assign(&src.ub.column(source_neuron));
    sym.lower_bias[i] = src.lower_bias[source_neuron];
    sym.upper_bias[i] = src.upper_bias[source_neuron];
    sym.lb_of_lb[i] = src.lb_of_lb[source_neuron];
    sym.ub_of_lb[i] = src.ub_of_lb[source_neuron];
    sym.lb_of_ub[i] = src.lb_of_ub[source_neuron];
    sym.ub_of_ub[i] = src.ub_of_ub[source_neuron];
}

/// Evaluates one neuron's symbolic rows over the input box, producing the
/// four bound-of-bound scalars.
fn close_neuron(
    sym: &SymbolicState,
    i: usize,
    input_lb: &Array1<f64>,
    input_ub: &Array1<f64>,
) -> (f64, f64, f64, f64) {
    let mut lb_of_lb = sym.lower_bias[i];
    let mut ub_of_lb = sym.lower_bias[i];
    let mut lb_of_ub = sym.upper_bias[i];
    let mut ub_of_ub = sym.upper_bias[i];

    for j in 0..input_lb.len() {
        let entry = sym.lb[[j, i]];
        if entry >= 0.0 {
            lb_of_lb += entry * input_lb[j];
            ub_of_lb += entry * input_ub[j];
        } else {
            lb_of_lb += entry * input_ub[j];
            ub_of_lb += entry * input_lb[j];
        }

        let entry = sym.ub[[j, i]];
        if entry >= 0.0 {
            lb_of_ub += entry * input_lb[j];
            ub_of_ub += entry * input_ub[j];
        } else {
            lb_of_ub += entry * input_ub[j];
            ub_of_ub += entry * input_lb[j];
        }
    }

    (lb_of_lb, ub_of_lb, lb_of_ub, ub_of_ub)
}

/// Closes every live neuron over the input box. The per-neuron evaluations
/// are independent; results are written back in neuron order so the
/// published tightenings stay deterministic.
fn close_over_input_box(
    sym: &mut SymbolicState,
    input_lb: &Array1<f64>,
    input_ub: &Array1<f64>,
    eliminated: &BTreeMap<usize, f64>,
) {
    let size = sym.lower_bias.len();
    let closes: Vec<Option<(f64, f64, f64, f64)>> = {
        let sym_ref: &SymbolicState = sym;
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            (0..size)
                .into_par_iter()
                .map(|i| {
                    (!eliminated.contains_key(&i))
                        .then(|| close_neuron(sym_ref, i, input_lb, input_ub))
                })
                .collect()
        }
        #[cfg(not(feature = "rayon"))]
        {
            (0..size)
                .map(|i| {
                    (!eliminated.contains_key(&i))
                        .then(|| close_neuron(sym_ref, i, input_lb, input_ub))
                })
                .collect()
        }
    };
    for (i, close) in closes.into_iter().enumerate() {
        if let Some((lb_of_lb, ub_of_lb, lb_of_ub, ub_of_ub)) = close {
            sym.lb_of_lb[i] = lb_of_lb;
            sym.ub_of_lb[i] = ub_of_lb;
            sym.lb_of_ub[i] = lb_of_ub;
            sym.ub_of_ub[i] = ub_of_ub;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    index: usize,
    kind: LayerKind,
    size: usize,
    /// Slope of a leaky ReLU layer; unused elsewhere.
    alpha: f64,
    /// Source layer index -> source layer size.
    source_layers: BTreeMap<usize, usize>,
    weights: BTreeMap<usize, Array2<f64>>,
    positive_weights: BTreeMap<usize, Array2<f64>>,
    negative_weights: BTreeMap<usize, Array2<f64>>,
    bias: Array1<f64>,
    assignment: Array1<f64>,
    lb: Array1<f64>,
    ub: Array1<f64>,
    activation_sources: BTreeMap<usize, Vec<NeuronIndex>>,
    neuron_to_variable: BTreeMap<usize, Variable>,
    variable_to_neuron: BTreeMap<Variable, usize>,
    eliminated: BTreeMap<usize, f64>,
    input_layer_size: usize,
    symbolic: Option<SymbolicState>,
}

impl Layer {
    pub fn new(index: usize, kind: LayerKind, size: usize) -> Self {
        Self {
            index,
            kind,
            size,
            alpha: 0.0,
            source_layers: BTreeMap::new(),
            weights: BTreeMap::new(),
            positive_weights: BTreeMap::new(),
            negative_weights: BTreeMap::new(),
            bias: Array1::zeros(size),
            assignment: Array1::zeros(size),
            lb: Array1::from_elem(size, f64::NEG_INFINITY),
            ub: Array1::from_elem(size, f64::INFINITY),
            activation_sources: BTreeMap::new(),
            neuron_to_variable: BTreeMap::new(),
            variable_to_neuron: BTreeMap::new(),
            eliminated: BTreeMap::new(),
            input_layer_size: if kind == LayerKind::Input { size } else { 0 },
            symbolic: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }

    pub fn source_layers(&self) -> &BTreeMap<usize, usize> {
        &self.source_layers
    }

    pub fn add_source_layer(&mut self, layer_number: usize, layer_size: usize) {
        debug_assert!(self.kind != LayerKind::Input);
        if self.source_layers.contains_key(&layer_number) {
            return;
        }
        self.source_layers.insert(layer_number, layer_size);
        if self.kind == LayerKind::WeightedSum {
            self.weights
                .insert(layer_number, Array2::zeros((layer_size, self.size)));
            self.positive_weights
                .insert(layer_number, Array2::zeros((layer_size, self.size)));
            self.negative_weights
                .insert(layer_number, Array2::zeros((layer_size, self.size)));
        }
    }

    /// Renumbers references to layers past a removed layer index.
    pub(crate) fn shift_layer_references_after(&mut self, removed: usize) {
        fn shift_keys<V>(map: &mut BTreeMap<usize, V>, removed: usize) {
            let taken = std::mem::take(map);
            for (key, value) in taken {
                let key = if key > removed { key - 1 } else { key };
                map.insert(key, value);
            }
        }
        shift_keys(&mut self.source_layers, removed);
        shift_keys(&mut self.weights, removed);
        shift_keys(&mut self.positive_weights, removed);
        shift_keys(&mut self.negative_weights, removed);
        for sources in self.activation_sources.values_mut() {
            for source in sources.iter_mut() {
                if source.layer > removed {
                    source.layer -= 1;
                }
            }
        }
    }

    pub(crate) fn remove_source_layer(&mut self, layer_number: usize) {
        self.source_layers.remove(&layer_number);
        self.weights.remove(&layer_number);
        self.positive_weights.remove(&layer_number);
        self.negative_weights.remove(&layer_number);
    }

    /// Writes a weight, maintaining the cached positive/negative halves.
    pub fn set_weight(
        &mut self,
        source_layer: usize,
        source_neuron: usize,
        target_neuron: usize,
        weight: f64,
    ) {
        let w = self
            .weights
            .get_mut(&source_layer)
            .expect("source layer not registered");
        w[[source_neuron, target_neuron]] = weight;
        let pos = self.positive_weights.get_mut(&source_layer).unwrap();
        let neg = self.negative_weights.get_mut(&source_layer).unwrap();
        if weight > 0.0 {
            pos[[source_neuron, target_neuron]] = weight;
            neg[[source_neuron, target_neuron]] = 0.0;
        } else {
            pos[[source_neuron, target_neuron]] = 0.0;
            neg[[source_neuron, target_neuron]] = weight;
        }
    }

    pub fn weight(&self, source_layer: usize, source_neuron: usize, target_neuron: usize) -> f64 {
        self.weights[&source_layer][[source_neuron, target_neuron]]
    }

    pub fn weight_matrix(&self, source_layer: usize) -> &Array2<f64> {
        &self.weights[&source_layer]
    }

    pub fn set_bias(&mut self, neuron: usize, bias: f64) {
        self.bias[neuron] = bias;
    }

    pub fn bias(&self, neuron: usize) -> f64 {
        self.bias[neuron]
    }

    pub fn bias_vector(&self) -> &Array1<f64> {
        &self.bias
    }

    pub fn add_activation_source(&mut self, source: NeuronIndex, target_neuron: usize) {
        debug_assert!(matches!(
            self.kind,
            LayerKind::Relu
                | LayerKind::LeakyRelu
                | LayerKind::Sign
                | LayerKind::AbsoluteValue
                | LayerKind::Round
                | LayerKind::Sigmoid
                | LayerKind::Softmax
                | LayerKind::Bilinear
                | LayerKind::Max
        ));
        self.activation_sources
            .entry(target_neuron)
            .or_default()
            .push(source);
    }

    pub fn activation_sources(&self, neuron: usize) -> &[NeuronIndex] {
        self.activation_sources
            .get(&neuron)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn set_neuron_variable(&mut self, neuron: usize, variable: Variable) {
        debug_assert!(!self.eliminated.contains_key(&neuron));
        self.neuron_to_variable.insert(neuron, variable);
        self.variable_to_neuron.insert(variable, neuron);
    }

    pub fn neuron_to_variable(&self, neuron: usize) -> Option<Variable> {
        self.neuron_to_variable.get(&neuron).copied()
    }

    pub fn variable_to_neuron(&self, variable: Variable) -> Option<usize> {
        self.variable_to_neuron.get(&variable).copied()
    }

    pub fn variables(&self) -> impl Iterator<Item = Variable> + '_ {
        self.neuron_to_variable.values().copied()
    }

    /// Records that the neuron holding `variable` is fixed to a constant.
    pub fn eliminate_variable(&mut self, variable: Variable, value: f64) {
        let Some(neuron) = self.variable_to_neuron.remove(&variable) else {
            return;
        };
        self.neuron_to_variable.remove(&neuron);
        self.eliminated.insert(neuron, value);
    }

    pub fn neuron_eliminated(&self, neuron: usize) -> bool {
        self.eliminated.contains_key(&neuron)
    }

    pub fn eliminated_value(&self, neuron: usize) -> Option<f64> {
        self.eliminated.get(&neuron).copied()
    }

    pub fn lb(&self, neuron: usize) -> f64 {
        self.eliminated
            .get(&neuron)
            .copied()
            .unwrap_or(self.lb[neuron])
    }

    pub fn ub(&self, neuron: usize) -> f64 {
        self.eliminated
            .get(&neuron)
            .copied()
            .unwrap_or(self.ub[neuron])
    }

    pub fn set_lb(&mut self, neuron: usize, bound: f64) {
        debug_assert!(!self.eliminated.contains_key(&neuron));
        self.lb[neuron] = bound;
    }

    pub fn set_ub(&mut self, neuron: usize, bound: f64) {
        debug_assert!(!self.eliminated.contains_key(&neuron));
        self.ub[neuron] = bound;
    }

    pub fn assignment(&self, neuron: usize) -> f64 {
        self.assignment[neuron]
    }

    pub fn set_assignment(&mut self, values: &[f64]) {
        debug_assert!(self.eliminated.is_empty());
        self.assignment = Array1::from(values.to_vec());
    }

    pub fn symbolic(&self) -> Option<&SymbolicState> {
        self.symbolic.as_ref()
    }

    /// Allocates the symbolic arrays; called once the input layer size is
    /// known. The buffers persist across sweeps.
    pub fn allocate_symbolic(&mut self, input_layer_size: usize) {
        self.input_layer_size = input_layer_size;
        self.symbolic = Some(SymbolicState::new(input_layer_size, self.size));
    }

    /// Refreshes the concrete bounds from the query's store. Eliminated
    /// neurons keep their constant.
    pub fn obtain_current_bounds(&mut self, bounds: &BoundStore) {
        for i in 0..self.size {
            if let Some(&variable) = self.neuron_to_variable.get(&i) {
                self.lb[i] = bounds.lower(variable);
                self.ub[i] = bounds.upper(variable);
            } else if let Some(&value) = self.eliminated.get(&i) {
                self.lb[i] = value;
                self.ub[i] = value;
            }
        }
    }

    fn publish_lower(&mut self, neuron: usize, value: f64, sink: &mut Vec<Tightening>) {
        if self.lb[neuron] < value {
            self.lb[neuron] = value;
            if let Some(&variable) = self.neuron_to_variable.get(&neuron) {
                sink.push(Tightening::lower(variable, value));
            }
        }
    }

    fn publish_upper(&mut self, neuron: usize, value: f64, sink: &mut Vec<Tightening>) {
        if self.ub[neuron] > value {
            self.ub[neuron] = value;
            if let Some(&variable) = self.neuron_to_variable.get(&neuron) {
                sink.push(Tightening::upper(variable, value));
            }
        }
    }

    fn publish_from_symbolic(&mut self, sym: &SymbolicState, sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn input_box(earlier: &[Layer]) -> (Array1<f64>, Array1<f64>) {
        let input = &earlier[0];
        let lb = Array1::from_iter((0..input.size).map(|j| input.lb(j)));
        let ub = Array1::from_iter((0..input.size).map(|j| input.ub(j)));
        (lb, ub)
    }

    // ------------------------------------------------------------------
    // Concrete evaluation
    // ------------------------------------------------------------------

    /// Evaluates this layer from its sources' already-computed assignments.
    pub(crate) fn compute_assignment(&mut self, earlier: &[Layer]) {
        debug_assert!(self.kind != LayerKind::Input);

        match self.kind {
            LayerKind::WeightedSum => {
                self.assignment = self.bias.clone();
                let sources: Vec<usize> = self.source_layers.keys().copied().collect();
                for source_index in sources {
                    let product = earlier[source_index]
                        .assignment
                        .dot(&self.weights[&source_index]);
                    self.assignment += &product;
                }
            }
            LayerKind::Softmax => {
                for i in 0..self.size {
                    let sources = self.activation_sources(i);
                    let mut inputs = Vec::with_capacity(sources.len());
                    let mut output_index = 0;
                    for (position, source) in sources.iter().enumerate() {
                        if source.neuron == i {
                            output_index = position;
                        }
                        inputs.push(earlier[source.layer].assignment(source.neuron));
                    }
                    let outputs = crate::constraints::softmax::softmax(&inputs);
                    self.assignment[i] = outputs[output_index];
                }
            }
            LayerKind::Max => {
                for i in 0..self.size {
                    let mut best = f64::NEG_INFINITY;
                    for source in self.activation_sources(i) {
                        best = best.max(earlier[source.layer].assignment(source.neuron));
                    }
                    self.assignment[i] = best;
                }
            }
            LayerKind::Bilinear => {
                for i in 0..self.size {
                    let mut product = 1.0;
                    for source in self.activation_sources(i) {
                        product *= earlier[source.layer].assignment(source.neuron);
                    }
                    self.assignment[i] = product;
                }
            }
            _ => {
                let alpha = self.alpha;
                for i in 0..self.size {
                    let source = self.activation_sources(i)[0];
                    let x = earlier[source.layer].assignment(source.neuron);
                    self.assignment[i] = match self.kind {
                        LayerKind::Relu => x.max(0.0),
                        LayerKind::LeakyRelu => x.max(alpha * x),
                        LayerKind::AbsoluteValue => x.abs(),
                        LayerKind::Sign => {
                            if x < 0.0 {
                                -1.0
                            } else {
                                1.0
                            }
                        }
                        LayerKind::Round => x.round_ties_even(),
                        LayerKind::Sigmoid => sigmoid(x),
                        _ => unreachable!("unary activation expected"),
                    };
                }
            }
        }

        // Eliminated values prevail over whatever was computed.
        for (&i, &value) in &self.eliminated {
            self.assignment[i] = value;
        }
    }

    // ------------------------------------------------------------------
    // Interval arithmetic
    // ------------------------------------------------------------------

    pub(crate) fn interval_propagate(
        &mut self,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        debug_assert!(self.kind != LayerKind::Input);
        match self.kind {
            LayerKind::WeightedSum => self.interval_weighted_sum(earlier, sink),
            LayerKind::Relu => self.interval_relu(earlier, sink),
            LayerKind::AbsoluteValue => self.interval_absolute_value(earlier, sink),
            LayerKind::Sign => self.interval_sign(earlier, config, sink),
            LayerKind::Round => self.interval_round(earlier, sink),
            LayerKind::LeakyRelu => self.interval_leaky_relu(earlier, sink),
            LayerKind::Sigmoid => self.interval_sigmoid(earlier, sink),
            LayerKind::Max => self.interval_max(earlier, config, sink),
            LayerKind::Softmax => self.interval_softmax(earlier, config, sink),
            LayerKind::Bilinear => self.interval_bilinear(earlier, sink),
            LayerKind::Input => {}
        }
    }

    fn interval_weighted_sum(&mut self, earlier: &[Layer], sink: &mut Vec<Tightening>) {
        let mut new_lb = self.bias.clone();
        let mut new_ub = self.bias.clone();

        for (&source_index, &source_size) in &self.source_layers {
            let source = &earlier[source_index];
            let weights = &self.weights[&source_index];
            for i in 0..self.size {
                for j in 0..source_size {
                    let weight = weights[[j, i]];
                    let source_lb = source.lb(j);
                    let source_ub = source.ub(j);
                    if weight > 0.0 {
                        new_lb[i] += weight * source_lb;
                        new_ub[i] += weight * source_ub;
                    } else {
                        new_lb[i] += weight * source_ub;
                        new_ub[i] += weight * source_lb;
                    }
                }
            }
        }

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            self.publish_lower(i, new_lb[i], sink);
            self.publish_upper(i, new_ub[i], sink);
        }
    }

    fn unary_source_bounds(&self, earlier: &[Layer], neuron: usize) -> (f64, f64) {
        let source = self.activation_sources(neuron)[0];
        let layer = &earlier[source.layer];
        (layer.lb(source.neuron), layer.ub(source.neuron))
    }

    fn interval_relu(&mut self, earlier: &[Layer], sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (lb, ub) = self.unary_source_bounds(earlier, i);
            self.publish_lower(i, lb.max(0.0), sink);
            self.publish_upper(i, ub.max(0.0), sink);
        }
    }

    fn interval_absolute_value(&mut self, earlier: &[Layer], sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (lb, ub) = self.unary_source_bounds(earlier, i);
            if lb > 0.0 {
                self.publish_lower(i, lb, sink);
                self.publish_upper(i, ub, sink);
            } else if ub < 0.0 {
                self.publish_lower(i, -ub, sink);
                self.publish_upper(i, -lb, sink);
            } else {
                self.publish_lower(i, 0.0, sink);
                self.publish_upper(i, ub.max(-lb), sink);
            }
        }
    }

    fn interval_sign(&mut self, earlier: &[Layer], config: &Config, sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (lb, ub) = self.unary_source_bounds(earlier, i);
            let (new_lb, new_ub) = if !config.is_negative(lb) {
                (1.0, 1.0)
            } else if config.is_negative(ub) {
                (-1.0, -1.0)
            } else {
                (-1.0, 1.0)
            };
            self.publish_lower(i, new_lb, sink);
            self.publish_upper(i, new_ub, sink);
        }
    }

    fn interval_round(&mut self, earlier: &[Layer], sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (lb, ub) = self.unary_source_bounds(earlier, i);
            self.publish_lower(i, lb.round_ties_even(), sink);
            self.publish_upper(i, ub.round_ties_even(), sink);
        }
    }

    fn interval_leaky_relu(&mut self, earlier: &[Layer], sink: &mut Vec<Tightening>) {
        let alpha = self.alpha;
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (lb, ub) = self.unary_source_bounds(earlier, i);
            if lb > 0.0 {
                self.publish_lower(i, lb, sink);
                self.publish_upper(i, ub, sink);
            } else if ub < 0.0 {
                self.publish_lower(i, alpha * lb, sink);
                self.publish_upper(i, alpha * ub, sink);
            } else {
                self.publish_lower(i, alpha * lb, sink);
                self.publish_upper(i, ub, sink);
            }
        }
    }

    fn interval_sigmoid(&mut self, earlier: &[Layer], sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (lb, ub) = self.unary_source_bounds(earlier, i);
            self.publish_lower(i, sigmoid(lb), sink);
            self.publish_upper(i, sigmoid(ub), sink);
        }
    }

    /// Per neuron: the winning element (largest lower bound), the winner's
    /// bounds, the largest upper bound overall, and whether the phase fixed.
    fn max_phase_info(
        &self,
        earlier: &[Layer],
        neuron: usize,
        config: &Config,
    ) -> (NeuronIndex, f64, f64, f64, bool) {
        let sources = self.activation_sources(neuron);
        let mut winner = sources[0];
        let mut max_lb = f64::NEG_INFINITY;
        let mut max_ub = f64::NEG_INFINITY;
        let mut winner_ub = f64::NEG_INFINITY;

        for &source in sources {
            let lb = earlier[source.layer].lb(source.neuron);
            let ub = earlier[source.layer].ub(source.neuron);
            if lb > max_lb {
                winner = source;
                max_lb = lb;
                winner_ub = ub;
            }
            if ub > max_ub {
                max_ub = ub;
            }
        }

        let mut phase_fixed = true;
        for &source in sources {
            if source != winner {
                let ub = earlier[source.layer].ub(source.neuron);
                if config.gt(ub, max_lb) {
                    phase_fixed = false;
                    break;
                }
            }
        }

        (winner, max_lb, winner_ub, max_ub, phase_fixed)
    }

    fn interval_max(&mut self, earlier: &[Layer], config: &Config, sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (_, max_lb, winner_ub, max_ub, phase_fixed) =
                self.max_phase_info(earlier, i, config);
            self.publish_lower(i, max_lb, sink);
            if phase_fixed {
                self.publish_upper(i, winner_ub, sink);
            } else {
                self.publish_upper(i, max_ub, sink);
            }
        }
    }

    /// Padded source bounds plus the output's position within the softmax
    /// group. The handled set disambiguates repeated groups: outputs are in
    /// source-neuron order, so the first unseen source is this neuron's own.
    fn softmax_sources(
        &self,
        earlier: &[Layer],
        neuron: usize,
        handled: &mut BTreeSet<usize>,
        config: &Config,
    ) -> (Vec<f64>, Vec<f64>, usize) {
        let sources = self.activation_sources(neuron);
        let mut source_lbs = Vec::with_capacity(sources.len());
        let mut source_ubs = Vec::with_capacity(sources.len());
        for &source in sources {
            source_lbs.push(earlier[source.layer].lb(source.neuron) - config.epsilon);
            source_ubs.push(earlier[source.layer].ub(source.neuron) + config.epsilon);
        }

        let mut index = 0;
        for &source in sources {
            if handled.contains(&source.neuron) {
                index += 1;
            } else {
                handled.insert(source.neuron);
                break;
            }
        }

        (source_lbs, source_ubs, index)
    }

    fn interval_softmax(&mut self, earlier: &[Layer], config: &Config, sink: &mut Vec<Tightening>) {
        let mut handled = BTreeSet::new();
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let (source_lbs, source_ubs, index) =
                self.softmax_sources(earlier, i, &mut handled, config);
            let lb = softmax_bounds::linear_lower_bound(&source_lbs, &source_ubs, index);
            let ub = softmax_bounds::linear_upper_bound(&source_lbs, &source_ubs, index);
            self.publish_lower(i, lb, sink);
            self.publish_upper(i, ub, sink);
        }
    }

    fn bilinear_source_bounds(&self, earlier: &[Layer], neuron: usize) -> ([f64; 2], [f64; 2]) {
        let sources = self.activation_sources(neuron);
        debug_assert_eq!(sources.len(), 2);
        let mut lbs = [0.0; 2];
        let mut ubs = [0.0; 2];
        for (k, &source) in sources.iter().enumerate() {
            lbs[k] = earlier[source.layer].lb(source.neuron);
            ubs[k] = earlier[source.layer].ub(source.neuron);
        }
        (lbs, ubs)
    }

    fn interval_bilinear(&mut self, earlier: &[Layer], sink: &mut Vec<Tightening>) {
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }
            let sources = self.activation_sources(i).to_vec();
            let all_constant = sources
                .iter()
                .all(|s| earlier[s.layer].neuron_eliminated(s.neuron));
            if all_constant {
                let value: f64 = sources
                    .iter()
                    .map(|s| earlier[s.layer].eliminated_value(s.neuron).unwrap())
                    .product();
                self.publish_lower(i, value, sink);
                self.publish_upper(i, value, sink);
                continue;
            }

            let (lbs, ubs) = self.bilinear_source_bounds(earlier, i);
            let corners = [
                lbs[0] * lbs[1],
                lbs[0] * ubs[1],
                ubs[0] * lbs[1],
                ubs[0] * ubs[1],
            ];
            let lb = corners.iter().copied().fold(f64::INFINITY, f64::min);
            let ub = corners.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            self.publish_lower(i, lb, sink);
            self.publish_upper(i, ub, sink);
        }
    }

    // ------------------------------------------------------------------
    // Symbolic bounds
    // ------------------------------------------------------------------

    pub(crate) fn symbolic_propagate(
        &mut self,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        let Some(mut sym) = self.symbolic.take() else {
            return;
        };
        match self.kind {
            LayerKind::Input => self.symbolic_input(&mut sym),
            LayerKind::WeightedSum => self.symbolic_weighted_sum(&mut sym, earlier, sink),
            LayerKind::Relu => self.symbolic_relu(&mut sym, earlier, config, sink),
            LayerKind::Sign => self.symbolic_sign(&mut sym, earlier, config, sink),
            LayerKind::AbsoluteValue => self.symbolic_absolute_value(&mut sym, earlier, sink),
            LayerKind::LeakyRelu => self.symbolic_leaky_relu(&mut sym, earlier, config, sink),
            LayerKind::Round => self.symbolic_round(&mut sym, earlier, sink),
            LayerKind::Sigmoid => self.symbolic_sigmoid(&mut sym, earlier, config, sink),
            LayerKind::Max => self.symbolic_max(&mut sym, earlier, config, sink),
            LayerKind::Softmax => self.symbolic_softmax(&mut sym, earlier, config, sink),
            LayerKind::Bilinear => self.symbolic_bilinear(&mut sym, earlier, sink),
        }
        self.symbolic = Some(sym);
    }

    fn symbolic_input(&mut self, sym: &mut SymbolicState) {
        sym.zero_rows();
        for i in 0..self.size {
            sym.lb[[i, i]] = 1.0;
            sym.ub[[i, i]] = 1.0;
            sym.lower_bias[i] = 0.0;
            sym.upper_bias[i] = 0.0;

            let (lb, ub) = match self.eliminated.get(&i) {
                Some(&value) => (value, value),
                None => (self.lb[i], self.ub[i]),
            };
            sym.lb_of_lb[i] = lb;
            sym.ub_of_lb[i] = ub;
            sym.lb_of_ub[i] = lb;
            sym.ub_of_ub[i] = ub;
        }
    }

    fn symbolic_weighted_sum(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        for i in 0..self.size {
            match self.eliminated.get(&i) {
                Some(&value) => {
                    sym.lower_bias[i] = value;
                    sym.upper_bias[i] = value;
                    sym.lb_of_lb[i] = value;
                    sym.ub_of_lb[i] = value;
                    sym.lb_of_ub[i] = value;
                    sym.ub_of_ub[i] = value;
                }
                None => {
                    sym.lower_bias[i] = self.bias[i];
                    sym.upper_bias[i] = self.bias[i];
                }
            }
        }

        for (&source_index, &source_size) in &self.source_layers {
            let source = &earlier[source_index];
            let src = source.symbolic().expect("source layer has no symbolic state");
            let pos = &self.positive_weights[&source_index];
            let neg = &self.negative_weights[&source_index];

            // newUB = srcUB * W+ + srcLB * W-; newLB = srcLB * W+ + srcUB * W-
            general_mat_mul(1.0, &src.ub, pos, 1.0, &mut sym.ub);
            general_mat_mul(1.0, &src.lb, neg, 1.0, &mut sym.ub);
            general_mat_mul(1.0, &src.lb, pos, 1.0, &mut sym.lb);
            general_mat_mul(1.0, &src.ub, neg, 1.0, &mut sym.lb);

            // Eliminated neurons stay constant regardless of left-over weights.
            for (&i, _) in &self.eliminated {
                sym.lb.column_mut(i).fill(0.0);
                sym.ub.column_mut(i).fill(0.0);
            }

            let weights = &self.weights[&source_index];
            for j in 0..self.size {
                if self.eliminated.contains_key(&j) {
                    continue;
                }
                for k in 0..source_size {
                    let weight = weights[[k, j]];
                    if weight > 0.0 {
                        sym.lower_bias[j] += src.lower_bias[k] * weight;
                        sym.upper_bias[j] += src.upper_bias[k] * weight;
                    } else {
                        sym.lower_bias[j] += src.upper_bias[k] * weight;
                        sym.upper_bias[j] += src.lower_bias[k] * weight;
                    }
                }
            }
        }

        let (input_lb, input_ub) = Self::input_box(earlier);
        close_over_input_box(sym, &input_lb, &input_ub, &self.eliminated);
        self.publish_from_symbolic(sym, sink);
    }

    fn symbolic_relu(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            // Fixed either externally through the f variable, or through the
            // source bounds below.
            let mut active = config.is_positive(self.lb[i]);
            let mut inactive = !active && !config.is_positive(self.ub[i]);

            let source = self.activation_sources(i)[0];
            let source_layer = &earlier[source.layer];
            inherit_from_source(sym, i, source_layer, source.neuron);

            let source_lb = source_layer.lb(source.neuron);
            let source_ub = source_layer.ub(source.neuron);
            if !config.is_negative(source_lb) {
                active = true;
                inactive = false;
            } else if !config.is_positive(source_ub) {
                inactive = true;
                active = false;
            }

            if !active && !inactive {
                // Ambiguous: triangle relaxation on the upper, the
                // area-minimizing choice on the lower.
                if sym.lb_of_ub[i] <= 0.0 {
                    let factor = sym.ub_of_ub[i] / (sym.ub_of_ub[i] - sym.lb_of_ub[i]);
                    for j in 0..self.input_layer_size {
                        sym.ub[[j, i]] *= factor;
                    }
                    sym.upper_bias[i] *= factor;
                    sym.upper_bias[i] -= sym.lb_of_ub[i] * factor;
                }

                let keep_lower = sym.ub_of_lb[i] > 0.0 && sym.ub_of_ub[i] >= -sym.lb_of_lb[i];
                if !keep_lower {
                    for j in 0..self.input_layer_size {
                        sym.lb[[j, i]] = 0.0;
                    }
                    sym.lower_bias[i] = 0.0;
                    sym.ub_of_lb[i] = 0.0;
                }

                sym.lb_of_lb[i] = 0.0;
            } else if inactive {
                for j in 0..self.input_layer_size {
                    sym.lb[[j, i]] = 0.0;
                    sym.ub[[j, i]] = 0.0;
                }
                sym.lower_bias[i] = 0.0;
                sym.upper_bias[i] = 0.0;
                sym.lb_of_lb[i] = 0.0;
                sym.ub_of_lb[i] = 0.0;
                sym.lb_of_ub[i] = 0.0;
                sym.ub_of_ub[i] = 0.0;
            }
            // Active: bounds pass through as is.

            if sym.lb_of_ub[i] < 0.0 {
                sym.lb_of_ub[i] = 0.0;
            }

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn symbolic_sign(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let mut positive = !config.is_negative(self.lb[i]);
            let mut negative = !positive && config.is_negative(self.ub[i]);

            let source = self.activation_sources(i)[0];
            let source_layer = &earlier[source.layer];
            inherit_from_source(sym, i, source_layer, source.neuron);

            let source_lb = source_layer.lb(source.neuron);
            let source_ub = source_layer.ub(source.neuron);
            if !config.is_negative(source_lb) {
                positive = true;
                negative = false;
            } else if config.is_negative(source_ub) {
                negative = true;
                positive = false;
            }

            if !positive && !negative {
                // Upper bound: constant one once its sign is settled,
                // otherwise the parallelogram approximation.
                let upper_fixed = !config.is_negative(sym.lb_of_ub[i]);
                if upper_fixed {
                    for j in 0..self.input_layer_size {
                        sym.ub[[j, i]] = 0.0;
                    }
                    sym.upper_bias[i] = 1.0;
                } else {
                    let factor = -2.0 / sym.lb_of_lb[i];
                    for j in 0..self.input_layer_size {
                        sym.ub[[j, i]] *= factor;
                    }
                    sym.upper_bias[i] *= factor;
                    sym.upper_bias[i] += 1.0;
                }

                let lower_fixed = config.is_negative(sym.ub_of_lb[i]);
                if lower_fixed {
                    for j in 0..self.input_layer_size {
                        sym.lb[[j, i]] = 0.0;
                    }
                    sym.lower_bias[i] = -1.0;
                } else {
                    let factor = 2.0 / sym.ub_of_ub[i];
                    for j in 0..self.input_layer_size {
                        sym.lb[[j, i]] *= factor;
                    }
                    sym.lower_bias[i] *= factor;
                    sym.lower_bias[i] -= 1.0;
                }

                sym.ub_of_ub[i] = 1.0;
                sym.lb_of_ub[i] = if upper_fixed { 1.0 } else { -1.0 };
                sym.ub_of_lb[i] = if lower_fixed { -1.0 } else { 1.0 };
                sym.lb_of_lb[i] = -1.0;
            } else {
                let constant = if positive { 1.0 } else { -1.0 };
                for j in 0..self.input_layer_size {
                    sym.lb[[j, i]] = 0.0;
                    sym.ub[[j, i]] = 0.0;
                }
                sym.lower_bias[i] = constant;
                sym.upper_bias[i] = constant;
                sym.lb_of_lb[i] = constant;
                sym.ub_of_lb[i] = constant;
                sym.lb_of_ub[i] = constant;
                sym.ub_of_ub[i] = constant;
            }

            if sym.lb_of_lb[i] < -1.0 {
                sym.lb_of_lb[i] = -1.0;
            }
            if sym.ub_of_ub[i] > 1.0 {
                sym.ub_of_ub[i] = 1.0;
            }

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn symbolic_absolute_value(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let source = self.activation_sources(i)[0];
            let source_layer = &earlier[source.layer];
            inherit_from_source(sym, i, source_layer, source.neuron);

            let source_lb = source_layer.lb(source.neuron);
            let source_ub = source_layer.ub(source.neuron);

            if source_lb >= 0.0 {
                // Positive phase: identity.
            } else if source_ub <= 0.0 {
                // Negative phase: rows negate and swap.
                for j in 0..self.input_layer_size {
                    let upper = sym.ub[[j, i]];
                    sym.ub[[j, i]] = -sym.lb[[j, i]];
                    sym.lb[[j, i]] = -upper;
                }
                let lower_bias = sym.lower_bias[i];
                sym.lower_bias[i] = -sym.upper_bias[i];
                sym.upper_bias[i] = -lower_bias;

                let lb_of_lb = sym.lb_of_lb[i];
                sym.lb_of_lb[i] = -sym.ub_of_ub[i];
                sym.ub_of_ub[i] = -lb_of_lb;
                let ub_of_lb = sym.ub_of_lb[i];
                sym.ub_of_lb[i] = -sym.lb_of_ub[i];
                sym.lb_of_ub[i] = -ub_of_lb;
            } else {
                // Ambiguous: concrete box only.
                for j in 0..self.input_layer_size {
                    sym.lb[[j, i]] = 0.0;
                    sym.ub[[j, i]] = 0.0;
                }
                sym.lower_bias[i] = 0.0;
                sym.upper_bias[i] = (-source_lb).max(source_ub);
                sym.lb_of_lb[i] = 0.0;
                sym.ub_of_lb[i] = sym.upper_bias[i];
                sym.lb_of_ub[i] = 0.0;
                sym.ub_of_ub[i] = sym.upper_bias[i];
            }

            if sym.lb_of_lb[i] < 0.0 {
                sym.lb_of_lb[i] = 0.0;
            }

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn symbolic_leaky_relu(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        let alpha = self.alpha;
        debug_assert!(alpha > 0.0 && alpha < 1.0);

        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);
        let (input_lb, input_ub) = Self::input_box(earlier);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let mut active = config.is_positive(self.lb[i]);
            let mut inactive = !active && !config.is_positive(self.ub[i]);

            let source = self.activation_sources(i)[0];
            let source_layer = &earlier[source.layer];
            inherit_from_source(sym, i, source_layer, source.neuron);

            let source_lb = source_layer.lb(source.neuron);
            let source_ub = source_layer.ub(source.neuron);
            if !config.is_negative(source_lb) {
                active = true;
                inactive = false;
            } else if !config.is_positive(source_ub) {
                inactive = true;
                active = false;
            }

            if !active && !inactive {
                // Chord on the upper, slope 1 or alpha on the lower,
                // whichever wastes less area.
                let width = source_ub - source_lb;
                let coeff = (source_ub - alpha * source_lb) / width;

                for j in 0..self.input_layer_size {
                    sym.ub[[j, i]] *= coeff;
                }
                sym.upper_bias[i] *= coeff;
                sym.upper_bias[i] += (alpha - 1.0) * source_ub * source_lb / width;

                if source_ub < -source_lb {
                    for j in 0..self.input_layer_size {
                        sym.lb[[j, i]] *= alpha;
                    }
                    sym.lower_bias[i] *= alpha;
                }

                let (lb_of_lb, ub_of_lb, lb_of_ub, ub_of_ub) =
                    close_neuron(sym, i, &input_lb, &input_ub);
                sym.lb_of_lb[i] = lb_of_lb;
                sym.ub_of_lb[i] = ub_of_lb;
                sym.lb_of_ub[i] = lb_of_ub;
                sym.ub_of_ub[i] = ub_of_ub;
            } else if inactive {
                for j in 0..self.input_layer_size {
                    sym.lb[[j, i]] *= alpha;
                    sym.ub[[j, i]] *= alpha;
                }
                sym.lower_bias[i] *= alpha;
                sym.upper_bias[i] *= alpha;
                sym.lb_of_lb[i] *= alpha;
                sym.ub_of_lb[i] *= alpha;
                sym.lb_of_ub[i] *= alpha;
                sym.ub_of_ub[i] *= alpha;
            }
            // Active: bounds pass through as is.

            if sym.ub_of_ub[i] > source_ub {
                sym.ub_of_ub[i] = source_ub;
            }
            if sym.lb_of_lb[i] < alpha * source_lb {
                sym.lb_of_lb[i] = alpha * source_lb;
            }

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn symbolic_round(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let source = self.activation_sources(i)[0];
            let source_layer = &earlier[source.layer];
            inherit_from_source(sym, i, source_layer, source.neuron);

            let source_lb = source_layer.lb(source.neuron);
            let source_ub = source_layer.ub(source.neuron);
            let lb_round = source_lb.round_ties_even();
            let ub_round = source_ub.round_ties_even();

            sym.lb_of_lb[i] = lb_round;
            sym.ub_of_lb[i] = lb_round;
            sym.lb_of_ub[i] = ub_round;
            sym.ub_of_ub[i] = ub_round;

            if lb_round == ub_round {
                // Fixed to one integer.
                for j in 0..self.input_layer_size {
                    sym.lb[[j, i]] = 0.0;
                    sym.ub[[j, i]] = 0.0;
                }
                sym.lower_bias[i] = lb_round;
                sym.upper_bias[i] = ub_round;
            } else {
                // x - 0.5 <= round(x) <= x + 0.5.
                sym.upper_bias[i] += 0.5;
                sym.lower_bias[i] -= 0.5;
            }

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn symbolic_sigmoid(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);
        let (input_lb, input_ub) = Self::input_box(earlier);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let source = self.activation_sources(i)[0];
            let source_layer = &earlier[source.layer];
            inherit_from_source(sym, i, source_layer, source.neuron);

            let source_lb = source_layer.lb(source.neuron);
            let source_ub = source_layer.ub(source.neuron);
            let lb_sigmoid = sigmoid(source_lb);
            let ub_sigmoid = sigmoid(source_ub);

            if config.are_equal(source_ub.round_ties_even(), source_lb.round_ties_even()) {
                // Effectively fixed: constant envelopes.
                for j in 0..self.input_layer_size {
                    sym.lb[[j, i]] = 0.0;
                    sym.ub[[j, i]] = 0.0;
                }
                sym.lower_bias[i] = lb_sigmoid;
                sym.upper_bias[i] = ub_sigmoid;
                sym.lb_of_lb[i] = lb_sigmoid;
                sym.ub_of_lb[i] = lb_sigmoid;
                sym.lb_of_ub[i] = ub_sigmoid;
                sym.ub_of_ub[i] = ub_sigmoid;
            } else {
                // Chord slope on the side whose input sign is determined,
                // tangent slope on the other.
                let lambda = (ub_sigmoid - lb_sigmoid) / (source_ub - source_lb);
                let lambda_prime =
                    sigmoid_derivative(source_lb).min(sigmoid_derivative(source_ub));

                let lower_slope = if config.is_positive(source_lb) {
                    lambda
                } else {
                    lambda_prime
                };
                for j in 0..self.input_layer_size {
                    sym.lb[[j, i]] *= lower_slope;
                }
                sym.lower_bias[i] *= lower_slope;
                sym.lower_bias[i] += lb_sigmoid - lower_slope * source_lb;

                let upper_slope = if !config.is_positive(source_ub) {
                    lambda
                } else {
                    lambda_prime
                };
                for j in 0..self.input_layer_size {
                    sym.ub[[j, i]] *= upper_slope;
                }
                sym.upper_bias[i] *= upper_slope;
                sym.upper_bias[i] += ub_sigmoid - upper_slope * source_ub;

                let (lb_of_lb, ub_of_lb, lb_of_ub, ub_of_ub) =
                    close_neuron(sym, i, &input_lb, &input_ub);
                sym.lb_of_lb[i] = lb_of_lb;
                sym.ub_of_lb[i] = ub_of_lb;
                sym.lb_of_ub[i] = lb_of_ub;
                sym.ub_of_ub[i] = ub_of_ub;
            }

            if sym.lb_of_lb[i] < 0.0 {
                sym.lb_of_lb[i] = 0.0;
            }
            if sym.ub_of_ub[i] > 1.0 {
                sym.ub_of_ub[i] = 1.0;
            }

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn symbolic_max(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let (winner, max_lb, winner_ub, max_ub, phase_fixed) =
                self.max_phase_info(earlier, i, config);
            let source_layer = &earlier[winner.layer];

            if phase_fixed {
                // The winner's envelopes carry over unchanged.
                inherit_from_source(sym, i, source_layer, winner.neuron);
                sym.lb_of_lb[i] = max_lb;
                sym.ub_of_lb[i] = max_lb;
                sym.lb_of_ub[i] = winner_ub;
                sym.ub_of_ub[i] = winner_ub;
            } else {
                // Winner's lower row; the upper degenerates to a constant.
                let src = source_layer
                    .symbolic()
                    .expect("source layer has no symbolic state");
                sym.lb.column_mut(i).assign(&src.lb.column(winner.neuron));
                sym.lower_bias[i] = src.lower_bias[winner.neuron];
                sym.ub.column_mut(i).fill(0.0);
                sym.upper_bias[i] = max_ub;

                sym.lb_of_lb[i] = max_lb;
                sym.ub_of_lb[i] = max_lb;
                sym.lb_of_ub[i] = max_ub;
                sym.ub_of_ub[i] = max_ub;
            }

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }

    fn symbolic_softmax(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        config: &Config,
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        sym.lower_bias.fill(0.0);
        sym.upper_bias.fill(0.0);
        apply_eliminated(sym, &self.eliminated);

        // A softmax output can constrain an input of the same layer, so the
        // local envelopes are expressed over the source neurons first and
        // composed with the source's symbolic state afterwards.
        let source_size = self
            .source_layers
            .iter()
            .next()
            .map(|(_, &s)| s)
            .unwrap_or(self.size);
        let mut local_lb = Array2::<f64>::zeros((source_size, self.size));
        let mut local_ub = Array2::<f64>::zeros((source_size, self.size));

        let mut handled = BTreeSet::new();
        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let sources = self.activation_sources(i).to_vec();
            let (source_lbs, source_ubs, index) =
                self.softmax_sources(earlier, i, &mut handled, config);
            let source_mids: Vec<f64> = source_lbs
                .iter()
                .zip(source_ubs.iter())
                .map(|(&l, &u)| (l + u) / 2.0)
                .collect();

            // Refresh the concrete interval first; the upper envelopes need
            // valid output bounds.
            let lb = softmax_bounds::linear_lower_bound(&source_lbs, &source_ubs, index);
            let ub = softmax_bounds::linear_upper_bound(&source_lbs, &source_ubs, index);
            self.publish_lower(i, lb, sink);
            self.publish_upper(i, ub, sink);

            let target_lbs = vec![self.lb[i]; sources.len()];
            let target_ubs = vec![self.ub[i]; sources.len()];

            if config.are_equal(self.lb[i], self.ub[i]) {
                sym.lower_bias[i] = self.lb[i];
                sym.upper_bias[i] = self.ub[i];
                continue;
            }

            match config.softmax_bounds {
                SoftmaxBounds::LogSumExp => {
                    let use_lse2 = target_lbs.iter().any(|&lb| lb > config.lse2_threshold);
                    if !use_lse2 {
                        sym.lower_bias[i] = softmax_bounds::lse_lower_bound(
                            &source_mids,
                            &source_lbs,
                            &source_ubs,
                            index,
                        );
                        for (input_index, source) in sources.iter().enumerate() {
                            let dldj = softmax_bounds::d_lse_lower_bound(
                                &source_mids,
                                &source_lbs,
                                &source_ubs,
                                index,
                                input_index,
                            );
                            local_lb[[source.neuron, i]] = dldj;
                            sym.lower_bias[i] -= dldj * source_mids[input_index];
                        }
                    } else {
                        sym.lower_bias[i] = softmax_bounds::lse_lower_bound2(
                            &source_mids,
                            &source_lbs,
                            &source_ubs,
                            index,
                        );
                        for (input_index, source) in sources.iter().enumerate() {
                            let dldj = softmax_bounds::d_lse_lower_bound2(
                                &source_mids,
                                &source_lbs,
                                &source_ubs,
                                index,
                                input_index,
                            );
                            local_lb[[source.neuron, i]] = dldj;
                            sym.lower_bias[i] -= dldj * source_mids[input_index];
                        }
                    }

                    sym.upper_bias[i] = softmax_bounds::lse_upper_bound(
                        &source_mids,
                        &target_lbs,
                        &target_ubs,
                        index,
                    );
                    for (input_index, source) in sources.iter().enumerate() {
                        let dudj = softmax_bounds::d_lse_upper_bound(
                            &source_mids,
                            &target_lbs,
                            &target_ubs,
                            index,
                            input_index,
                        );
                        local_ub[[source.neuron, i]] = dudj;
                        sym.upper_bias[i] -= dudj * source_mids[input_index];
                    }
                }
                SoftmaxBounds::ExponentialReciprocal => {
                    sym.lower_bias[i] = softmax_bounds::er_lower_bound(
                        &source_mids,
                        &source_lbs,
                        &source_ubs,
                        index,
                    );
                    for (input_index, source) in sources.iter().enumerate() {
                        let dldj = softmax_bounds::d_er_lower_bound(
                            &source_mids,
                            &source_lbs,
                            &source_ubs,
                            index,
                            input_index,
                        );
                        local_lb[[source.neuron, i]] = dldj;
                        sym.lower_bias[i] -= dldj * source_mids[input_index];
                    }

                    sym.upper_bias[i] = softmax_bounds::er_upper_bound(
                        &source_mids,
                        &target_lbs,
                        &target_ubs,
                        index,
                    );
                    for (input_index, source) in sources.iter().enumerate() {
                        let dudj = softmax_bounds::d_er_upper_bound(
                            &source_mids,
                            &target_lbs,
                            &target_ubs,
                            index,
                            input_index,
                        );
                        local_ub[[source.neuron, i]] = dudj;
                        sym.upper_bias[i] -= dudj * source_mids[input_index];
                    }
                }
            }
        }

        // Compose the local rows with the source's symbolic state through the
        // positive/negative split product.
        for (&source_index, _) in &self.source_layers {
            let source = &earlier[source_index];
            let src = source.symbolic().expect("source layer has no symbolic state");

            let pos_lb = local_lb.mapv(|w| if w > 0.0 { w } else { 0.0 });
            let neg_lb = local_lb.mapv(|w| if w < 0.0 { w } else { 0.0 });
            let pos_ub = local_ub.mapv(|w| if w > 0.0 { w } else { 0.0 });
            let neg_ub = local_ub.mapv(|w| if w < 0.0 { w } else { 0.0 });

            general_mat_mul(1.0, &src.lb, &pos_lb, 1.0, &mut sym.lb);
            general_mat_mul(1.0, &src.ub, &neg_lb, 1.0, &mut sym.lb);
            general_mat_mul(1.0, &src.ub, &pos_ub, 1.0, &mut sym.ub);
            general_mat_mul(1.0, &src.lb, &neg_ub, 1.0, &mut sym.ub);

            for i in 0..self.size {
                if self.eliminated.contains_key(&i) {
                    continue;
                }
                for k in 0..source_size {
                    let w_lb = local_lb[[k, i]];
                    if w_lb > 0.0 {
                        sym.lower_bias[i] += src.lower_bias[k] * w_lb;
                    } else {
                        sym.lower_bias[i] += src.upper_bias[k] * w_lb;
                    }
                    let w_ub = local_ub[[k, i]];
                    if w_ub > 0.0 {
                        sym.upper_bias[i] += src.upper_bias[k] * w_ub;
                    } else {
                        sym.upper_bias[i] += src.lower_bias[k] * w_ub;
                    }
                }
            }
        }

        let (input_lb, input_ub) = Self::input_box(earlier);
        close_over_input_box(sym, &input_lb, &input_ub, &self.eliminated);
        self.publish_from_symbolic(sym, sink);
    }

    fn symbolic_bilinear(
        &mut self,
        sym: &mut SymbolicState,
        earlier: &[Layer],
        sink: &mut Vec<Tightening>,
    ) {
        sym.zero_rows();
        apply_eliminated(sym, &self.eliminated);
        let (input_lb, input_ub) = Self::input_box(earlier);

        for i in 0..self.size {
            if self.eliminated.contains_key(&i) {
                continue;
            }

            let sources = self.activation_sources(i).to_vec();
            debug_assert_eq!(sources.len(), 2);
            let all_constant = sources
                .iter()
                .all(|s| earlier[s.layer].neuron_eliminated(s.neuron));
            if all_constant {
                let value: f64 = sources
                    .iter()
                    .map(|s| earlier[s.layer].eliminated_value(s.neuron).unwrap())
                    .product();
                sym.lower_bias[i] = value;
                sym.upper_bias[i] = value;
                sym.lb_of_lb[i] = value;
                sym.ub_of_lb[i] = value;
                sym.lb_of_ub[i] = value;
                sym.ub_of_ub[i] = value;
                continue;
            }

            let (lbs, ubs) = self.bilinear_source_bounds(earlier, i);
            let x = sources[0];
            let y = sources[1];
            let x_sym = earlier[x.layer]
                .symbolic()
                .expect("source layer has no symbolic state");
            let y_sym = earlier[y.layer]
                .symbolic()
                .expect("source layer has no symbolic state");

            // McCormick: z >= ly*x + lx*y - lx*ly and z <= uy*x + lx*y - lx*uy,
            // with each source row chosen by the sign of its multiplier.
            for j in 0..self.input_layer_size {
                let x_lb_row = x_sym.lb[[j, x.neuron]];
                let x_ub_row = x_sym.ub[[j, x.neuron]];
                let y_lb_row = y_sym.lb[[j, y.neuron]];
                let y_ub_row = y_sym.ub[[j, y.neuron]];

                sym.lb[[j, i]] += lbs[1] * if lbs[1] >= 0.0 { x_lb_row } else { x_ub_row };
                sym.lb[[j, i]] += lbs[0] * if lbs[0] >= 0.0 { y_lb_row } else { y_ub_row };

                sym.ub[[j, i]] += ubs[1] * if ubs[1] >= 0.0 { x_ub_row } else { x_lb_row };
                sym.ub[[j, i]] += lbs[0] * if lbs[0] >= 0.0 { y_ub_row } else { y_lb_row };
            }
            // The source biases compose like the rows, same sign selection.
            sym.lower_bias[i] = -lbs[0] * lbs[1];
            sym.lower_bias[i] += lbs[1]
                * if lbs[1] >= 0.0 {
                    x_sym.lower_bias[x.neuron]
                } else {
                    x_sym.upper_bias[x.neuron]
                };
            sym.lower_bias[i] += lbs[0]
                * if lbs[0] >= 0.0 {
                    y_sym.lower_bias[y.neuron]
                } else {
                    y_sym.upper_bias[y.neuron]
                };

            sym.upper_bias[i] = -lbs[0] * ubs[1];
            sym.upper_bias[i] += ubs[1]
                * if ubs[1] >= 0.0 {
                    x_sym.upper_bias[x.neuron]
                } else {
                    x_sym.lower_bias[x.neuron]
                };
            sym.upper_bias[i] += lbs[0]
                * if lbs[0] >= 0.0 {
                    y_sym.upper_bias[y.neuron]
                } else {
                    y_sym.lower_bias[y.neuron]
                };

            let (lb_of_lb, ub_of_lb, lb_of_ub, ub_of_ub) =
                close_neuron(sym, i, &input_lb, &input_ub);
            sym.lb_of_lb[i] = lb_of_lb;
            sym.ub_of_lb[i] = ub_of_lb;
            sym.lb_of_ub[i] = lb_of_ub;
            sym.ub_of_ub[i] = ub_of_ub;

            self.publish_lower(i, sym.lb_of_lb[i], sink);
            self.publish_upper(i, sym.ub_of_ub[i], sink);
        }
    }
}
