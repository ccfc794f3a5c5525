use serde::{Deserialize, Serialize};

/// Index into the query's flat, dense variable space.
pub type Variable = usize;

/// Addresses a single neuron as (layer, position within the layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NeuronIndex {
    pub layer: usize,
    pub neuron: usize,
}

impl NeuronIndex {
    pub fn new(layer: usize, neuron: usize) -> Self {
        Self { layer, neuron }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundKind {
    Lower,
    Upper,
}

/// A proposed replacement of a stored bound by a tighter value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tightening {
    pub variable: Variable,
    pub value: f64,
    pub kind: BoundKind,
}

impl Tightening {
    pub fn lower(variable: Variable, value: f64) -> Self {
        Self {
            variable,
            value,
            kind: BoundKind::Lower,
        }
    }

    pub fn upper(variable: Variable, value: f64) -> Self {
        Self {
            variable,
            value,
            kind: BoundKind::Upper,
        }
    }
}
