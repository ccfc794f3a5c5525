use serde::{Deserialize, Serialize};

/// Which bound-propagation analyses the reasoner runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundTighteningMode {
    /// Interval arithmetic plus symbolic (affine) bounds back to the input layer.
    SymbolicTightening,
    /// Interval arithmetic only.
    IntervalOnly,
    /// No network-level tightening.
    None,
}

/// Envelope family used for softmax layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoftmaxBounds {
    LogSumExp,
    ExponentialReciprocal,
}

/// Immutable-after-init knobs shared by the query, the constraints and the
/// reasoner. Every component receives this by reference; there is no global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Epsilon for all bound comparisons.
    pub epsilon: f64,
    pub bound_tightening: BoundTighteningMode,
    pub softmax_bounds: SoftmaxBounds,
    /// A softmax lower envelope switches to the anchored LSE2 variant once any
    /// target lower bound exceeds this threshold. The constant's provenance is
    /// undocumented upstream; it is preserved here as a knob.
    pub lse2_threshold: f64,
    /// Maximum number of full propagation sweeps per call.
    pub sweep_budget: usize,
    /// Require every activation layer built by the lifter to have a single
    /// source layer. Needed by the symbolic analysis.
    pub ensure_same_source_layer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epsilon: crate::constraints::COMPARISON_EPSILON,
            bound_tightening: BoundTighteningMode::SymbolicTightening,
            softmax_bounds: SoftmaxBounds::LogSumExp,
            lse2_threshold: 0.1,
            sweep_budget: 4,
            ensure_same_source_layer: true,
        }
    }
}

impl Config {
    pub fn is_zero(&self, x: f64) -> bool {
        x.abs() <= self.epsilon
    }

    pub fn is_positive(&self, x: f64) -> bool {
        x > self.epsilon
    }

    pub fn is_negative(&self, x: f64) -> bool {
        x < -self.epsilon
    }

    pub fn are_equal(&self, x: f64, y: f64) -> bool {
        (x - y).abs() <= self.epsilon
    }

    pub fn gt(&self, x: f64, y: f64) -> bool {
        x - y > self.epsilon
    }
}
