//! The network-level reasoner: a DAG of typed layers reconstructed from the
//! flat constraint system, and the propagation passes (concrete assignment,
//! interval arithmetic, symbolic bounds) that tighten variable intervals.

pub mod layer;
pub mod reasoner;
pub mod softmax_bounds;

pub use layer::{Layer, LayerKind};
pub use reasoner::{NetworkReasoner, PropagationOutcome};
