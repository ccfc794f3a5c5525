//! Core of a decision procedure for feasibility of constraint systems derived
//! from feed-forward neural networks: a query model over real variables with
//! explicit bounds, a shared protocol for piecewise-linear and smooth
//! non-linear constraints, and a layer-graph reasoner that tightens variable
//! intervals with interval arithmetic and symbolic (affine) bounds.

pub mod config;
pub mod constraints;
pub mod errors;
pub mod nlr;
pub mod query;
pub mod sparse;
pub mod types;
pub mod vnnlib;

pub use config::{BoundTighteningMode, Config, SoftmaxBounds};
pub use errors::{VfError, VfResult};
pub use query::{Equation, EquationKind, LinearExpression, Query};
pub use types::{BoundKind, NeuronIndex, Tightening, Variable};
