//! The `loom` module holds the intermediate representation of a tensor graph and its optimizer.
//!
//! ## Key Components
//! 1. **Semantics**:
//!    - Axes (`Axis`) are dimension identities; orders (`Order`) are axis sequences.
//!    - Dimensions are concrete or symbolic (`Placeholder`), resolved when the model is instantiated.
//!
//! 2. **Graph**:
//!    - Variables and operators live in an arena (`Graph`) addressed by handles.
//!    - Replacing a variable redirects its handle, so consumers never see a stale node.
//!    - Operators (`Operator`) form a closed set with shape inference and evaluation rules.
//!
//! 3. **Optimizer**:
//!    - Rewrite rules (`OptimizeRule`) composed into groups run to a fixed point.

use itertools::Itertools;
use thiserror::Error;

pub mod axis;
pub mod eval;
pub mod graph;
pub mod ops;
pub mod optimize;
pub mod placeholder;
pub mod variable;

use axis::{Axis, Order};
use graph::{OpId, VarId};
use ops::OpKind;
use placeholder::Placeholder;

#[derive(Debug, Error)]
pub enum LoomError {
    #[error("order {0} contains duplicated axes")]
    DuplicateAxis(Order),
    #[error("order {order} does not match rank {rank}")]
    Rank { order: Order, rank: usize },
    #[error("{op} expects {expected} inputs, found {found}")]
    Arity {
        op: OpKind,
        expected: usize,
        found: usize,
    },
    #[error("{op}: {reason}; inputs: {}", .inputs.iter().join(", "))]
    ShapeOrOrderMismatch {
        op: OpKind,
        reason: String,
        inputs: Vec<String>,
    },
    #[error("cannot replace {old} with {new}: {reason}")]
    Replace {
        old: String,
        new: String,
        reason: &'static str,
    },
    #[error("cyclic data dependency through {0}")]
    CyclicGraph(VarId),
    #[error("variable handle {0} is stale")]
    StaleVariable(VarId),
    #[error("variable handle {0} is invalid")]
    InvalidVariable(VarId),
    #[error("operator handle {0} is invalid")]
    InvalidOperator(OpId),
    #[error("variable {var} has free axes in order {order}")]
    FreeAxis { var: VarId, order: Order },
    #[error("cannot unify distinct named axes {0} and {1}")]
    AxisConflict(Axis, Axis),
    #[error("dimension {0} overflows")]
    Overflow(Placeholder),
    #[error("dimension {0} is not resolved")]
    Unresolved(Placeholder),
    #[error("data length {found} does not match size {expected}")]
    DataLength { expected: usize, found: usize },
    #[error("no data fed for input {0}")]
    MissingFeed(VarId),
    #[error("variable {0} is neither an input nor a constant")]
    Unbound(VarId),
}
