//! Columnar data model, expression evaluation, and aggregation kernels.
//!
//! Architecture role:
//! - defines the batch currency of the execution plan ([`ExecBatch`], [`Datum`],
//!   [`ScalarValue`])
//! - compiles and evaluates row expressions for filter/project operators
//! - implements the three-phase aggregation kernel protocol
//!   (consume / merge / finalize) and the kernel catalog
//! - provides the streaming [`Grouper`] backing hash aggregation

pub mod batch;
pub mod expr;
pub mod grouper;
pub mod kernels;
pub mod scalar;

// Re-export only what you want at the crate root (no globs).
pub use batch::{Datum, ExecBatch};
pub use expr::{col, compile_expr, lit, ArithOp, CmpOp, Expr, PhysicalExpr};
pub use grouper::{apply_groupings, make_groupings, Grouper};
pub use kernels::{
    make_kernel, AggregateKernel, AggregateOptions, IndexOptions, ModeOptions,
    QuantileInterpolation, QuantileOptions, ScalarAggregateOptions, TDigestOptions,
    VarianceOptions,
};
pub use scalar::{scalars_to_array, ScalarValue};
