#![forbid(unsafe_code)]

//! Facade crate: re-exports the whole public surface of the workspace so
//! applications depend on one crate.
//!
//! The member crates layer strictly: `expr` (expression trees and paths)
//! underpins `context` (named contexts, builder reducer, persistence),
//! which underpins `plot` (plot-config model and reducer), which `query`
//! (URL codec) and `gateway` (data-service client) both build on.

pub use dp_context as context;
pub use dp_expr as expr;
pub use dp_gateway as gateway;
pub use dp_plot as plot;
pub use dp_query as query;

pub mod prelude {
    //! The names most callers want in scope.

    pub use dp_context::{
        BuilderAction, Context, ContextEdit, ContextStore, ContextValidation, InMemoryStorage,
        Patch, StorageBackend, content_hash, context_from_selection, parse_value_list,
    };
    pub use dp_expr::{
        BoolOp, CompareOp, Comparison, Expr, ExprPath, Group, PathStep, Value, VariableRef,
        denormalize, normalize,
    };
    pub use dp_gateway::{DataBackend, DataGateway, ExpensiveRequest, ExpensiveResponse, is_stale};
    pub use dp_plot::{
        Dimension, DimensionSlot, PlotAction, PlotConfig, PlotType, Reduced, SlotPath,
        apply_context_edit, find_paths_to_context,
    };
    pub use dp_query::{plot_from_query_string, plot_to_query_string};
}
