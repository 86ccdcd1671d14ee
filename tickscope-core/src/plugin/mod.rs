//! User-supplied derivation plugins.
//!
//! A plugin is a JSON manifest naming its inputs and one expression per
//! output. Uploads are validated (structure, compile, dry run) before they
//! can run; failures are kept with their error so the same bytes are not
//! re-validated.

pub mod expr;
mod manifest;
mod registry;

pub use expr::{EvalContext, Expr, ExprError};
pub use manifest::{
    dry_run, validate, CompiledPlugin, ExprTransform, OutputSpec, PluginManifest,
    DRY_RUN_TICKS, MAX_PLUGIN_INPUTS, MAX_WINDOW,
};
pub use registry::PluginRegistry;
