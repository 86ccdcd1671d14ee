//! Streaming derivations.
//!
//! ```text
//! input 0 ─ InputReader ─┐
//! input 1 ─ InputReader ─┼─▶ Aligner ─▶ Transform ─▶ <derived>/<output>.jsonl
//! input N ─ InputReader ─┘                            ├─▶ FrameCache
//!                                                     └─▶ ControlChannel
//! ```
//!
//! Built-in transforms are [`DiffTransform`] and [`MovingAverage`]; plugins
//! supply an [`ExprTransform`](crate::plugin::ExprTransform).

mod align;
mod engine;
mod input;
mod transform;

pub use align::{AlignedRow, Aligner};
pub use engine::{output_path, DerivationJobs, JobRequest, DERIVED_ENTITY};
pub use input::{InputEvent, InputReader, InputSpec, WriterProbe};
pub use transform::{DiffTransform, MovingAverage, Transform};
