//! Step model for batch-exec.
//!
//! A step is one unit of a batch change: either a command run on the host
//! inside the repository checkout, or a command run in a container with the
//! checkout mounted as its working directory. This crate holds the pure
//! parts of the model (no process or filesystem access):
//!
//! - the serialized step format and its validation rules
//! - `${{ ... }}` template rendering and skip-condition evaluation
//! - decoding of declared step outputs

mod output;
mod step;
mod template;

pub use output::{decode_output, OutputError};
pub use step::{
    Condition, Mount, OutputFormat, OutputSpec, Step, StepKind, ValidationError,
    ValidationResult,
};
pub use template::{evaluate_condition, is_static, render, TemplateContext};
