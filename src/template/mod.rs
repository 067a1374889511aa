//! Template handling for step inputs, conditions and workflow outputs
//!
//! Two evaluators share one context:
//!
//! - The resolver substitutes `{{ params.x }}`, `{{ steps.<id>.output[.path] }}`
//!   and `{{ now() }}` in step inputs and output templates. It is best-effort:
//!   unresolved references become empty strings.
//! - Conditions are full minijinja expressions evaluated to a boolean.
//!
//! # Example
//!
//! ```ignore
//! use agentflow::template::{TemplateContext, resolve, should_execute_step};
//!
//! let ctx = execution.template_context();
//! let input = resolve(&step.input, &ctx);
//! if should_execute_step(step.condition.as_deref(), &ctx) {
//!     // ...
//! }
//! ```

mod conditionals;
mod context;
mod errors;
mod resolver;

pub use conditionals::{condition_references, should_execute_step};
pub use context::TemplateContext;
pub use errors::suggest_correction;
pub use resolver::{render_value, resolve, step_references};
