pub mod admission;
pub mod approval;
pub mod audit;
pub mod auth;
pub mod canonical;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod io;
pub mod normalize;
pub mod paths;
pub mod pipeline;
pub mod render;
pub mod template;
pub mod types;

pub use error::{GateError, Result};
pub use pipeline::{Pipeline, PipelineParts, SubmitOutcome};
