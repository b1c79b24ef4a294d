#![forbid(unsafe_code)]

//! Splits a remote video into one losslessly cut file per chapter.
//!
//! The pure pieces (`metadata`, `planner`, `resolver`, `progress`,
//! `extract`) do no process work. `tools` drives the external download and
//! extraction programs and `pipeline` ties everything into a state machine
//! that reports through events.

pub mod config;
pub mod error;
pub mod extract;
pub mod metadata;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod resolver;
pub mod tools;

pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineEvent, PipelineState, RunRequest, RunSummary};
