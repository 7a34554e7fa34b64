//! Structural patches over chart documents, and chart state built on them.

pub mod chart_state;
pub mod engine;

pub use chart_state::{ChartEdit, ChartEditor, ChartState};
pub use engine::PatchEngine;
