//! vizflow: a traced, multi-stage chart recommendation pipeline.
//!
//! A dataset runs through `scan → plan → transform → chart → explain` under
//! one `orchestrate.run` parent span. The [`runner`] executes runs in the
//! background and streams their progress; [`patch`] evolves the recommended
//! chart afterwards and records each edit on the run's stored trace.

pub mod agents;
pub mod api;
pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;
pub mod patch;
pub mod pipeline;
pub mod runner;
pub mod server;
pub mod store;
pub mod trace;
pub mod util;
