//! Gantry core
//!
//! Graph data model, job value objects, keyed-by resolution, and run
//! parameters for the gantry job-graph compiler. This crate has minimal
//! dependencies and defines the shared vocabulary used by the pipeline and
//! CLI crates.

pub mod error;
pub mod graph;
pub mod job;
pub mod jobgraph;
pub mod keyed_by;
pub mod params;
pub mod reference;

pub use error::{Error, Result};
pub use graph::{Edge, Graph};
pub use job::{Job, Optimization};
pub use jobgraph::JobGraph;
pub use params::Parameters;
