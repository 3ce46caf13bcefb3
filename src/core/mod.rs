//! Core domain models
//!
//! This module defines the pipeline description, the compiled stage graph,
//! per-instance identity and the error taxonomy shared by every other module.

pub mod config;
pub mod error;
pub mod graph;
pub mod identity;
pub mod secrets;
pub mod trigger;

pub use config::*;
pub use error::*;
pub use graph::*;
pub use identity::*;
pub use trigger::*;
