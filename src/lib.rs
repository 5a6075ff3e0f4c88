//! ftl: chart projects, pick a profile, jump into a running Docker environment.

pub mod commands;
pub mod config;
pub mod docker;
pub mod env;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod state;

pub use error::{Error, Result};
