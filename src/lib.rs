//! hostrun - run named tasks against remote hosts over SSH or locally

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod executors;
pub mod inventory;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scope;
pub mod tasks;
pub mod transfer;

pub use error::{HostrunError, Result};
pub use models::{Context, Host};
pub use registry::{Args, TaskRegistry};
pub use runner::{Runner, RunnerConfig};
