pub mod api;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod logstore;
pub mod preview;
pub mod reconcile;
pub mod supervisor;
pub mod tenant;

pub use error::{ManagerError, Result};
