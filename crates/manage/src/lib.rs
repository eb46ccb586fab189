//! Management commands for enterprise catalogs.

pub mod cli;
pub mod commands;
pub mod config;
pub mod orchestrator;

pub use orchestrator::{
    CatalogRefreshOrchestrator, RefreshError, RefreshOptions, RefreshOutcome, RefreshSummary, WaitPolicy,
};
