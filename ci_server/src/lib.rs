//! CI orchestrator: tracks repositories, dispatches builds per branch and
//! aggregates per-commit verdicts.
//!
//! Change notifications arrive through build hooks, are matched against each
//! project's build configurations, and become pending builds that a bounded
//! worker pool executes in disposable workspaces.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod fakes;
pub mod metrics;
pub mod models;
pub mod plugins;
pub mod routes;
pub mod seeder;
pub mod services;
pub mod store;
