//! Build orchestration services: VCS access, builders, hooks and dispatch.

pub mod builders;
pub mod dispatch;
pub mod executor;
pub mod hooks;
pub mod queue;
pub mod registry;
pub mod tracker;
pub mod vcs;
