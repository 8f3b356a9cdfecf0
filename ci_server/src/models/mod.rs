//! CI data model: projects, configurations, commits and builds.

pub mod build;
pub mod build_configuration;
pub mod commit;
pub mod project;
