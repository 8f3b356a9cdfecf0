//! Read models for the CI dashboard.

pub mod overview;
