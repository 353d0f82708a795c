//! Application services layer scaffolding.

pub mod candidates;
pub mod engagement;
pub mod error;
pub mod jobs;
pub mod pagination;
pub mod ranking;
pub mod repos;
pub mod snapshot;
