//! Corrente ranks user posts by a time-decayed engagement score and serves
//! the ranking as stably paginated feeds, using Postgres as both store and
//! score cache.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
