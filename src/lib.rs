//! Submission scoring pipeline.
//!
//! Finalized learner submissions are turned into scoring jobs, delivered
//! at least once through a keyed broker queue and scored by a pool of
//! workers. The job store's conditional status transition is what keeps
//! redelivered or concurrently delivered jobs from being scored twice.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
