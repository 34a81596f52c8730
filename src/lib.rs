//! Scheduled Upload Pipeline
//!
//! This library provides the scheduling core of the upload-scheduler system:
//! a persistence-backed job store, a polling detector that promotes due
//! jobs, a bounded worker pool, and the per-job upload pipeline with
//! retry/backoff and status tracking.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
