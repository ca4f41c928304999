//! Batch Fetch Queue
//!
//! Clients submit a batch of item ids to check against an object store and
//! poll for its progress. Submissions become durable job records; a pool of
//! lease-holding workers processes them with retry/backoff; pollers see a
//! small stable status projection of each record.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod runtime;
pub mod services;
pub mod store;
