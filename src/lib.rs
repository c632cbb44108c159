//! Backs up object-store buckets into a deal-based storage network, tracks
//! each backup's deals, and rebuilds backed-up objects into live buckets.
//! Also imports external S3 buckets under bounded concurrency.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
