//! Submission/Status API for sales message jobs.

pub mod handlers;
pub mod models;
