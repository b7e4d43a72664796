//! Image generation job queue
//!
//! This library provides the worker pipeline for a generation gallery: it
//! claims pending generation jobs, calls the inference endpoint, stores the
//! resulting image in S3-compatible object storage, and drives each job to a
//! terminal status under concurrent workers.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
