//! Generation job pipeline
//!
//! A Postgres-backed work queue for AI image generation: workers claim jobs
//! with `FOR UPDATE SKIP LOCKED`, call an external image provider, normalize
//! whatever it returns, and persist the images to R2 as assets attached to a
//! subject or photoshoot.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
