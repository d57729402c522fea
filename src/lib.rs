//! # Integration Hub Library
//!
//! Connection management for third-party integrations: OAuth authorization and token
//! lifecycle, encrypted credential storage, widget data, webhook intake and the
//! background refresh, sync and health schedulers.

pub mod auth;
pub mod cache;
pub mod config;
pub mod connection_service;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod oauth_flow;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod token_refresh;
pub mod webhook_verification;
pub mod webhooks;
pub use migration;
