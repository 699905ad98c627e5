//! Tidings real-time notification delivery server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod hub;
pub mod lookup;
pub mod notify;
pub mod ratelimit;
pub mod relay;
pub mod routes;
pub mod state;
pub mod ws;
