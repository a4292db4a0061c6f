//! Plaza real-time conversation delivery subsystem.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod bridge;
pub mod client;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod frame;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod state;
pub mod ws;
