//! Relay between wings (remote agent hosts) and the users driving them:
//! presence, request correlation, remote sessions, a durable task pipeline,
//! and edge/login gossip of where each wing lives.

pub mod auth;
pub mod config;
pub mod connection;
pub mod gossip;
pub mod identity;
pub mod metrics;
pub mod pending;
pub mod registry;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod ws;
