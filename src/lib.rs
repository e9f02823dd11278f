//! Outproxy - Rate-Pacing Forwarding Gateway
//!
//! This crate implements an HTTP gateway that sits in front of a single
//! backend and paces each client against a request ceiling shared by every
//! gateway instance. Counts live in an external store (Redis or a gossip
//! mesh), and the ceiling can be changed at runtime without a restart.

pub mod config;
pub mod error;
pub mod gateway;
pub mod mesh;
pub mod ratelimit;
