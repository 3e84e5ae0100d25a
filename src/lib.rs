//! im_gateway: a tiered instant-messaging gateway.
//!
//! Clients hold long-lived TCP connections to a **comet**. Routable packets
//! travel comet → logic topic → **dispatch** (id stamping, group fan-out)
//! → dispatch topic, where every comet delivers to its local recipients,
//! **store** persists and **push** notices offline recipients.
//!
//! # Usage
//! See `src/bin/im_gateway.rs` for wiring all tiers into one process.

pub mod auth;
pub mod codec;
pub mod comet;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod membership;
pub mod monitor;
pub mod packet;
pub mod presence;
pub mod push;
pub mod queue;
pub mod registry;
pub mod snowflake;
pub mod store;
