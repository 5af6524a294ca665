//! HTTP endpoints
//!
//! - `health`: liveness at `/`
//! - `webhook`: push receiver at `/webhook`

pub mod health;
pub mod webhook;
