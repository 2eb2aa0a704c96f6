//! Risk-gated signal-to-trade execution engine.
//!
//! Signals from webhooks or an AI component are normalized, checked against a
//! user's daily risk state, sized, dispatched (simulated or to an exchange),
//! and settled back into the risk state and per-strategy confidence.

pub mod api;
pub mod clock;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod service;
pub mod trading;
