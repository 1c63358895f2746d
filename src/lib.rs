//! ReserveL - restaurant reservations with optional on-chain settlement
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Domain
//! - [`reservation`] - Reservation document, statuses and input validation
//! - [`transitions`] - The reservation state machine
//! - [`economics`] - Loyalty and token amount arithmetic
//!
//! ## Storage
//! - [`persistence`] - Document store (SQLite and in-memory)
//!
//! ## Settlement
//! - [`settlement`] - Contract and payment gateway clients
//! - [`crypto`] - Request signing (secp256k1)
//!
//! ## Application
//! - [`service`] - Orchestration of store and settlement
//! - `api` - REST endpoints (feature `api`)
//! - `server` - Process startup and shutdown (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Domain
// ============================================================================
pub mod economics;
pub mod reservation;
pub mod transitions;

// ============================================================================
// Storage
// ============================================================================
pub mod persistence;

// ============================================================================
// Settlement
// ============================================================================
pub mod crypto;
pub mod settlement;

// ============================================================================
// Application
// ============================================================================
pub mod service;

#[cfg(feature = "api")]
pub mod api;
#[cfg(feature = "api")]
pub mod server;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::{ReservationError, Result};
