//! whatsmux: multi-tenant WhatsApp messaging core.
//!
//! Every user reaches WhatsApp through one active integration: the vendor
//! cloud API with their own credentials, their own phone paired through the
//! device bridge, or the platform's shared fallback sender. A single router
//! picks the transport, records every attempt, and retries once through the
//! fallback sender when that is allowed.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;
pub mod types;

pub mod events;
pub mod store;

pub mod bridge;
pub mod session;
pub mod transport;

pub mod router;
pub mod server;
