//! # Tollgate
//!
//! **Inline traffic inspection gateway for AI agent sandboxes.**
//!
//! Tollgate sits behind a proxy as an ICAP service and adapts both
//! directions of agent traffic: outbound requests are checked for leaked
//! credentials and novel destinations, inbound responses are scanned for
//! malware, and blocked requests can be released through a one-time-token
//! approval flow driven by a human operator.
//!
//! ## Architecture
//!
//! - **[`icap`]** — ICAP server: framing, preview negotiation, and the
//!   REQMOD/RESPMOD adaptation handlers
//! - **[`dlp`]** — credential pattern engine and domain-novelty policy
//! - **[`scan`]** — streaming malware-scan client with a circuit breaker
//! - **[`decompress`]** — bounded gzip inflation guarding against bombs
//! - **[`ott`]** — one-time-token approval state machine
//! - **[`store`]** — policy/state store: in-memory or RESP over TCP/TLS
//! - **[`audit`]** — append-only audit trail written through the store
//! - **[`config`]** — TOML configuration with environment substitution
//! - **[`cli`]** — command-line interface (clap)
//! - **[`error`]** — unified error types using `thiserror`
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a default configuration
//! tollgate init
//!
//! # Validate it
//! tollgate check
//!
//! # Start the ICAP service and point the proxy at it
//! tollgate start
//! ```

pub mod audit;
pub mod cli;
pub mod config;
pub mod decompress;
pub mod dlp;
pub mod error;
pub mod icap;
pub mod ott;
pub mod scan;
pub mod state;
pub mod store;
