//! hostprep - origin host provisioning
//!
//! Prepares a Debian-family host to run a Python web service behind
//! Cloudflare: installs packages, verifies the runtime, opens the service
//! port to the proxy ranges, raises the open-file limit and installs a
//! restart-on-failure systemd unit.
//!
//! # Architecture
//!
//! - [`core`] - Firewall reconciliation, unit generation, package and limits steps
//! - [`setup`] - The seven-step provisioning run
//! - [`config`] - Configuration defaults, JSON file and environment overrides
//! - [`audit`] - JSON-lines audit trail of host mutations
//! - [`privilege`] - Root check and tool discovery
//! - [`validators`] - Input validation
//! - [`utils`] - State directory and atomic file writes
//!
//! Every step is safe to repeat: rules and limits are only added when
//! missing, and the unit file is rewritten in full.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod privilege;
pub mod setup;
pub mod utils;
pub mod validators;

pub use core::error::{Error, Result};
pub use core::firewall::{AllowList, AllowRule, Firewall};
