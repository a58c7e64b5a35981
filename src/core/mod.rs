//! Host provisioning primitives
//!
//! - [`firewall`]: allow rules, the allow list and the [`firewall::Firewall`] seam
//! - [`iptables`]: `iptables`/`iptables-save` backend
//! - [`reconcile`]: check-then-insert over an allow list
//! - [`unit`]: systemd unit model, rendering and installation
//! - [`packages`]: apt and pip installation plus import verification
//! - [`limits`]: open-file limits
//! - [`exec`]: external command execution
//! - [`error`]: error types and exit codes

pub mod error;
pub mod exec;
pub mod firewall;
pub mod iptables;
pub mod limits;
pub mod packages;
pub mod reconcile;
pub mod unit;

#[cfg(test)]
pub mod test_helpers;
