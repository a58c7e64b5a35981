//! Rule reconciliation
//!
//! Brings the active firewall in line with an [`AllowList`] without ever
//! duplicating a rule. Failures are handled per stage:
//!
//! - a failed existence check counts as "absent" and the rule is inserted
//! - a failed insertion aborts reconciliation
//! - a failed persist is logged and ignored

use crate::core::error::Result;
use crate::core::firewall::{AllowList, AllowRule, Firewall};
use std::path::PathBuf;
use tracing::{info, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rules that were missing and got inserted
    pub inserted: Vec<AllowRule>,
    /// Rules that were already active
    pub present: Vec<AllowRule>,
    /// Where the rule set was persisted, `None` if persisting failed
    pub persisted: Option<PathBuf>,
}

impl ReconcileReport {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }

    pub fn present_count(&self) -> usize {
        self.present.len()
    }
}

/// Ensures every rule in `list` is active on `firewall`, then persists.
///
/// # Errors
///
/// Returns the first insertion error. Check and persist errors are not
/// returned.
pub async fn reconcile<F: Firewall>(firewall: &F, list: &AllowList) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for rule in list.rules() {
        let exists = match firewall.rule_exists(rule).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Existence check failed for '{rule}', inserting anyway: {e}");
                false
            }
        };

        if exists {
            report.present.push(rule.clone());
            continue;
        }

        firewall.insert_rule(rule).await?;
        info!("Added rule: {rule}");
        report.inserted.push(rule.clone());
    }

    report.persisted = match firewall.persist().await {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Could not persist firewall rules (continuing): {e}");
            None
        }
    };

    info!(
        inserted = report.inserted_count(),
        present = report.present_count(),
        "Firewall reconciled"
    );
    Ok(report)
}

/// Lists the rules of `list` that are not active on `firewall`.
///
/// Read-only. A failed check is reported as missing, matching what
/// [`reconcile`] would do with it.
pub async fn plan<F: Firewall>(firewall: &F, list: &AllowList) -> Vec<AllowRule> {
    let mut missing = Vec::new();
    for rule in list.rules() {
        match firewall.rule_exists(rule).await {
            Ok(true) => {}
            Ok(false) => missing.push(rule.clone()),
            Err(e) => {
                warn!("Existence check failed for '{rule}': {e}");
                missing.push(rule.clone());
            }
        }
    }
    missing
}
