//! iptables implementation of [`Firewall`]
//!
//! - existence check: `iptables -C INPUT <spec>`
//! - insertion: `iptables -I INPUT 1 <spec>` for loopback, `-A INPUT` otherwise
//! - persistence: `iptables-save`, written atomically to the export path
//!   (`/etc/iptables/rules.v4`, read by `netfilter-persistent` at boot)

use crate::core::error::{Error, Result};
use crate::core::exec;
use crate::core::firewall::{AllowRule, Firewall, INPUT_CHAIN};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default location `iptables-persistent` restores rules from
pub const DEFAULT_RULES_EXPORT_PATH: &str = "/etc/iptables/rules.v4";

#[derive(Debug, Clone)]
pub struct IptablesFirewall {
    iptables: String,
    iptables_save: String,
    export_path: PathBuf,
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new("iptables", "iptables-save", DEFAULT_RULES_EXPORT_PATH)
    }
}

impl IptablesFirewall {
    pub fn new(
        iptables: impl Into<String>,
        iptables_save: impl Into<String>,
        export_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            iptables: iptables.into(),
            iptables_save: iptables_save.into(),
            export_path: export_path.into(),
        }
    }

    pub fn export_path(&self) -> &Path {
        &self.export_path
    }

    fn check_args(rule: &AllowRule) -> Vec<String> {
        let mut args = vec!["-C".to_string(), INPUT_CHAIN.to_string()];
        args.extend(rule.to_iptables_spec());
        args
    }

    fn insert_args(rule: &AllowRule) -> Vec<String> {
        let mut args = if rule.is_loopback() {
            // Loopback must match before any later DROP the admin may have added
            vec!["-I".to_string(), INPUT_CHAIN.to_string(), "1".to_string()]
        } else {
            vec!["-A".to_string(), INPUT_CHAIN.to_string()]
        };
        args.extend(rule.to_iptables_spec());
        args
    }
}

impl Firewall for IptablesFirewall {
    async fn rule_exists(&self, rule: &AllowRule) -> Result<bool> {
        let out = exec::output(&self.iptables, &Self::check_args(rule), &[]).await?;
        match out.exit_code {
            Some(0) => Ok(true),
            // `-C` exits 1 when the rule is missing ("Bad rule")
            Some(1) => Ok(false),
            _ => Err(exec::failure(&self.iptables, &out)),
        }
    }

    async fn insert_rule(&self, rule: &AllowRule) -> Result<()> {
        exec::run(&self.iptables, &Self::insert_args(rule), &[]).await?;
        debug!("Inserted rule: {rule}");
        Ok(())
    }

    async fn persist(&self) -> Result<PathBuf> {
        let out = exec::run(&self.iptables_save, &[] as &[&str], &[]).await?;
        if out.stdout.trim().is_empty() {
            return Err(Error::Internal(format!(
                "{} produced no output",
                self.iptables_save
            )));
        }

        let path = self.export_path.clone();
        crate::utils::write_atomic(&path, out.stdout.as_bytes(), 0o640)?;
        info!("Firewall rules exported to {}", path.display());
        Ok(path)
    }
}
