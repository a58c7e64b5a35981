//! The seven provisioning steps
//!
//! [`Provisioner::run`] executes the steps top to bottom and stops at the
//! first failure. There is no retry and no rollback: the operator fixes the
//! cause and runs the whole thing again, which is safe because every step is
//! either idempotent (rules, limits) or a full overwrite (unit file).
//!
//! Progress goes to the writer passed to `run` (stdout in the binary); the
//! "Setup Complete" summary is only written after step 7 succeeded.

use crate::audit::{self, AuditLog, EventType};
use crate::config::SetupConfig;
use crate::core::error::Result;
use crate::core::firewall::Firewall;
use crate::core::packages;
use crate::core::reconcile::{ReconcileReport, reconcile};
use crate::core::unit::{InstalledUnit, ServiceManager, install};
use serde_json::json;
use std::io::Write;
use tracing::{info, warn};

pub const TOTAL_STEPS: usize = 7;

/// What a successful run changed
#[derive(Debug, Clone)]
pub struct SetupReport {
    pub firewall: ReconcileReport,
    pub limits_appended: usize,
    pub unit: InstalledUnit,
}

pub struct Provisioner<'a, F, S> {
    config: &'a SetupConfig,
    firewall: F,
    manager: S,
    audit: Option<AuditLog>,
}

impl<'a, F: Firewall, S: ServiceManager> Provisioner<'a, F, S> {
    pub fn new(config: &'a SetupConfig, firewall: F, manager: S) -> Self {
        Self {
            config,
            firewall,
            manager,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn firewall(&self) -> &F {
        &self.firewall
    }

    /// Runs all steps.
    ///
    /// # Errors
    ///
    /// Returns `Error::Privilege` before touching anything when `is_root` is
    /// false, a validation error for a bad config, or the first step failure.
    pub async fn run<W: Write>(&self, is_root: bool, out: &mut W) -> Result<SetupReport> {
        crate::privilege::ensure_root(is_root)?;

        // Everything derived from the config is built before the first mutation
        self.config.validate()?;
        let allow_list = self.config.allow_list()?;
        let spec = self.config.unit_spec()?;
        let unit_path = self.config.unit_path()?;
        let plan = self.config.package_plan()?;

        let tools = [
            plan.apt_get,
            plan.pip,
            plan.python,
            self.config.tools.systemctl.as_str(),
            self.config.tools.iptables.as_str(),
        ];
        for tool in crate::privilege::missing_binaries(&tools) {
            warn!("{tool} not found; it may be installed by the package step");
        }
        for range in &self.config.proxy_ranges {
            if let Some(warning) = crate::validators::check_reserved_range(*range) {
                warn!("{warning}");
            }
        }

        self.record(EventType::SetupStarted, true, json!({ "port": self.config.port }), None)
            .await;
        info!("Provisioning {} on port {}", self.config.service_name, self.config.port);

        step(out, 1, "Updating package index")?;
        let result = packages::update_index(&plan).await;
        self.audited(EventType::InstallPackages, result, |_| json!({ "step": "update" }))
            .await?;

        step(out, 2, "Installing system packages")?;
        let result = packages::install_os_packages(&plan).await;
        self.audited(EventType::InstallPackages, result, |_| {
            json!({ "packages": self.config.os_packages })
        })
        .await?;

        step(out, 3, "Installing Python dependencies")?;
        let result = packages::install_python_packages(&plan).await;
        self.audited(EventType::InstallPackages, result, |_| {
            json!({ "packages": self.config.python_packages })
        })
        .await?;

        step(out, 4, "Verifying Python packages")?;
        let result = packages::verify_imports(&plan).await;
        self.audited(EventType::VerifyRuntime, result, |_| {
            json!({ "imports": self.config.required_imports })
        })
        .await?;
        writeln!(out, "      ✓ {} importable", self.config.required_imports.join(", "))?;

        step(out, 5, "Configuring firewall for proxy ranges")?;
        let result = reconcile(&self.firewall, &allow_list).await;
        let firewall = self
            .audited(EventType::ReconcileFirewall, result, |r| {
                json!({
                    "port": allow_list.port(),
                    "inserted": r.inserted_count(),
                    "present": r.present_count(),
                })
            })
            .await?;
        writeln!(
            out,
            "      ✓ {} rule(s) added, {} already present",
            firewall.inserted_count(),
            firewall.present_count()
        )?;
        match &firewall.persisted {
            Some(path) => {
                let checksum = std::fs::read(path)
                    .map(|bytes| crate::utils::sha256_hex(&bytes))
                    .ok();
                self.record(
                    EventType::PersistFirewall,
                    true,
                    json!({ "path": path, "sha256": checksum }),
                    None,
                )
                .await;
                writeln!(out, "      ✓ Rules saved to {}", path.display())?;
            }
            None => {
                self.record(EventType::PersistFirewall, false, json!({}), None)
                    .await;
                writeln!(out, "      ⚠ Rules not saved; they will be lost on reboot")?;
            }
        }

        step(out, 6, "Raising file descriptor limits")?;
        let result = crate::core::limits::raise_nofile(
            &self.config.paths.limits_conf,
            self.config.nofile_limit,
        )
        .await;
        let limits_appended = self
            .audited(EventType::RaiseLimits, result, |n| {
                json!({ "path": self.config.paths.limits_conf, "appended": n })
            })
            .await?;
        writeln!(
            out,
            "      ✓ nofile limit {} in {}",
            self.config.nofile_limit,
            self.config.paths.limits_conf.display()
        )?;

        step(out, 7, "Installing systemd service")?;
        let result = install(&spec, &unit_path, &self.manager).await;
        let unit = self
            .audited(EventType::InstallUnit, result, |u| {
                json!({ "path": u.path, "sha256": u.sha256 })
            })
            .await?;
        writeln!(out, "      ✓ {}", unit.path.display())?;

        self.record(EventType::SetupFinished, true, json!({}), None)
            .await;

        let report = SetupReport {
            firewall,
            limits_appended,
            unit,
        };
        write_summary(out, self.config)?;
        Ok(report)
    }

    async fn record(
        &self,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        audit::record(self.audit.as_ref(), event_type, success, details, error).await;
    }

    /// Records the outcome of a step and passes the result through.
    async fn audited<T>(
        &self,
        event_type: EventType,
        result: Result<T>,
        details: impl FnOnce(&T) -> serde_json::Value,
    ) -> Result<T> {
        match &result {
            Ok(value) => {
                self.record(event_type, true, details(value), None).await;
            }
            Err(e) => {
                self.record(event_type, false, json!({}), Some(e.to_string()))
                    .await;
            }
        }
        result
    }
}

/// Runs setup with the configured iptables and systemctl backends.
///
/// `open_audit` is only called once `is_root` has been checked, since opening
/// the audit log creates the state directory.
///
/// # Errors
///
/// Same as [`Provisioner::run`].
pub async fn provision<W: Write>(
    config: &SetupConfig,
    is_root: bool,
    out: &mut W,
    open_audit: impl FnOnce() -> std::io::Result<AuditLog>,
) -> Result<SetupReport> {
    crate::privilege::ensure_root(is_root)?;

    let mut provisioner = Provisioner::new(config, config.firewall(), config.service_manager());
    match open_audit() {
        Ok(audit) => provisioner = provisioner.with_audit(audit),
        Err(e) => warn!("Audit log unavailable: {e}"),
    }
    provisioner.run(is_root, out).await
}

fn step<W: Write>(out: &mut W, n: usize, title: &str) -> std::io::Result<()> {
    writeln!(out, "[{n}/{TOTAL_STEPS}] {title}...")?;
    out.flush()
}

/// Writes the operator instructions shown after a successful run.
pub fn write_summary<W: Write>(out: &mut W, config: &SetupConfig) -> std::io::Result<()> {
    let service = &config.service_name;
    let port = config.port;
    let rule = "=".repeat(60);

    writeln!(out)?;
    writeln!(out, "{rule}")?;
    writeln!(out, "  Setup Complete")?;
    writeln!(out, "{rule}")?;
    writeln!(out)?;
    writeln!(out, "Next steps:")?;
    writeln!(out, "  1. Set the service secrets:")?;
    writeln!(out, "       sudo systemctl edit {service}")?;
    writeln!(out, "     and add under [Service]:")?;
    for key in &config.secret_env_keys {
        writeln!(out, "       Environment={key}=...")?;
    }
    writeln!(out, "  2. Start the service:   sudo systemctl start {service}")?;
    writeln!(out, "  3. Enable at boot:      sudo systemctl enable {service}")?;
    writeln!(out, "  4. Check status:        sudo systemctl status {service}")?;
    writeln!(out, "  5. Follow logs:         sudo journalctl -u {service} -f")?;
    writeln!(out)?;
    writeln!(out, "Cloudflare configuration:")?;
    writeln!(out, "  - DNS: proxied (orange cloud) A record pointing at this host")?;
    if crate::validators::PROXY_HTTPS_PORTS.contains(&port) {
        writeln!(out, "  - SSL/TLS mode: Full (origin serves HTTPS on {port})")?;
    } else {
        writeln!(out, "  - SSL/TLS mode: Flexible (origin serves HTTP on {port})")?;
    }
    writeln!(out, "  - Origin port: {port}, reachable from Cloudflare ranges only")?;
    if let Some(warning) = crate::validators::check_proxy_port(port) {
        writeln!(out, "  ⚠ {warning}")?;
    }
    writeln!(
        out,
        "  - To refuse direct access from other sources: sudo iptables -A INPUT -p tcp --dport {port} -j DROP"
    )?;
    writeln!(out)?;
    Ok(())
}
