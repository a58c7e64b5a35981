//! systemd service unit generation
//!
//! [`ServiceUnitSpec`] is an immutable description of the service; [`render`]
//! turns it into unit-file text and [`install`] writes that text to the unit
//! directory and asks the service manager to reload. Starting or enabling the
//! service is left to the operator.
//!
//! # Example
//!
//! ```
//! use hostprep::core::unit::{ServiceUnitSpec, render};
//!
//! let spec = ServiceUnitSpec::builder("/opt/oauth-service", "/usr/bin/python3")
//!     .arg("/opt/oauth-service/service.py")
//!     .env("PORT", "8080")
//!     .build()
//!     .unwrap();
//! let text = render(&spec);
//! assert!(text.contains("Restart=always"));
//! ```

use crate::core::error::{Error, Result};
use crate::core::exec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default directory for administrator-provided units
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// systemd `Restart=` policy
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart on every exit, clean or not
    #[default]
    #[strum(serialize = "always")]
    Always,
    /// Restart only on unclean exit codes, signals and timeouts
    #[strum(serialize = "on-failure")]
    OnFailure,
    /// Never restart
    #[strum(serialize = "no")]
    No,
}

/// systemd `Type=`
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    /// The process started by `ExecStart=` is the main process (no forking)
    #[default]
    #[strum(serialize = "simple")]
    Simple,
    #[strum(serialize = "exec")]
    Exec,
}

/// Everything needed to render a service unit.
///
/// Built through [`ServiceUnitSpec::builder`], which validates every field;
/// the struct is read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnitSpec {
    description: String,
    after: String,
    service_type: ServiceType,
    user: Option<String>,
    working_directory: PathBuf,
    entry_command: PathBuf,
    args: Vec<String>,
    restart: RestartPolicy,
    restart_delay: Duration,
    start_limit_burst: u32,
    start_limit_interval: Duration,
    environment: BTreeMap<String, String>,
    wanted_by: String,
}

impl ServiceUnitSpec {
    /// Starts a spec with the provisioning defaults: restart always after 5s,
    /// at most 5 starts per 60s, unbuffered Python output.
    pub fn builder(
        working_directory: impl Into<PathBuf>,
        entry_command: impl Into<PathBuf>,
    ) -> ServiceUnitSpecBuilder {
        let mut environment = BTreeMap::new();
        environment.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        ServiceUnitSpecBuilder {
            spec: ServiceUnitSpec {
                description: "Origin web service".to_string(),
                after: "network.target".to_string(),
                service_type: ServiceType::Simple,
                user: None,
                working_directory: working_directory.into(),
                entry_command: entry_command.into(),
                args: Vec::new(),
                restart: RestartPolicy::Always,
                restart_delay: Duration::from_secs(5),
                start_limit_burst: 5,
                start_limit_interval: Duration::from_secs(60),
                environment,
                wanted_by: "multi-user.target".to_string(),
            },
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn entry_command(&self) -> &Path {
        &self.entry_command
    }

    pub fn restart(&self) -> RestartPolicy {
        self.restart
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    pub fn start_limit_burst(&self) -> u32 {
        self.start_limit_burst
    }

    pub fn start_limit_interval(&self) -> Duration {
        self.start_limit_interval
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// The `ExecStart=` command line
    pub fn exec_start(&self) -> String {
        let mut line = self.entry_command.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_arg(arg));
        }
        line
    }
}

/// Builder for [`ServiceUnitSpec`]
#[derive(Debug, Clone)]
pub struct ServiceUnitSpecBuilder {
    spec: ServiceUnitSpec,
}

impl ServiceUnitSpecBuilder {
    pub fn description(mut self, description: &str) -> Self {
        self.spec.description = crate::validators::sanitize_description(description);
        self
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.spec.service_type = service_type;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.user = Some(user.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.args.push(arg.into());
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.spec.restart = policy;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.spec.restart_delay = delay;
        self
    }

    pub fn start_limit(mut self, burst: u32, interval: Duration) -> Self {
        self.spec.start_limit_burst = burst;
        self.spec.start_limit_interval = interval;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.insert(key.into(), value.into());
        self
    }

    /// Validates and returns the spec.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a path is relative or unquotable, an environment entry
    /// is malformed, the user name is invalid, or the start limit is zero.
    pub fn build(self) -> Result<ServiceUnitSpec> {
        let spec = self.spec;

        crate::validators::validate_absolute_path(&spec.working_directory)
            .map_err(|m| Error::validation("working_directory", m))?;
        crate::validators::validate_absolute_path(&spec.entry_command)
            .map_err(|m| Error::validation("entry_command", m))?;

        for arg in &spec.args {
            if arg.chars().any(|c| c.is_control() || c == '"') {
                return Err(Error::validation(
                    "args",
                    format!("argument {arg:?} contains control characters or quotes"),
                ));
            }
        }

        for (key, value) in &spec.environment {
            crate::validators::validate_env_key(key)
                .map_err(|m| Error::validation("environment", m))?;
            crate::validators::validate_env_value(value)
                .map_err(|m| Error::validation("environment", m))?;
        }

        if let Some(user) = &spec.user {
            crate::validators::validate_unit_name(user)
                .map_err(|m| Error::validation("user", m))?;
        }

        if spec.start_limit_burst == 0 || spec.start_limit_interval.is_zero() {
            return Err(Error::validation(
                "start_limit",
                "burst and interval must both be non-zero",
            ));
        }

        if spec.description.is_empty() {
            return Err(Error::validation("description", "cannot be empty"));
        }

        Ok(spec)
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(char::is_whitespace) {
        format!("\"{arg}\"")
    } else {
        arg.to_string()
    }
}

/// Formats a duration as a systemd time span (`5`, `1500ms`).
fn format_timespan(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Renders the unit file text for `spec`.
pub fn render(spec: &ServiceUnitSpec) -> String {
    let mut out = String::with_capacity(512);

    // Writing to a String cannot fail
    let _ = writeln!(out, "[Unit]");
    let _ = writeln!(out, "Description={}", spec.description);
    let _ = writeln!(out, "After={}", spec.after);
    let _ = writeln!(out, "StartLimitBurst={}", spec.start_limit_burst);
    let _ = writeln!(
        out,
        "StartLimitIntervalSec={}",
        format_timespan(spec.start_limit_interval)
    );
    out.push('\n');

    let _ = writeln!(out, "[Service]");
    let _ = writeln!(out, "Type={}", spec.service_type);
    if let Some(user) = &spec.user {
        let _ = writeln!(out, "User={user}");
    }
    let _ = writeln!(
        out,
        "WorkingDirectory={}",
        spec.working_directory.display()
    );
    let _ = writeln!(out, "ExecStart={}", spec.exec_start());
    let _ = writeln!(out, "Restart={}", spec.restart);
    let _ = writeln!(out, "RestartSec={}", format_timespan(spec.restart_delay));
    for (key, value) in &spec.environment {
        if value.chars().any(char::is_whitespace) {
            let _ = writeln!(out, "Environment=\"{key}={value}\"");
        } else {
            let _ = writeln!(out, "Environment={key}={value}");
        }
    }
    out.push('\n');

    let _ = writeln!(out, "[Install]");
    let _ = writeln!(out, "WantedBy={}", spec.wanted_by);
    out
}

/// Service manager operations needed after a unit file changes.
#[allow(async_fn_in_trait)]
pub trait ServiceManager {
    /// Makes the manager re-read unit definitions from disk.
    async fn reload(&self) -> Result<()>;
}

/// [`ServiceManager`] backed by `systemctl`
#[derive(Debug, Clone)]
pub struct Systemctl {
    program: String,
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new("systemctl")
    }
}

impl Systemctl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ServiceManager for Systemctl {
    async fn reload(&self) -> Result<()> {
        exec::run(&self.program, &["daemon-reload"], &[]).await?;
        info!("systemd unit definitions reloaded");
        Ok(())
    }
}

/// Path of the unit file for `service_name` under `unit_dir`.
pub fn unit_path(unit_dir: &Path, service_name: &str) -> Result<PathBuf> {
    crate::validators::validate_unit_name(service_name)
        .map_err(|m| Error::validation("service_name", m))?;
    Ok(unit_dir.join(format!("{service_name}.service")))
}

/// Result of [`install`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUnit {
    pub path: PathBuf,
    pub sha256: String,
}

/// Writes the rendered unit to `path`, replacing whatever was there, then
/// reloads the service manager.
///
/// # Errors
///
/// Returns `Err` if the file cannot be written or the reload fails. The file
/// stays in place when only the reload fails.
pub async fn install<M: ServiceManager>(
    spec: &ServiceUnitSpec,
    path: &Path,
    manager: &M,
) -> Result<InstalledUnit> {
    let text = render(spec);

    if path.exists() {
        info!("Overwriting existing unit file {}", path.display());
    }
    crate::utils::write_atomic(path, text.as_bytes(), 0o644)?;
    info!("Wrote unit file {}", path.display());

    manager.reload().await?;

    Ok(InstalledUnit {
        path: path.to_path_buf(),
        sha256: crate::utils::sha256_hex(text.as_bytes()),
    })
}
