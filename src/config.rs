//! Provisioning configuration
//!
//! Every field has a default, so running without a config file provisions the
//! OAuth service the way it is normally deployed. A JSON file passed with
//! `--config` can override any subset of fields; the `PORT` environment
//! variable overrides the file.

use crate::core::error::{Error, Result};
use crate::core::firewall::{AllowList, cloudflare_ranges};
use crate::core::iptables::{DEFAULT_RULES_EXPORT_PATH, IptablesFirewall};
use crate::core::limits::{DEFAULT_LIMITS_PATH, NOFILE_LIMIT};
use crate::core::packages::PackagePlan;
use crate::core::unit::{DEFAULT_UNIT_DIR, ServiceUnitSpec, Systemctl};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable holding the service port
pub const PORT_ENV: &str = "PORT";

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupConfig {
    /// Port the service listens on and the proxy ranges may reach
    pub port: u16,
    /// systemd unit name, without `.service`
    pub service_name: String,
    pub description: String,
    /// Directory holding the application; becomes `WorkingDirectory=`
    pub install_dir: PathBuf,
    /// Script inside `install_dir` started by the interpreter
    pub entry_point: String,
    /// Optional `User=` for the unit
    pub run_as: Option<String>,
    /// Proxy provider CIDRs allowed to reach `port`
    pub proxy_ranges: Vec<IpNetwork>,
    pub os_packages: Vec<String>,
    pub python_packages: Vec<String>,
    /// Extra flags for `pip install`, e.g. `--break-system-packages`
    pub pip_extra_args: Vec<String>,
    /// Modules that must import after installation
    pub required_imports: Vec<String>,
    /// Secrets the operator has to provide; listed in the summary
    pub secret_env_keys: Vec<String>,
    pub nofile_limit: u32,
    pub paths: SystemPaths,
    pub tools: ToolPaths,
}

/// Files and directories hostprep writes to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemPaths {
    pub unit_dir: PathBuf,
    pub limits_conf: PathBuf,
    pub rules_export: PathBuf,
}

/// External programs hostprep runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub apt_get: String,
    pub pip: String,
    /// Absolute interpreter path; used for verification and in `ExecStart=`
    pub python: PathBuf,
    pub iptables: String,
    pub iptables_save: String,
    pub systemctl: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            service_name: "oauth-service".to_string(),
            description: "OAuth Website (Cloudflare origin)".to_string(),
            install_dir: PathBuf::from("/opt/oauth-service"),
            entry_point: "service.py".to_string(),
            run_as: None,
            proxy_ranges: cloudflare_ranges().unwrap_or_default(),
            os_packages: strings(&["python3", "python3-pip", "iptables", "iptables-persistent"]),
            python_packages: strings(&["aiohttp", "motor", "dnspython", "uvloop"]),
            pip_extra_args: Vec::new(),
            required_imports: strings(&["aiohttp", "motor"]),
            secret_env_keys: strings(&[
                "DISCORD_CLIENT_ID",
                "DISCORD_CLIENT_SECRET",
                "OAUTH_REDIRECT_URI",
                "MONGODB_URI",
            ]),
            nofile_limit: NOFILE_LIMIT,
            paths: SystemPaths::default(),
            tools: ToolPaths::default(),
        }
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
            limits_conf: PathBuf::from(DEFAULT_LIMITS_PATH),
            rules_export: PathBuf::from(DEFAULT_RULES_EXPORT_PATH),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            apt_get: "apt-get".to_string(),
            pip: "pip3".to_string(),
            python: PathBuf::from("/usr/bin/python3"),
            iptables: "iptables".to_string(),
            iptables_save: "iptables-save".to_string(),
            systemctl: "systemctl".to_string(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl SetupConfig {
    /// Applies environment overrides using `lookup` (normally `std::env::var`).
    ///
    /// # Errors
    ///
    /// Returns `Err` if `PORT` is set but not a valid port.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(PORT_ENV) {
            self.port = crate::validators::parse_port(&raw)
                .map_err(|message| Error::validation(PORT_ENV, message))?;
        }
        Ok(())
    }

    /// Checks fields that are not validated when the component using them is
    /// built.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_port(self.port)
            .map_err(|m| Error::validation("port", m))?;
        crate::validators::validate_unit_name(&self.service_name)
            .map_err(|m| Error::validation("service_name", m))?;
        let entry = Path::new(&self.entry_point);
        if self.entry_point.is_empty()
            || entry.is_absolute()
            || entry
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::validation(
                "entry_point",
                "must be a path relative to install_dir",
            ));
        }
        if self.proxy_ranges.is_empty() {
            return Err(Error::validation("proxy_ranges", "at least one range is required"));
        }
        self.allow_list()?;
        if self.nofile_limit == 0 {
            return Err(Error::validation("nofile_limit", "must be greater than 0"));
        }
        crate::core::packages::import_statement(&self.required_imports)?;
        self.python_path()?;
        Ok(())
    }

    /// Absolute path of the entry script
    pub fn entry_path(&self) -> PathBuf {
        self.install_dir.join(&self.entry_point)
    }

    pub fn allow_list(&self) -> Result<AllowList> {
        AllowList::new(&self.proxy_ranges, self.port)
    }

    pub fn unit_spec(&self) -> Result<ServiceUnitSpec> {
        let mut builder =
            ServiceUnitSpec::builder(self.install_dir.clone(), self.tools.python.clone())
                .description(&self.description)
                .arg(self.entry_path().to_string_lossy())
                .env(PORT_ENV, self.port.to_string());
        if let Some(user) = &self.run_as {
            builder = builder.user(user.clone());
        }
        builder.build()
    }

    pub fn unit_path(&self) -> Result<PathBuf> {
        crate::core::unit::unit_path(&self.paths.unit_dir, &self.service_name)
    }

    pub fn firewall(&self) -> IptablesFirewall {
        IptablesFirewall::new(
            self.tools.iptables.clone(),
            self.tools.iptables_save.clone(),
            self.paths.rules_export.clone(),
        )
    }

    pub fn service_manager(&self) -> Systemctl {
        Systemctl::new(self.tools.systemctl.clone())
    }

    /// The interpreter path as text, so the import check and `ExecStart=` use
    /// the same binary.
    fn python_path(&self) -> Result<&str> {
        self.tools
            .python
            .to_str()
            .ok_or_else(|| Error::validation("tools.python", "path is not valid UTF-8"))
    }

    pub fn package_plan(&self) -> Result<PackagePlan<'_>> {
        Ok(PackagePlan {
            apt_get: &self.tools.apt_get,
            pip: &self.tools.pip,
            python: self.python_path()?,
            os_packages: &self.os_packages,
            python_packages: &self.python_packages,
            pip_extra_args: &self.pip_extra_args,
            required_imports: &self.required_imports,
        })
    }
}

/// Loads the config from `path`, or returns defaults when `path` is `None`.
///
/// Unlike the environment override, a config file that is given but cannot be
/// read or parsed is an error.
///
/// # Errors
///
/// Returns `Err` on I/O or JSON errors.
pub async fn load_config(path: Option<&Path>) -> Result<SetupConfig> {
    let Some(path) = path else {
        return Ok(SetupConfig::default());
    };
    let json = tokio::fs::read_to_string(path).await?;
    let config: SetupConfig = serde_json::from_str(&json)?;
    Ok(config)
}

/// Loads the config, applies the process environment and validates.
pub async fn resolve_config(path: Option<&Path>) -> Result<SetupConfig> {
    let mut config = load_config(path).await?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
