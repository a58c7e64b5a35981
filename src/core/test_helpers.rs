//! Shared test utilities for core module tests
//!
//! In-memory stand-ins for the firewall and the service manager, plus a config
//! whose tools and files never touch the real host. This module is only
//! compiled in test mode.

use crate::config::SetupConfig;
use crate::core::error::{Error, Result};
use crate::core::firewall::{AllowRule, Firewall};
use crate::core::unit::{ServiceManager, ServiceUnitSpec};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct FirewallState {
    rules: Vec<AllowRule>,
    fail_checks: bool,
    inserts_before_failure: Option<usize>,
    fail_persist: bool,
    persist_calls: usize,
}

/// [`Firewall`] keeping its rules in a `Vec`, with switchable failures.
#[derive(Debug, Default)]
pub struct MemoryFirewall {
    state: Mutex<FirewallState>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<AllowRule>) -> Self {
        let fw = Self::new();
        fw.state.lock().unwrap().rules = rules;
        fw
    }

    pub fn rules(&self) -> Vec<AllowRule> {
        self.state.lock().unwrap().rules.clone()
    }

    /// Every `rule_exists` call errors
    pub fn fail_checks(&self, fail: bool) {
        self.state.lock().unwrap().fail_checks = fail;
    }

    /// Allows `n` more inserts, then fails with exit code 4
    pub fn fail_inserts_after(&self, n: usize) {
        self.state.lock().unwrap().inserts_before_failure = Some(n);
    }

    pub fn fail_persist(&self, fail: bool) {
        self.state.lock().unwrap().fail_persist = fail;
    }

    pub fn persist_calls(&self) -> usize {
        self.state.lock().unwrap().persist_calls
    }
}

impl Firewall for MemoryFirewall {
    async fn rule_exists(&self, rule: &AllowRule) -> Result<bool> {
        let state = self.state.lock().unwrap();
        if state.fail_checks {
            return Err(Error::Command {
                program: "iptables".to_string(),
                message: "can't initialize iptables table `filter'".to_string(),
                stderr: None,
                exit_code: Some(3),
            });
        }
        Ok(state.rules.contains(rule))
    }

    async fn insert_rule(&self, rule: &AllowRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.inserts_before_failure {
            if remaining == 0 {
                return Err(Error::Command {
                    program: "iptables".to_string(),
                    message: "Another app is currently holding the xtables lock".to_string(),
                    stderr: None,
                    exit_code: Some(4),
                });
            }
            state.inserts_before_failure = Some(remaining - 1);
        }
        if rule.is_loopback() {
            state.rules.insert(0, rule.clone());
        } else {
            state.rules.push(rule.clone());
        }
        Ok(())
    }

    async fn persist(&self) -> Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        state.persist_calls += 1;
        if state.fail_persist {
            return Err(Error::Internal("iptables-save produced no output".to_string()));
        }
        Ok(PathBuf::from("/tmp/rules.v4"))
    }
}

/// [`ServiceManager`] counting reloads
#[derive(Debug, Default)]
pub struct RecordingServiceManager {
    reloads: Mutex<usize>,
    fail: bool,
}

impl RecordingServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            reloads: Mutex::new(0),
            fail: true,
        }
    }

    pub fn reloads(&self) -> usize {
        *self.reloads.lock().unwrap()
    }
}

impl ServiceManager for RecordingServiceManager {
    async fn reload(&self) -> Result<()> {
        if self.fail {
            return Err(Error::Command {
                program: "systemctl".to_string(),
                message: "System has not been booted with systemd as init system".to_string(),
                stderr: None,
                exit_code: Some(1),
            });
        }
        *self.reloads.lock().unwrap() += 1;
        Ok(())
    }
}

/// The OAuth service unit as deployed, listening on `port`.
pub fn create_test_spec(port: u16) -> ServiceUnitSpec {
    ServiceUnitSpec::builder("/opt/oauth-service", "/usr/bin/python3")
        .description("OAuth Website (Cloudflare origin)")
        .arg("/opt/oauth-service/service.py")
        .env("PORT", port.to_string())
        .build()
        .unwrap()
}

/// Absolute path of `name` found in PATH.
///
/// # Panics
///
/// Panics if `name` is not installed.
pub fn find_binary(name: &str) -> PathBuf {
    let paths = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
        .unwrap_or_else(|| panic!("{name} not found in PATH"))
}

/// Default config with every file under `dir` and every package tool
/// replaced by `true`.
pub fn test_config(dir: &Path) -> SetupConfig {
    let noop = find_binary("true");
    let noop_str = noop.to_string_lossy().into_owned();

    let mut config = SetupConfig::default();
    config.paths.unit_dir = dir.join("units");
    config.paths.limits_conf = dir.join("limits.conf");
    config.paths.rules_export = dir.join("rules.v4");
    config.tools.apt_get.clone_from(&noop_str);
    config.tools.pip.clone_from(&noop_str);
    config.tools.systemctl.clone_from(&noop_str);
    config.tools.python = noop;
    config
}
