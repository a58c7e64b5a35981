//! Integration tests for hostprep
//!
//! These run the real iptables and systemctl backends and the full
//! provisioning run against `tests/mock_host.sh`, which stands in for every
//! external tool. Nothing here needs root or touches the host: each test gets
//! its own temp directory holding the tool copies, the rule state, the unit
//! directory and the limits file.

#![allow(clippy::uninlined_format_args)]

use hostprep::config::SetupConfig;
use hostprep::core::error::Error;
use hostprep::core::firewall::{AllowList, AllowRule, Firewall};
use hostprep::core::reconcile::{plan, reconcile};
use hostprep::core::unit::{ServiceManager, Systemctl};
use hostprep::setup::Provisioner;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::OnceLock;
use tempfile::TempDir;

const TOOLS: [&str; 6] = [
    "iptables",
    "iptables-save",
    "systemctl",
    "apt-get",
    "pip3",
    "python3",
];

/// Executable copies of the mock script, made once per test binary.
///
/// Tests only symlink to these. Writing an executable while another test
/// forks can make the later exec fail with ETXTBSY.
fn mock_tools() -> &'static Path {
    static TOOLS_DIR: OnceLock<TempDir> = OnceLock::new();
    TOOLS_DIR
        .get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            let script = Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("tests")
                .join("mock_host.sh");
            for tool in TOOLS {
                let target = dir.path().join(tool);
                std::fs::copy(&script, &target).unwrap();
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
                    .unwrap();
            }
            dir
        })
        .path()
}

/// A temp directory of tool symlinks; the mock keeps its state next to them
struct MockHost {
    dir: TempDir,
}

impl MockHost {
    fn new() -> Self {
        let tools = mock_tools();
        let dir = tempfile::tempdir().unwrap();
        for tool in TOOLS {
            std::os::unix::fs::symlink(tools.join(tool), dir.path().join(tool)).unwrap();
        }
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn tool(&self, name: &str) -> String {
        self.path().join(name).to_string_lossy().into_owned()
    }

    fn config(&self) -> SetupConfig {
        let mut config = SetupConfig::default();
        config.paths.unit_dir = self.path().join("systemd");
        config.paths.limits_conf = self.path().join("limits.conf");
        config.paths.rules_export = self.path().join("etc-iptables").join("rules.v4");
        config.tools.apt_get = self.tool("apt-get");
        config.tools.pip = self.tool("pip3");
        config.tools.python = self.path().join("python3");
        config.tools.iptables = self.tool("iptables");
        config.tools.iptables_save = self.tool("iptables-save");
        config.tools.systemctl = self.tool("systemctl");
        config
    }

    /// Makes `tool` exit with `code` from now on
    fn fail(&self, tool: &str, code: i32) {
        std::fs::write(self.path().join(format!("fail-{tool}")), code.to_string()).unwrap();
    }

    fn rules(&self) -> Vec<String> {
        read_lines(&self.path().join("rules.state"))
    }

    fn calls(&self) -> Vec<String> {
        read_lines(&self.path().join("calls.log"))
    }

    fn calls_to(&self, tool: &str) -> Vec<String> {
        let prefix = format!("{tool} ");
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|text| text.lines().map(String::from).collect())
        .unwrap_or_default()
}

async fn run_setup(config: &SetupConfig) -> (Result<hostprep::setup::SetupReport, Error>, String) {
    let provisioner = Provisioner::new(config, config.firewall(), config.service_manager());
    let mut out = Vec::new();
    let result = provisioner.run(true, &mut out).await;
    (result, String::from_utf8(out).unwrap())
}

// ═══════════════════════════════════════════════════════════════════════════
// Firewall backend
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_iptables_reconcile_inserts_sixteen_then_none() {
    let host = MockHost::new();
    let config = host.config();
    let fw = config.firewall();
    let list = config.allow_list().unwrap();

    let first = reconcile(&fw, &list).await.unwrap();
    assert_eq!(first.inserted_count(), 16);
    assert_eq!(host.rules().len(), 16);

    let second = reconcile(&fw, &list).await.unwrap();
    assert_eq!(second.inserted_count(), 0);
    assert_eq!(second.present_count(), 16);
    assert_eq!(host.rules().len(), 16);

    let inserts = host
        .calls_to("iptables")
        .into_iter()
        .filter(|c| !c.starts_with("iptables -C"))
        .count();
    assert_eq!(inserts, 16);
}

#[tokio::test]
async fn test_loopback_goes_to_head_of_chain() {
    let host = MockHost::new();
    std::fs::write(
        host.path().join("rules.state"),
        "-A INPUT -s 198.51.100.0/24 -j DROP\n",
    )
    .unwrap();
    let config = host.config();

    reconcile(&config.firewall(), &config.allow_list().unwrap())
        .await
        .unwrap();

    let rules = host.rules();
    assert_eq!(rules[0], "-A INPUT -i lo -j ACCEPT");
    assert_eq!(rules[1], "-A INPUT -s 198.51.100.0/24 -j DROP");
    assert!(rules[2].starts_with("-A INPUT -s 173.245.48.0/20 -p tcp --dport 8080"));
}

#[tokio::test]
async fn test_persist_writes_export_file() {
    let host = MockHost::new();
    let config = host.config();

    let report = reconcile(&config.firewall(), &config.allow_list().unwrap())
        .await
        .unwrap();

    let export = report.persisted.unwrap();
    assert_eq!(export, config.paths.rules_export);
    let text = std::fs::read_to_string(&export).unwrap();
    assert!(text.contains("*filter"));
    assert!(text.contains("-A INPUT -i lo -j ACCEPT"));
    assert_eq!(text.matches("--dport 8080").count(), 15);
    assert!(text.trim_end().ends_with("COMMIT"));
}

#[tokio::test]
async fn test_persist_failure_keeps_rules() {
    let host = MockHost::new();
    host.fail("iptables-save", 1);
    let config = host.config();

    let report = reconcile(&config.firewall(), &config.allow_list().unwrap())
        .await
        .unwrap();

    assert!(report.persisted.is_none());
    assert_eq!(host.rules().len(), 16);
    assert!(!config.paths.rules_export.exists());
    assert_eq!(host.calls_to("iptables-save").len(), 1);
}

#[tokio::test]
async fn test_insert_failure_propagates_exit_code() {
    let host = MockHost::new();
    host.fail("iptables", 4);
    let config = host.config();

    let err = reconcile(&config.firewall(), &config.allow_list().unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Command { ref program, .. } if program.ends_with("iptables")));
    assert_eq!(err.exit_code(), 4);
    assert!(host.calls_to("iptables-save").is_empty());
}

#[tokio::test]
async fn test_check_error_is_not_absence() {
    let host = MockHost::new();
    host.fail("iptables", 2);
    let fw = host.config().firewall();

    let err = fw.rule_exists(&AllowRule::loopback()).await.unwrap_err();

    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_check_reports_missing_rules() {
    let host = MockHost::new();
    let config = host.config();
    let fw = config.firewall();
    let list = AllowList::cloudflare(8443).unwrap();

    fw.insert_rule(&AllowRule::loopback()).await.unwrap();

    let missing = plan(&fw, &list).await;
    assert_eq!(missing.len(), 15);
    assert!(missing.iter().all(|r| !r.is_loopback()));
    assert_eq!(host.rules().len(), 1);
}

#[tokio::test]
async fn test_systemctl_daemon_reload() {
    let host = MockHost::new();
    let manager = Systemctl::new(host.tool("systemctl"));

    manager.reload().await.unwrap();

    assert_eq!(host.calls_to("systemctl"), vec!["systemctl daemon-reload"]);
}

// ═══════════════════════════════════════════════════════════════════════════
// Full provisioning run
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_full_setup_against_mock_host() {
    let host = MockHost::new();
    let config = host.config();

    let (result, output) = run_setup(&config).await;
    let report = result.unwrap();

    assert!(output.contains("[1/7] Updating package index"));
    assert!(output.contains("[7/7] Installing systemd service"));
    assert!(output.contains("Setup Complete"));
    assert_eq!(report.firewall.inserted_count(), 16);
    assert_eq!(report.firewall.persisted.as_deref(), Some(config.paths.rules_export.as_path()));
    assert!(config.paths.rules_export.exists());

    let calls = host.calls();
    let expected_order = [
        "apt-get update",
        "apt-get install -y python3 python3-pip iptables iptables-persistent",
        "pip3 install --upgrade aiohttp motor dnspython uvloop",
        "python3 -c import aiohttp, motor",
    ];
    for (call, expected) in calls.iter().zip(expected_order) {
        assert_eq!(call, expected);
    }
    assert_eq!(calls.last().map(String::as_str), Some("systemctl daemon-reload"));

    let unit = std::fs::read_to_string(config.unit_path().unwrap()).unwrap();
    assert!(unit.contains("Restart=always"));
    assert!(unit.contains("Environment=PORT=8080"));
    let mode = std::fs::metadata(config.unit_path().unwrap())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o644);

    let limits = std::fs::read_to_string(&config.paths.limits_conf).unwrap();
    assert!(limits.contains("* soft nofile 65535"));
    assert!(limits.contains("* hard nofile 65535"));
}

#[tokio::test]
async fn test_second_setup_changes_nothing() {
    let host = MockHost::new();
    let config = host.config();

    run_setup(&config).await.0.unwrap();
    let limits_before = std::fs::read_to_string(&config.paths.limits_conf).unwrap();
    let unit_before = std::fs::read_to_string(config.unit_path().unwrap()).unwrap();

    let (result, output) = run_setup(&config).await;
    let report = result.unwrap();

    assert_eq!(report.firewall.inserted_count(), 0);
    assert_eq!(report.limits_appended, 0);
    assert_eq!(host.rules().len(), 16);
    assert_eq!(
        std::fs::read_to_string(&config.paths.limits_conf).unwrap(),
        limits_before
    );
    assert_eq!(
        std::fs::read_to_string(config.unit_path().unwrap()).unwrap(),
        unit_before
    );
    assert!(output.contains("Setup Complete"));
}

#[tokio::test]
async fn test_verification_failure_stops_setup() {
    let host = MockHost::new();
    host.fail("python3", 1);
    let config = host.config();

    let (result, output) = run_setup(&config).await;
    let err = result.unwrap_err();

    assert!(matches!(err, Error::RuntimeVerification { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(!output.contains("Setup Complete"));
    assert!(host.rules().is_empty());
    assert!(!config.unit_path().unwrap().exists());
}

#[tokio::test]
async fn test_apt_failure_exit_code_propagates() {
    let host = MockHost::new();
    host.fail("apt-get", 100);
    let config = host.config();

    let (result, output) = run_setup(&config).await;
    let err = result.unwrap_err();

    assert_eq!(err.exit_code(), 100);
    assert!(output.contains("[1/7]"));
    assert!(!output.contains("[2/7]"));
    assert!(host.calls_to("pip3").is_empty());
}

#[tokio::test]
async fn test_reload_failure_leaves_unit_file() {
    let host = MockHost::new();
    host.fail("systemctl", 1);
    let config = host.config();

    let (result, output) = run_setup(&config).await;

    assert!(result.is_err());
    assert!(config.unit_path().unwrap().exists());
    assert!(!output.contains("Setup Complete"));
}

#[tokio::test]
async fn test_unprivileged_setup_runs_no_tools() {
    let host = MockHost::new();
    let config = host.config();
    let provisioner = Provisioner::new(&config, config.firewall(), config.service_manager());

    let err = provisioner.run(false, &mut Vec::new()).await.unwrap_err();

    assert!(matches!(err, Error::Privilege));
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_custom_port_from_config_file() {
    let host = MockHost::new();
    let mut config = host.config();
    let json = serde_json::to_string(&config).unwrap();
    let file = host.path().join("hostprep.json");
    std::fs::write(&file, json.replace("\"port\":8080", "\"port\":2053")).unwrap();

    config = hostprep::config::load_config(Some(&file)).await.unwrap();
    assert_eq!(config.port, 2053);

    let (result, output) = run_setup(&config).await;
    result.unwrap();

    assert!(host.rules().iter().skip(1).all(|r| r.contains("--dport 2053")));
    assert!(output.contains("Full"));
}
