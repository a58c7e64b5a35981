use thiserror::Error;

/// Core error types for hostprep
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An external tool (apt-get, pip, iptables, systemctl) failed
    #[error("{program} failed: {message}")]
    Command {
        program: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Not running with administrative privileges
    #[error("This tool must be run as root (try: sudo hostprep)")]
    Privilege,

    /// Required runtime modules could not be imported after installation
    #[error("Runtime package verification failed: {message}")]
    RuntimeVerification {
        message: String,
        exit_code: Option<i32>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Process exit status for this error.
    ///
    /// Privilege errors exit with 1. Command failures propagate the tool's own
    /// exit code; anything without one falls back to 1.
    pub fn exit_code(&self) -> u8 {
        let code = match self {
            Error::Command { exit_code, .. } | Error::RuntimeVerification { exit_code, .. } => {
                exit_code.unwrap_or(1)
            }
            _ => 1,
        };
        // Exit statuses are a single byte; a zero here would report success
        match u8::try_from(code) {
            Ok(0) | Err(_) => 1,
            Ok(c) => c,
        }
    }

    /// The stderr of the failing tool, when there is one
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::Command { stderr, .. } => stderr.as_deref(),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of tool error patterns and their translations
pub struct CommandErrorPattern;

impl CommandErrorPattern {
    /// Matches a tool's error output against known patterns and returns a
    /// user-friendly translation.
    pub fn match_error(program: &str, msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new(format!("Insufficient permissions to run {program}"))
                .with_suggestion("Re-run with sudo")
                .with_suggestion("Check if CAP_NET_ADMIN is available inside containers");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new(format!("{program} is not installed or not in PATH"))
                .with_suggestion("Install it: sudo apt install iptables iptables-persistent")
                .with_suggestion("Or point the config file at the right binary");
        }

        // dpkg/apt lock held by unattended-upgrades or another apt
        if lower.contains("could not get lock") || lower.contains("dpkg frontend lock") {
            return ErrorTranslation::new("The package manager is locked by another process")
                .with_suggestion("Wait for unattended-upgrades to finish")
                .with_suggestion("Check running apt processes: ps aux | grep apt");
        }

        if lower.contains("externally-managed-environment") {
            return ErrorTranslation::new("pip refuses to install into the system Python")
                .with_suggestion("Set \"pip_extra_args\": [\"--break-system-packages\"] in the config")
                .with_suggestion("Or install the packages from apt (python3-aiohttp, ...)");
        }

        if lower.contains("modulenotfounderror") || lower.contains("no module named") {
            return ErrorTranslation::new("Python packages are missing after installation")
                .with_suggestion("Check that pip3 and python3 belong to the same interpreter")
                .with_suggestion("Run: python3 -m pip list");
        }

        if lower.contains("xtables lock") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        if lower.contains("by that name") || lower.contains("can't initialize iptables table") {
            return ErrorTranslation::new("iptables kernel support is missing")
                .with_suggestion("Load the module: sudo modprobe ip_tables")
                .with_suggestion("On nftables-only hosts install iptables-nft");
        }

        if lower.contains("not been booted with systemd") || lower.contains("failed to connect to bus")
        {
            return ErrorTranslation::new("systemd is not running on this host")
                .with_suggestion("Containers usually lack systemd; run the service directly")
                .with_suggestion("The unit file was still written and can be used later");
        }

        ErrorTranslation::new(format!("{program} error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
