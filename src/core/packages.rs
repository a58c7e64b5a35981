//! OS and Python package installation
//!
//! Thin wrappers around `apt-get`, `pip3` and `python3`. Each function runs one
//! tool and fails with the tool's exit code.

use crate::core::error::{Error, Result};
use crate::core::exec;
use tracing::info;

/// Tool paths and package lists for the package steps
#[derive(Debug, Clone)]
pub struct PackagePlan<'a> {
    pub apt_get: &'a str,
    pub pip: &'a str,
    pub python: &'a str,
    pub os_packages: &'a [String],
    pub python_packages: &'a [String],
    pub pip_extra_args: &'a [String],
    pub required_imports: &'a [String],
}

/// `apt-get update`
pub async fn update_index(plan: &PackagePlan<'_>) -> Result<()> {
    exec::run(plan.apt_get, &["update"], &[("DEBIAN_FRONTEND", "noninteractive")]).await?;
    info!("Package index updated");
    Ok(())
}

/// `apt-get install -y <os_packages>`
pub async fn install_os_packages(plan: &PackagePlan<'_>) -> Result<()> {
    if plan.os_packages.is_empty() {
        return Ok(());
    }
    let mut args = vec!["install".to_string(), "-y".to_string()];
    args.extend(plan.os_packages.iter().cloned());

    // iptables-persistent asks whether to save current rules unless told otherwise
    exec::run(plan.apt_get, &args, &[("DEBIAN_FRONTEND", "noninteractive")]).await?;
    info!("Installed OS packages: {}", plan.os_packages.join(" "));
    Ok(())
}

/// `pip3 install --upgrade <python_packages>`
pub async fn install_python_packages(plan: &PackagePlan<'_>) -> Result<()> {
    if plan.python_packages.is_empty() {
        return Ok(());
    }
    let mut args = vec!["install".to_string(), "--upgrade".to_string()];
    args.extend(plan.pip_extra_args.iter().cloned());
    args.extend(plan.python_packages.iter().cloned());

    exec::run(plan.pip, &args, &[]).await?;
    info!(
        "Installed Python packages: {}",
        plan.python_packages.join(" ")
    );
    Ok(())
}

/// Builds the `import a, b` statement for the verification step.
///
/// # Errors
///
/// Returns `Err` if a module name is not a dotted Python identifier.
pub fn import_statement(modules: &[String]) -> Result<String> {
    for module in modules {
        let valid = !module.is_empty()
            && module.split('.').all(|part| {
                let mut chars = part.chars();
                chars
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if !valid {
            return Err(Error::validation(
                "required_imports",
                format!("'{module}' is not a Python module name"),
            ));
        }
    }
    Ok(format!("import {}", modules.join(", ")))
}

/// Imports the required modules with the target interpreter.
///
/// # Errors
///
/// Returns `Error::RuntimeVerification` if any import fails.
pub async fn verify_imports(plan: &PackagePlan<'_>) -> Result<()> {
    if plan.required_imports.is_empty() {
        return Ok(());
    }
    let statement = import_statement(plan.required_imports)?;

    let out = exec::output(plan.python, &["-c", statement.as_str()], &[]).await?;
    if out.success {
        info!("Python imports verified: {}", plan.required_imports.join(", "));
        return Ok(());
    }

    let message = out
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("import failed")
        .to_string();
    Err(Error::RuntimeVerification {
        message,
        exit_code: out.exit_code,
    })
}
