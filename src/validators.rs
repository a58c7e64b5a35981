//! Input validation and sanitization functions for hostprep
//!
//! Everything that ends up in a firewall command line or in the generated unit
//! file passes through here first. Values come from the JSON config file or
//! the environment, so nothing is trusted.

use ipnetwork::IpNetwork;
use std::path::Path;

/// Ports Cloudflare proxies over HTTPS.
pub const PROXY_HTTPS_PORTS: [u16; 6] = [443, 2053, 2083, 2087, 2096, 8443];

/// Ports Cloudflare proxies over plain HTTP.
pub const PROXY_HTTP_PORTS: [u16; 7] = [80, 8080, 8880, 2052, 2082, 2086, 2095];

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Parses a port from an environment-style string value.
///
/// # Errors
///
/// Returns `Err` if the value is not a number in 1..=65535.
pub fn parse_port(input: &str) -> Result<u16, String> {
    let port = input
        .trim()
        .parse::<u16>()
        .map_err(|_| format!("'{input}' is not a valid port number"))?;
    validate_port(port)
}

/// Parses a CIDR block and checks it names a network, not a host inside one.
///
/// `iptables` silently masks host bits (`10.0.0.5/8` becomes `10.0.0.0/8`),
/// which would make our existence checks disagree with what got inserted.
///
/// # Errors
///
/// Returns `Err` if the string is not CIDR notation or has host bits set.
pub fn validate_cidr(input: &str) -> Result<IpNetwork, String> {
    let network: IpNetwork = input
        .trim()
        .parse()
        .map_err(|e| format!("Invalid CIDR '{input}': {e}"))?;
    check_network_address(network)
}

/// Checks that a parsed network has no host bits set.
///
/// # Errors
///
/// Returns `Err` if the address is not the network address of its prefix.
pub fn check_network_address(network: IpNetwork) -> Result<IpNetwork, String> {
    if network.ip() != network.network() {
        return Err(format!(
            "{network} has host bits set (did you mean {}/{}?)",
            network.network(),
            network.prefix()
        ));
    }
    Ok(network)
}

/// Validates a path that will be written into a unit file.
///
/// # Errors
///
/// Returns `Err` if the path is relative or contains whitespace or control
/// characters (systemd would split or reject it).
pub fn validate_absolute_path(path: &Path) -> Result<(), String> {
    if !path.is_absolute() {
        return Err(format!("{} must be an absolute path", path.display()));
    }
    let text = path.to_string_lossy();
    if text.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!(
            "{} contains whitespace or control characters",
            path.display()
        ));
    }
    Ok(())
}

/// Validates an environment variable name for `Environment=` lines.
///
/// # Errors
///
/// Returns `Err` unless the key is `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_env_key(key: &str) -> Result<(), String> {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(format!("Invalid environment variable name '{key}'")),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("Invalid environment variable name '{key}'"));
    }
    Ok(())
}

/// Validates an environment value.
///
/// # Errors
///
/// Returns `Err` if the value contains control characters or a double quote.
pub fn validate_env_value(value: &str) -> Result<(), String> {
    if value.chars().any(|c| c.is_control() || c == '"') {
        return Err("Environment values cannot contain control characters or quotes".to_string());
    }
    Ok(())
}

/// Validates a systemd unit name (without the `.service` suffix).
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or uses characters systemd
/// does not allow in unit names.
pub fn validate_unit_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Service name cannot be empty".to_string());
    }
    if name.len() > 200 {
        return Err("Service name too long (max 200 characters)".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.' | '@'))
    {
        return Err(format!("Service name '{name}' contains invalid characters"));
    }
    Ok(())
}

/// Strips control characters from a unit description.
///
/// A newline in `Description=` would start a new directive.
pub fn sanitize_description(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .take(256)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Checks whether the reverse proxy will forward to this port.
///
/// This is informational only and does not block setup.
pub fn check_proxy_port(port: u16) -> Option<String> {
    if PROXY_HTTPS_PORTS.contains(&port) || PROXY_HTTP_PORTS.contains(&port) {
        None
    } else {
        Some(format!(
            "Port {port} is not proxied by Cloudflare; use one of {PROXY_HTTPS_PORTS:?} (HTTPS) or {PROXY_HTTP_PORTS:?} (HTTP)"
        ))
    }
}

/// Checks if a proxy range looks like a local network and returns a warning.
///
/// This is informational only. A private range in the allow-list usually means
/// a typo in the config file. IPv6 ranges are rejected earlier by
/// `AllowList::new` and get no warning here.
pub fn check_reserved_range(network: IpNetwork) -> Option<String> {
    let IpNetwork::V4(v4) = network else {
        return None;
    };
    let ip = v4.ip();
    if ip.is_private() {
        return Some(format!("{network} is a private range (RFC 1918)"));
    }
    if ip.is_loopback() {
        return Some(format!("{network} is loopback; the loopback rule already covers it"));
    }
    if ip.is_link_local() {
        return Some(format!("{network} is link-local"));
    }
    None
}
