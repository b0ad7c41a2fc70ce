//! Validation of rule fields before they reach the ufw command line
//!
//! Desired rules come from a remote control plane and end up as process
//! arguments. Every field is checked here first, so a malformed record is
//! counted as a failed rule instead of producing an unexpected ufw invocation
//! (e.g. a "source" that starts with `-`).

use crate::core::rule::{ANY, CanonicalRule};

/// Maximum number of entries ufw accepts in a multiport list.
pub const MAX_PORT_LIST: usize = 15;

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

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

fn parse_port(text: &str) -> Result<u16, String> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("Invalid port '{text}'"));
    }
    let port = text
        .parse::<u16>()
        .map_err(|_| "Port must be between 1 and 65535".to_string())?;
    validate_port(port)
}

/// Whether a port field names more than one port (`lo:hi` or `a,b`).
pub fn is_multiport(port: &str) -> bool {
    port.contains(':') || port.contains(',')
}

/// Validates the port field of a rule.
///
/// Accepts `any`, a single port, a `lo:hi` range, or a comma separated list
/// of ports and ranges.
///
/// # Errors
///
/// Returns `Err` describing the first invalid entry.
pub fn validate_port_spec(port: &str) -> Result<(), String> {
    if port.eq_ignore_ascii_case(ANY) {
        return Ok(());
    }

    let entries: Vec<&str> = port.split(',').collect();
    if entries.len() > MAX_PORT_LIST {
        return Err(format!(
            "Too many ports in list (max {MAX_PORT_LIST})"
        ));
    }

    for entry in entries {
        match entry.split_once(':') {
            Some((start, end)) => {
                validate_port_range(parse_port(start)?, parse_port(end)?)?;
            }
            None => {
                parse_port(entry)?;
            }
        }
    }
    Ok(())
}

/// Validates the source field of a rule: `any`, an IP address, or a CIDR.
///
/// # Errors
///
/// Returns `Err` if the value does not parse as an address or network.
pub fn validate_source(from: &str) -> Result<(), String> {
    if from.eq_ignore_ascii_case(ANY) {
        return Ok(());
    }
    from.parse::<ipnetwork::IpNetwork>()
        .map(|_| ())
        .map_err(|e| format!("Invalid source address '{from}': {e}"))
}

/// Validates the protocol field of a rule.
///
/// ufw accepts protocol names (`tcp`, `udp`, `ah`, `esp`, `gre`, ...). Only
/// short lower-case identifiers are let through.
///
/// # Errors
///
/// Returns `Err` if the protocol is empty, too long, or has other characters.
pub fn validate_protocol(protocol: &str) -> Result<(), String> {
    if protocol == ANY {
        return Ok(());
    }
    if protocol.is_empty() || protocol.len() > 16 {
        return Err("Protocol must be 1-16 characters".to_string());
    }
    if !protocol
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        || !protocol.starts_with(|c: char| c.is_ascii_lowercase())
    {
        return Err(format!("Invalid protocol '{protocol}'"));
    }
    Ok(())
}

/// Validates every field of a canonical rule, plus the combinations ufw rejects.
///
/// # Errors
///
/// Returns `Err` with the first problem found.
pub fn validate_rule(rule: &CanonicalRule) -> Result<(), String> {
    validate_source(&rule.from)?;
    validate_protocol(&rule.protocol)?;
    validate_port_spec(&rule.port)?;

    if is_multiport(&rule.port) && !matches!(rule.protocol.as_str(), "tcp" | "udp") {
        return Err("Port ranges and lists require protocol tcp or udp".to_string());
    }
    if !rule.is_any_port() && !matches!(rule.protocol.as_str(), ANY | "tcp" | "udp") {
        return Err(format!(
            "Protocol '{}' does not support ports",
            rule.protocol
        ));
    }
    Ok(())
}
