//! Input checks for client registrations.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

/// Longest DNS name, and so the longest address accepted.
pub const MAX_ADDRESS_LEN: usize = 253;
pub const MAX_IDENTITY_LEN: usize = 128;

static HOSTNAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*\.?$").ok()
});

/// An IP literal or a DNS host name.
pub fn validate_address(address: &str) -> Result<(), String> {
    if address.is_empty() {
        return Err("address must not be empty".to_string());
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(format!("address longer than {MAX_ADDRESS_LEN} characters"));
    }
    if address.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    match HOSTNAME.as_ref() {
        Some(re) if re.is_match(address) => Ok(()),
        _ => Err(format!("{address:?} is not an IP address or hostname")),
    }
}

pub fn validate_identity(identity: &str) -> Result<(), String> {
    if identity.is_empty() {
        return Err("identity must not be empty".to_string());
    }
    if identity.chars().count() > MAX_IDENTITY_LEN {
        return Err(format!("identity longer than {MAX_IDENTITY_LEN} characters"));
    }
    if identity.chars().any(char::is_control) {
        return Err("identity must not contain control characters".to_string());
    }
    Ok(())
}
