//! Bridge status reporting.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

/// One account line in the status report.
pub struct AccountStatus {
    pub email: String,
    pub connected: bool,
    pub device_count: usize,
}

/// One device line in the status report.
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub model: String,
    pub cloud_connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Masks an email to its local part's first and last character, e.g.
/// `john@example.com` -> `j***n@example.com`.
pub fn mask_email(email: &str) -> String {
    let (local, domain) = match email.split_once('@') {
        Some(parts) => parts,
        None => return "***".to_string(),
    };
    let mut chars = local.chars();
    let first = chars.next();
    let last = chars.next_back();
    match (first, last) {
        (Some(first), Some(last)) => format!("{first}***{last}@{domain}"),
        (Some(first), None) => format!("{first}***@{domain}"),
        _ => format!("***@{domain}"),
    }
}

pub fn build_status(
    status: &str,
    uptime_seconds: u64,
    accounts: &[AccountStatus],
    devices: &[DeviceStatus],
) -> Value {
    json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime_seconds,
        "accounts": accounts.iter().map(|a| json!({
            "email": mask_email(&a.email),
            "connected": a.connected,
            "device_count": a.device_count,
        })).collect::<Vec<_>>(),
        "devices": devices.iter().map(|d| json!({
            "id": d.id,
            "name": d.name,
            "model": d.model,
            "cloudConnected": d.cloud_connected,
            "lastSeen": d.last_seen.map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        })).collect::<Vec<_>>(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}
