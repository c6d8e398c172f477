//! Device discovery.
//!
//! One signed call per account lists the registered power stations. The
//! result changes rarely, so it is gated by [`DeviceCache`] and only
//! refetched when the cache misses or the periodic refresh invalidates
//! it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::persistence::DeviceCache;

use super::api::ApiClient;
use super::auth::{AuthError, TokenSet};
use super::signing;

const METHOD_INVOKE: &str = "serverless.function.runtime.invoke";
const URL_DEVICE_LIST: &str = "client/device/kh/getList";

/// A discovered power station. The MAC (12 uppercase hex chars, no
/// separators) is the primary key across topics and caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub mac: String,
    pub name: String,
    pub model: String,
}

/// Lists the account's devices, cache-first.
pub async fn discover(
    api: &ApiClient,
    cache: &DeviceCache,
    email: &str,
    tokens: &TokenSet,
) -> Result<Vec<Device>, AuthError> {
    if let Some(devices) = cache.get(email) {
        log::debug!("Using {} cached devices", devices.len());
        return Ok(devices);
    }

    let params = json!({
        "functionTarget": "router",
        "functionArgs": {
            "$url": URL_DEVICE_LIST,
            "data": { "locale": "en", "pageIndex": 1, "pageSize": 100 },
            "clientInfo": signing::client_info(),
            "uniIdToken": tokens.login,
        },
    })
    .to_string();

    let data = api
        .invoke(METHOD_INVOKE, &params, Some(&tokens.anonymous))
        .await
        .map_err(|source| AuthError::Stage {
            stage: "device discovery",
            source,
        })?;

    let devices = parse_device_list(&data);
    log::info!("Discovered {} devices", devices.len());
    cache.put(email, &devices);
    Ok(devices)
}

/// Extracts devices from the discovery payload, skipping entries without
/// a usable MAC. The MAC arrives colon-separated from some firmware
/// revisions; it is normalized to the bare uppercase form used in
/// topics.
fn parse_device_list(data: &Value) -> Vec<Device> {
    let rows = data
        .get("rows")
        .or_else(|| data.get("list"))
        .and_then(Value::as_array);
    let Some(rows) = rows else {
        log::warn!("Device list response has an unexpected shape");
        return Vec::new();
    };

    rows.iter()
        .filter_map(|row| {
            let raw_mac = row.get("device_id").or_else(|| row.get("mac"))?.as_str()?;
            let mac = normalize_mac(raw_mac)?;
            let name = row
                .get("device_name")
                .or_else(|| row.get("name"))
                .and_then(Value::as_str)
                .unwrap_or(&mac)
                .to_string();
            let model = row
                .get("product_name")
                .or_else(|| row.get("model"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            Some(Device { mac, name, model })
        })
        .collect()
}

fn normalize_mac(raw: &str) -> Option<String> {
    let mac: String = raw
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if mac.len() == 12 && mac.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(mac)
    } else {
        log::warn!("Skipping device with malformed MAC {raw:?}");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separated_and_lowercase_macs() {
        assert_eq!(
            normalize_mac("7c:2c:67:ab:5f:0e").as_deref(),
            Some("7C2C67AB5F0E")
        );
        assert_eq!(normalize_mac("7C2C67AB5F0E").as_deref(), Some("7C2C67AB5F0E"));
        assert_eq!(normalize_mac("nope"), None);
        assert_eq!(normalize_mac("7C2C67AB5F"), None);
    }

    #[test]
    fn parses_the_row_shape() {
        let data = json!({
            "rows": [
                { "device_id": "7C:2C:67:AB:5F:0E", "device_name": "Garage", "product_name": "F2400" },
                { "device_id": "bogus" },
            ],
            "total": 2,
        });
        let devices = parse_device_list(&data);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mac, "7C2C67AB5F0E");
        assert_eq!(devices[0].name, "Garage");
        assert_eq!(devices[0].model, "F2400");
    }

    #[test]
    fn unexpected_shape_yields_no_devices() {
        assert!(parse_device_list(&json!({ "unexpected": true })).is_empty());
    }
}
