//! Request signing for the serverless endpoint.
//!
//! Every call carries an `x-serverless-sign` header: the hex HMAC-MD5 of
//! a canonical `k=v&k=v` string over the envelope fields, keyed by the
//! fixed client secret. Keys are sorted lexicographically and
//! empty-valued keys are dropped, so the signature is independent of
//! field order and of absent optional fields.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::Utc;
use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::{json, Value};

use super::{APP_ID, CLIENT_SECRET, SPACE_ID};

type HmacMd5 = Hmac<Md5>;

/// Builds the canonical signing string from scalar envelope fields.
pub fn canonical_string(fields: &BTreeMap<&str, String>) -> String {
    fields
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex HMAC-MD5 signature of the canonical string.
pub fn sign(fields: &BTreeMap<&str, String>) -> String {
    let mut mac = HmacMd5::new_from_slice(CLIENT_SECRET.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(canonical_string(fields).as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The impersonated mobile-client identity.
///
/// The device id must be stable for the whole process: rotating it per
/// request trips the vendor's anomaly detection.
pub fn client_info() -> &'static Value {
    static CLIENT_INFO: OnceLock<Value> = OnceLock::new();
    CLIENT_INFO.get_or_init(|| {
        let device_id = uuid::Uuid::new_v4().simple().to_string();
        json!({
            "PLATFORM": "app",
            "OS": "android",
            "APPID": APP_ID,
            "DEVICEID": device_id,
            "locale": "en",
            "appVersion": "3.4.0",
            "ua": "Mozilla/5.0 (Linux; Android 13) AppleWebKit/537.36 Mobile Safari/537.36",
        })
    })
}

/// A signed request body ready to POST.
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    pub body: Value,
    pub signature: String,
}

/// Assembles the outer envelope and its signature.
///
/// `params` must already be serialized: for
/// `serverless.function.runtime.invoke` the server requires the `params`
/// field to be a JSON *string*, and the signature is computed over that
/// string form.
pub fn envelope(method: &str, params: &str, token: Option<&str>) -> SignedEnvelope {
    let timestamp = Utc::now().timestamp_millis();

    let mut fields = BTreeMap::new();
    fields.insert("method", method.to_string());
    fields.insert("params", params.to_string());
    fields.insert("spaceId", SPACE_ID.to_string());
    fields.insert("timestamp", timestamp.to_string());
    if let Some(token) = token {
        fields.insert("token", token.to_string());
    }
    let signature = sign(&fields);

    let mut body = json!({
        "method": method,
        "params": params,
        "spaceId": SPACE_ID,
        "timestamp": timestamp,
    });
    if let Some(token) = token {
        body["token"] = Value::String(token.to_string());
    }

    SignedEnvelope { body, signature }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn canonical_string_sorts_keys() {
        let f = fields(&[("timestamp", "123"), ("method", "m"), ("spaceId", "s")]);
        assert_eq!(canonical_string(&f), "method=m&spaceId=s&timestamp=123");
    }

    #[test]
    fn signature_ignores_insertion_order_and_empty_values() {
        let forward = fields(&[("method", "m"), ("params", "{}"), ("timestamp", "1")]);
        let backward = fields(&[("timestamp", "1"), ("params", "{}"), ("method", "m")]);
        let with_empty = fields(&[
            ("method", "m"),
            ("params", "{}"),
            ("timestamp", "1"),
            ("token", ""),
        ]);
        assert_eq!(sign(&forward), sign(&backward));
        assert_eq!(sign(&forward), sign(&with_empty));
    }

    #[test]
    fn signature_is_lowercase_hex() {
        let sig = sign(&fields(&[("method", "m")]));
        assert_eq!(sig.len(), 32);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn client_device_id_is_stable_within_the_process() {
        let first = client_info()["DEVICEID"].as_str().unwrap().to_string();
        let second = client_info()["DEVICEID"].as_str().unwrap().to_string();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn envelope_keeps_params_as_a_string() {
        let signed = envelope("serverless.function.runtime.invoke", "{\"a\":1}", Some("tok"));
        assert!(signed.body["params"].is_string());
        assert_eq!(signed.body["token"], "tok");
        assert_eq!(signed.signature.len(), 32);
    }
}
