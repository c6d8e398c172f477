//! Vendor cloud protocol: endpoints, signed HTTP calls, the three-stage
//! authentication handshake and device discovery.

pub mod api;
pub mod auth;
pub mod devices;
pub mod signing;

pub use auth::{AuthEngine, AuthError, TokenSet};
pub use devices::Device;

/// Serverless HTTP endpoint shared by every handshake stage.
pub const API_ENDPOINT: &str = "https://api.next.bspapp.com/client";

/// Vendor application space.
pub const SPACE_ID: &str = "mp-6c382a98-49b8-40ba-b761-645d83e8ee74";

/// Fixed signing secret baked into the vendor's mobile application.
pub const CLIENT_SECRET: &str = "5rCEdl/nx7IgViBe4QYRiQ==";

/// Application id the bridge impersonates.
pub const APP_ID: &str = "__UNI__55F5E7F";

/// MQTT-over-WebSocket endpoint of the vendor cloud.
pub const MQTT_URL: &str = "wss://mqtt.sydpower.com:8083/mqtt";

/// Fixed MQTT password; the username is the per-account MQTT token.
pub const MQTT_PASSWORD: &str = "helloyou";

/// Cloud topic the bridge publishes Modbus requests on.
pub fn device_request_topic(mac: &str) -> String {
    format!("{mac}/client/request/data")
}

/// The three per-device response topics the bridge subscribes to.
pub fn device_response_filters(mac: &str) -> [String; 3] {
    [
        format!("{mac}/device/response/client/04"),
        format!("{mac}/device/response/client/data"),
        format!("{mac}/device/response/state"),
    ]
}

/// Classification of an incoming cloud topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTopic {
    /// `{mac}/device/response/client/04`: command/event response, always
    /// current, authoritative for output bits.
    CommandResponse,
    /// `{mac}/device/response/client/data`: periodic poll response; output
    /// bits may be stale during an active session.
    Poll,
    /// `{mac}/device/response/state`: liveness signal with an
    /// undocumented payload.
    State,
}

/// Splits a cloud topic into device MAC and response class.
pub fn parse_response_topic(topic: &str) -> Option<(&str, ResponseTopic)> {
    let (mac, rest) = topic.split_once('/')?;
    if mac.len() != 12 || !mac.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let kind = match rest {
        "device/response/client/04" => ResponseTopic::CommandResponse,
        "device/response/client/data" => ResponseTopic::Poll,
        "device/response/state" => ResponseTopic::State,
        _ => return None,
    };
    Some((mac, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_response_topics() {
        assert_eq!(
            parse_response_topic("7C2C67AB5F0E/device/response/client/04"),
            Some(("7C2C67AB5F0E", ResponseTopic::CommandResponse))
        );
        assert_eq!(
            parse_response_topic("7C2C67AB5F0E/device/response/client/data"),
            Some(("7C2C67AB5F0E", ResponseTopic::Poll))
        );
        assert_eq!(
            parse_response_topic("7C2C67AB5F0E/device/response/state"),
            Some(("7C2C67AB5F0E", ResponseTopic::State))
        );
    }

    #[test]
    fn rejects_foreign_topics() {
        assert_eq!(parse_response_topic("7C2C67AB5F0E/client/request/data"), None);
        assert_eq!(parse_response_topic("not-a-mac/device/response/state"), None);
        assert_eq!(parse_response_topic("fossibot/ABC/command"), None);
    }
}
