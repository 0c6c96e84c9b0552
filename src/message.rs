//! Outbound message envelope for live-update notifications
//!
//! The hub treats the serialized envelope as an opaque payload; the `type`
//! field is interpreted only by browser clients.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Message type sent when a full page reload is required
pub const TYPE_FULL_RELOAD: &str = "full_reload";
/// Message type sent when a single component has been rebuilt
pub const TYPE_COMPONENT_UPDATE: &str = "component_update";
/// Message type sent when only stylesheets changed
pub const TYPE_CSS_UPDATE: &str = "css_update";

/// Envelope pushed to every connected browser client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadMessage {
    /// Message type (e.g. "full_reload", "component_update", "css_update")
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific content (component name, stylesheet path, ...)
    pub content: String,

    /// Unix timestamp (seconds) at which the change was observed
    pub timestamp: u64,
}

impl ReloadMessage {
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            timestamp: unix_timestamp(),
        }
    }

    /// Tell all clients to reload the page
    pub fn full_reload() -> Self {
        Self::new(TYPE_FULL_RELOAD, "")
    }

    /// Tell all clients that a component was rebuilt
    pub fn component_update(component: impl Into<String>) -> Self {
        Self::new(TYPE_COMPONENT_UPDATE, component)
    }

    /// Tell all clients to re-fetch a stylesheet
    pub fn css_update(path: impl Into<String>) -> Self {
        Self::new(TYPE_CSS_UPDATE, path)
    }

    /// Serialize for fan-out; the hub never looks inside the result
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Current unix time in seconds; clamps to 0 if the clock is before the epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_shape() {
        let msg = ReloadMessage::component_update("navbar");
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "component_update");
        assert_eq!(value["content"], "navbar");
        assert!(value["timestamp"].is_u64());
    }

    #[test]
    fn test_constructors() {
        assert_eq!(ReloadMessage::full_reload().kind, TYPE_FULL_RELOAD);
        assert_eq!(ReloadMessage::css_update("app.css").kind, TYPE_CSS_UPDATE);
        assert_eq!(ReloadMessage::css_update("app.css").content, "app.css");
    }

    #[test]
    fn test_roundtrip() {
        let msg = ReloadMessage::full_reload();
        let parsed: ReloadMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }
}
