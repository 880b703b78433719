//! The narrow contract to the external message catalog.
//!
//! The several hundred concrete charging-domain payloads live outside this
//! crate. The core only needs to know whether a payload is dispatchable for
//! its action; everything else stays opaque bytes.

use std::collections::HashSet;

/// Implemented by the surrounding application's payload catalog.
pub trait ActionCatalog: Send + Sync {
    /// Validate the payload for `action`. `Err` carries the human-readable
    /// parse failure the dispatcher reports as `CouldNotParse`.
    fn try_parse(&self, action: &str, payload: &[u8]) -> Result<(), String>;
}

/// Accepts every action and payload. The default for relay-only nodes that
/// never look inside the messages they carry.
#[derive(Debug, Default)]
pub struct PermissiveCatalog;

impl ActionCatalog for PermissiveCatalog {
    fn try_parse(&self, _action: &str, _payload: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

/// Knows a fixed set of action names and requires their payloads to be JSON
/// objects. Unknown actions fail at dispatch time, not decode time.
#[derive(Debug, Default)]
pub struct KnownActionsCatalog {
    actions: HashSet<String>,
}

impl KnownActionsCatalog {
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(actions: I) -> KnownActionsCatalog {
        KnownActionsCatalog {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }
}

impl ActionCatalog for KnownActionsCatalog {
    fn try_parse(&self, action: &str, payload: &[u8]) -> Result<(), String> {
        if !self.actions.contains(action) {
            return Err(format!("unknown action {}", action));
        }
        match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(value) if value.is_object() => Ok(()),
            Ok(_) => Err("payload is not a JSON object".to_string()),
            Err(e) => Err(format!("payload is not valid JSON: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissive_accepts_anything() {
        let catalog = PermissiveCatalog;
        assert!(catalog.try_parse("Whatever", b"\xFF\x00").is_ok());
    }

    #[test]
    fn test_known_actions() {
        let catalog = KnownActionsCatalog::new(["Authorize", "Heartbeat"]);
        assert!(catalog.try_parse("Authorize", br#"{"idToken":"A"}"#).is_ok());
        assert!(catalog.try_parse("Authorize", b"[]").is_err());
        assert!(catalog.try_parse("Authorize", b"nope").is_err());
        assert!(catalog.try_parse("NoSuchAction", b"{}").is_err());
    }
}
