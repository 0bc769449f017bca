//! Version information exchanged during the initialization handshake.

use serde::{Deserialize, Serialize};

/// browsewire version from Cargo.toml
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CLIENT_NAME: &str = "browsewire";

/// Protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Identity of one side of the connection (`clientInfo` / `serverInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

impl PeerInfo {
    pub fn client() -> Self {
        Self {
            name: CLIENT_NAME.to_string(),
            version: CLIENT_VERSION.to_string(),
        }
    }
}

/// Version information for a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub client: &'static str,
    /// Server identity, if the handshake reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<PeerInfo>,
    /// Protocol revision the server agreed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            client: CLIENT_VERSION,
            server: None,
            protocol: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server: PeerInfo) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_protocol(mut self, protocol: String) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Build from an `initialize` result, ignoring fields that are absent or malformed.
    pub fn from_initialize_result(result: &serde_json::Value) -> Self {
        let mut info = Self::new();
        if let Some(server) = result.get("serverInfo")
            && let Ok(peer) = serde_json::from_value::<PeerInfo>(server.clone())
        {
            info = info.with_server(peer);
        }
        if let Some(protocol) = result.get("protocolVersion").and_then(|v| v.as_str()) {
            info = info.with_protocol(protocol.to_string());
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_info_has_client_version() {
        let info = VersionInfo::new();
        assert_eq!(info.client, CLIENT_VERSION);
        assert!(info.server.is_none());
        assert!(info.protocol.is_none());
    }

    #[test]
    fn parses_initialize_result() {
        let info = VersionInfo::from_initialize_result(&json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "Playwright", "version": "0.0.30"},
            "capabilities": {"tools": {}}
        }));
        assert_eq!(
            info.server,
            Some(PeerInfo {
                name: "Playwright".to_string(),
                version: "0.0.30".to_string(),
            })
        );
        assert_eq!(info.protocol.as_deref(), Some("2024-11-05"));
    }

    #[test]
    fn tolerates_sparse_initialize_result() {
        let info = VersionInfo::from_initialize_result(&json!({"serverInfo": "nonsense"}));
        assert!(info.server.is_none());
        assert!(info.protocol.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            client: "0.1.0",
            server: None,
            protocol: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "client": "0.1.0"
        }
        "#);
    }
}
