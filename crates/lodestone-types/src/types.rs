use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A player's game profile (UUID + name + properties).
///
/// Attached to a session once login completes and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProfile {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<ProfileProperty>,
}

impl GameProfile {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Profile for a player admitted without authentication.
    pub fn offline(name: &str) -> Self {
        Self::new(offline_uuid(name), name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileProperty {
    pub name: String,
    pub value: String,
    pub signature: Option<String>,
}

/// Name-based (version 3) UUID of `"OfflinePlayer:" + name`.
///
/// Hashes the name bytes alone with no namespace, which is what vanilla
/// clients and servers expect for offline players.
pub fn offline_uuid(name: &str) -> Uuid {
    let digest = Md5::digest(format!("OfflinePlayer:{}", name).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    uuid::Builder::from_md5_bytes(bytes).into_uuid()
}

/// Text component for disconnect reasons and the MOTD (simplified JSON text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextComponent {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub extra: Vec<TextComponent>,
}

impl TextComponent {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: None,
            bold: None,
            extra: Vec::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"text":""}"#.to_string())
    }

    /// Parse a JSON text component. Bare JSON strings are accepted as plain text.
    pub fn from_json(json: &str) -> Option<Self> {
        if let Ok(component) = serde_json::from_str::<TextComponent>(json) {
            return Some(component);
        }
        serde_json::from_str::<String>(json).ok().map(Self::plain)
    }

    /// Concatenated text of this component and its children.
    pub fn flatten(&self) -> String {
        let mut out = self.text.clone();
        for child in &self.extra {
            out.push_str(&child.flatten());
        }
        out
    }
}

impl From<&str> for TextComponent {
    fn from(text: &str) -> Self {
        Self::plain(text)
    }
}

impl From<String> for TextComponent {
    fn from(text: String) -> Self {
        Self::plain(text)
    }
}

/// Server list ping response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub version: StatusVersion,
    pub players: StatusPlayers,
    pub description: TextComponent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: u32,
    pub online: u32,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sample: Vec<StatusSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSample {
    pub name: String,
    pub id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_uuid_matches_vanilla() {
        let uuid = offline_uuid("Steve");
        assert_eq!(uuid.get_version_num(), 3);
        assert_eq!(uuid.to_string(), "5627dd98-e6be-3c21-b8a8-e92344183641");
    }

    #[test]
    fn test_offline_uuid_is_stable_and_name_sensitive() {
        assert_eq!(offline_uuid("Alex"), offline_uuid("Alex"));
        assert_ne!(offline_uuid("Alex"), offline_uuid("alex"));
    }

    #[test]
    fn test_text_component_json() {
        let text = TextComponent::plain("Failed to verify username!");
        assert_eq!(text.to_json(), r#"{"text":"Failed to verify username!"}"#);
        assert_eq!(TextComponent::from_json(&text.to_json()), Some(text));
        assert_eq!(
            TextComponent::from_json(r#""Timed out""#),
            Some(TextComponent::plain("Timed out"))
        );
    }
}
