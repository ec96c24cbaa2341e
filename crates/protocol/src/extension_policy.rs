use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The managed Chrome enterprise policy document. Only `force_install` and
/// `extension_settings` are owned by this system; every other top-level key must
/// round-trip unchanged (`unknown`, via `#[serde(flatten)]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagedPolicy {
    #[serde(rename = "ExtensionInstallForcelist", default)]
    pub force_install: Vec<String>,
    #[serde(rename = "ExtensionSettings", default)]
    pub extension_settings: Map<String, Value>,
    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}

impl ManagedPolicy {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Add (or leave alone, if already present) a force-installed extension.
    /// Dedup key is the `{id};` prefix of the forcelist entry.
    pub fn add_forced_extension(&mut self, id: &str, update_url: &str) {
        let prefix = format!("{id};");
        if self.force_install.iter().any(|e| e.starts_with(&prefix)) {
            return;
        }
        self.force_install.push(format!("{id};{update_url}"));
    }

    pub fn set_extension_settings(&mut self, id: &str, settings: Value) {
        self.extension_settings.insert(id.to_string(), settings);
    }
}

/// The subset of `manifest.json` this system inspects.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionManifest {
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl ExtensionManifest {
    pub fn requires_enterprise_policy(&self) -> bool {
        self.permissions
            .iter()
            .any(|p| p == "webRequest" || p == "webRequestBlocking")
    }
}

/// Validates a Chrome extension id: 32 lowercase letters a-p (Chrome's base-16-in-a-p
/// encoding of the extension's public key hash).
pub fn is_valid_appid(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| (b'a'..=b'p').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_ID: &str = "abcdefghijklmnopabcdefghijklmnop";

    #[test]
    fn unknown_keys_round_trip() {
        let raw = r#"{"SomeVendorSetting": {"nested": true}, "ExtensionInstallForcelist": []}"#;
        let policy = ManagedPolicy::parse(raw).unwrap();
        assert!(policy.unknown.contains_key("SomeVendorSetting"));
        let rewritten = policy.to_pretty_json().unwrap();
        let reparsed = ManagedPolicy::parse(&rewritten).unwrap();
        assert_eq!(
            reparsed.unknown.get("SomeVendorSetting"),
            policy.unknown.get("SomeVendorSetting")
        );
    }

    #[test]
    fn add_forced_extension_dedups_by_id_prefix() {
        let mut policy = ManagedPolicy::default();
        policy.add_forced_extension(SAMPLE_ID, "https://example.com/foo/update.xml");
        policy.add_forced_extension(SAMPLE_ID, "https://example.com/bar/update.xml");
        assert_eq!(policy.force_install.len(), 1);
        assert!(policy.force_install[0].starts_with(&format!("{SAMPLE_ID};")));
    }

    #[test]
    fn empty_document_parses_to_default() {
        let policy = ManagedPolicy::parse("").unwrap();
        assert!(policy.force_install.is_empty());
    }

    #[test]
    fn appid_validation() {
        assert!(is_valid_appid(SAMPLE_ID));
        assert!(!is_valid_appid("too-short"));
        assert!(!is_valid_appid("ABCDEFGHIJKLMNOPABCDEFGHIJKLMNOP")); // uppercase rejected
        assert!(!is_valid_appid("qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq")); // q is outside a-p
    }

    #[test]
    fn manifest_flags_web_request_permission() {
        let manifest: ExtensionManifest =
            serde_json::from_str(r#"{"name":"x","permissions":["webRequest","tabs"]}"#).unwrap();
        assert!(manifest.requires_enterprise_policy());

        let benign: ExtensionManifest =
            serde_json::from_str(r#"{"name":"x","permissions":["tabs"]}"#).unwrap();
        assert!(!benign.requires_enterprise_policy());
    }
}
