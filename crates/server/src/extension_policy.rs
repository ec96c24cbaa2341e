//! Extension policy applier: unpacks an uploaded extension archive, validates its
//! manifest and optional `update.xml`, and read-modify-writes the managed Chrome
//! enterprise policy document while preserving every key this system doesn't own.
//!
//! Dynamic-JSON handling leans on the general `serde_json::Value`/`Map` idiom for
//! loosely-typed payloads. The policy document is written to a temp file and renamed
//! into place so it is never observed half-written by a concurrent reader.

use std::io::Read;
use std::path::{Path, PathBuf};

use ghost_protocol::extension_policy::{is_valid_appid, ExtensionManifest, ManagedPolicy};
use ghost_protocol::AppError;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tokio::sync::Mutex;

use crate::config::ExtensionPolicyConfig;

pub struct UnpackResult {
    pub extension_id: Option<String>,
    pub requires_enterprise_policy: bool,
    pub loopback_update_url: Option<String>,
}

pub struct ExtensionPolicyApplier {
    config: ExtensionPolicyConfig,
    write_lock: Mutex<()>,
}

impl ExtensionPolicyApplier {
    pub fn new(config: ExtensionPolicyConfig) -> Self {
        Self {
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Unpacks `archive` into `extensions_dir/name`, always clearing the directory
    /// first so retries after a partial failure self-heal rather than accumulate
    /// stale files.
    pub async fn unpack_and_validate(
        &self,
        archive: Vec<u8>,
        name: String,
    ) -> Result<UnpackResult, AppError> {
        let dest = self.config.extensions_dir.join(sanitize_component(&name)?);
        let loopback_port = self.config.loopback_port;

        tokio::task::spawn_blocking(move || unpack_archive_blocking(archive, &dest, loopback_port))
            .await
            .map_err(|e| AppError::Other(anyhow::anyhow!("unpack task panicked: {e}")))?
    }

    /// Adds the extension to the managed policy's force-install list if required,
    /// under a process-wide lock serializing read-modify-write cycles.
    pub async fn apply_policy(&self, result: &UnpackResult) -> Result<(), AppError> {
        if !result.requires_enterprise_policy {
            return Ok(());
        }
        let extension_id = result
            .extension_id
            .as_ref()
            .ok_or_else(|| {
                AppError::InvalidParams(
                    "extension requires enterprise policy but no valid appid was provided".to_string(),
                )
            })?;
        let update_url = result.loopback_update_url.as_ref().ok_or_else(|| {
            AppError::InvalidParams("extension requires an update.xml to be force-installed".to_string())
        })?;

        let _guard = self.write_lock.lock().await;

        let raw = match tokio::fs::read_to_string(&self.config.policy_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(AppError::Other(e.into())),
        };
        let mut policy = ManagedPolicy::parse(&raw).map_err(|e| AppError::Other(e.into()))?;
        policy.add_forced_extension(extension_id, update_url);

        let rendered = policy.to_pretty_json().map_err(|e| AppError::Other(e.into()))?;
        write_atomic(&self.config.policy_path, &rendered)
            .await
            .map_err(AppError::Other)?;
        Ok(())
    }
}

fn sanitize_component(name: &str) -> Result<&str, AppError> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(AppError::InvalidParams(format!(
            "invalid extension name: {name}"
        )));
    }
    Ok(name)
}

fn unpack_archive_blocking(
    archive: Vec<u8>,
    dest: &Path,
    loopback_port: u16,
) -> Result<UnpackResult, AppError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| AppError::Other(e.into()))?;
    }
    std::fs::create_dir_all(dest).map_err(|e| AppError::Other(e.into()))?;

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive))
        .map_err(|e| AppError::InvalidParams(format!("not a valid zip archive: {e}")))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| AppError::InvalidParams(format!("corrupt zip entry: {e}")))?;
        let Some(relative) = entry.enclosed_name() else {
            continue; // reject path-traversal entries silently, same as a sanitize-and-skip filter
        };
        let out_path = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| AppError::Other(e.into()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Other(e.into()))?;
        }
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| AppError::Other(e.into()))?;
        std::fs::write(&out_path, contents).map_err(|e| AppError::Other(e.into()))?;
    }

    let manifest_path = dest.join("manifest.json");
    let manifest_raw = std::fs::read_to_string(&manifest_path)
        .map_err(|_| AppError::InvalidParams("archive has no manifest.json".to_string()))?;
    let manifest: ExtensionManifest = serde_json::from_str(&manifest_raw)
        .map_err(|e| AppError::InvalidParams(format!("invalid manifest.json: {e}")))?;
    let requires_enterprise_policy = manifest.requires_enterprise_policy();

    let update_xml_path = dest.join("update.xml");
    let (extension_id, loopback_update_url) = if update_xml_path.exists() {
        let xml = std::fs::read_to_string(&update_xml_path).map_err(|e| AppError::Other(e.into()))?;
        let (appid, _codebase) =
            parse_update_xml(&xml).map_err(|e| AppError::InvalidParams(e.to_string()))?;
        if !is_valid_appid(&appid) {
            return Err(AppError::InvalidParams(format!(
                "update.xml appid {appid} does not match ^[a-p]{{32}}$"
            )));
        }
        let dir_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let new_codebase = format!("http://127.0.0.1:{loopback_port}/extensions/{dir_name}/update.xml");
        let rewritten = rewrite_codebase(&xml, &new_codebase);
        std::fs::write(&update_xml_path, rewritten).map_err(|e| AppError::Other(e.into()))?;
        (Some(appid), Some(new_codebase))
    } else {
        (None, None)
    };

    Ok(UnpackResult {
        extension_id,
        requires_enterprise_policy,
        loopback_update_url,
    })
}

fn parse_update_xml(xml: &str) -> anyhow::Result<(String, Option<String>)> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut appid = None;
    let mut codebase = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) => {
                let local = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if local == "app" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"appid" {
                            appid = Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                } else if local == "updatecheck" {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"codebase" {
                            codebase = Some(String::from_utf8_lossy(&attr.value).to_string());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => anyhow::bail!("update.xml parse error: {e}"),
            _ => {}
        }
        buf.clear();
    }

    let appid = appid.ok_or_else(|| anyhow::anyhow!("update.xml missing an appid attribute"))?;
    Ok((appid, codebase))
}

fn rewrite_codebase(xml: &str, new_codebase: &str) -> String {
    let re = Regex::new(r#"codebase\s*=\s*"[^"]*""#).expect("static regex is valid");
    if re.is_match(xml) {
        re.replace(xml, format!(r#"codebase="{new_codebase}""#)).to_string()
    } else {
        xml.to_string()
    }
}

async fn write_atomic(path: &PathBuf, contents: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_codebase_replaces_existing_attribute() {
        let xml = r#"<updatecheck codebase="https://old.example.com/ext.crx" version="1.0"/>"#;
        let rewritten = rewrite_codebase(xml, "http://127.0.0.1:8080/extensions/foo/update.xml");
        assert!(rewritten.contains("http://127.0.0.1:8080/extensions/foo/update.xml"));
        assert!(!rewritten.contains("old.example.com"));
    }

    #[test]
    fn parse_update_xml_extracts_appid_and_codebase() {
        let xml = r#"
            <gupdate xmlns="http://www.google.com/update2/response" protocol="2.0">
              <app appid="abcdefghijklmnopabcdefghijklmnop">
                <updatecheck codebase="https://example.com/ext.crx" version="1.0"/>
              </app>
            </gupdate>
        "#;
        let (appid, codebase) = parse_update_xml(xml).unwrap();
        assert_eq!(appid, "abcdefghijklmnopabcdefghijklmnop");
        assert_eq!(codebase.as_deref(), Some("https://example.com/ext.crx"));
    }

    #[test]
    fn sanitize_component_rejects_traversal() {
        assert!(sanitize_component("../etc").is_err());
        assert!(sanitize_component("foo/bar").is_err());
        assert!(sanitize_component("ok-name").is_ok());
    }
}
