//! Installed-extension registry, persisted as `extensions.json`.
//!
//! The registry is the only durable state of the lifecycle manager. It is
//! rewritten after every mutating operation so that a crash leaves the last
//! transition observable on the next start; [`InstalledExtensions::recover`]
//! then normalizes entries caught in a transient state.

use crate::manifest::ExtensionManifest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Current schema version of `extensions.json`
const REGISTRY_VERSION: u32 = 1;

/// Lifecycle state of an installed extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionState {
    Installing,
    Installed,
    Enabling,
    Enabled,
    Disabling,
    Disabled,
    Uninstalling,
    Error,
}

impl ExtensionState {
    /// States that must resolve within a bounded time
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Installing | Self::Enabling | Self::Disabling | Self::Uninstalling
        )
    }

    /// Stable states from which `enable` is legal
    pub fn can_enable(&self) -> bool {
        matches!(self, Self::Installed | Self::Disabled)
    }

    /// States in which the package is completely on disk
    pub fn is_installed(&self) -> bool {
        matches!(
            self,
            Self::Installed | Self::Enabling | Self::Enabled | Self::Disabling | Self::Disabled
        )
    }

    /// State to assume after a process restart
    pub fn recovered(self) -> Self {
        match self {
            Self::Installing | Self::Uninstalling => Self::Error,
            Self::Enabling => Self::Disabled,
            Self::Disabling => Self::Enabled,
            other => other,
        }
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Enabling => "enabling",
            Self::Enabled => "enabled",
            Self::Disabling => "disabling",
            Self::Disabled => "disabled",
            Self::Uninstalling => "uninstalling",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Normalized registry id for a publisher/name pair
pub fn extension_id(publisher: &str, name: &str) -> String {
    format!("{}.{}", publisher, name).to_lowercase()
}

/// Split `publisher.name` at the first dot
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    let (publisher, name) = id.split_once('.')?;
    if publisher.is_empty() || name.is_empty() {
        return None;
    }
    Some((publisher, name))
}

/// On-disk folder name, `publisher.name-version`
pub fn folder_name(publisher: &str, name: &str, version: &str) -> String {
    format!("{}-{}", extension_id(publisher, name), version)
}

/// A registry entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstalledExtension {
    pub id: String,
    pub publisher: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub state: ExtensionState,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub enabled: bool,
    /// Empty until the package has been extracted
    #[serde(default)]
    pub manifest: ExtensionManifest,
    /// Folder name below the extensions root
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 of the downloaded package, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_sha256: Option<String>,
}

impl InstalledExtension {
    /// Fresh entry in the `installing` state
    pub fn installing(publisher: &str, name: &str, version: &str) -> Self {
        Self {
            id: extension_id(publisher, name),
            publisher: publisher.to_string(),
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            version: version.to_string(),
            state: ExtensionState::Installing,
            installed_at: Utc::now(),
            enabled: false,
            manifest: ExtensionManifest::default(),
            path: folder_name(publisher, name, version),
            dependencies: Vec::new(),
            error: None,
            package_sha256: None,
        }
    }

    /// Move to `state`, clearing any previous error unless the new state is `error`
    pub fn set_state(&mut self, state: ExtensionState) {
        self.state = state;
        if state != ExtensionState::Error {
            self.error = None;
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.state = ExtensionState::Error;
        self.error = Some(message.into());
    }

    /// Adopt the downloaded manifest's descriptive fields
    pub fn apply_manifest(&mut self, manifest: ExtensionManifest) {
        if let Some(display_name) = &manifest.display_name {
            self.display_name = display_name.clone();
        }
        if let Some(description) = &manifest.description {
            self.description = description.clone();
        }
        for dep in manifest.dependency_ids() {
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self.manifest = manifest;
    }
}

/// Errors writing the registry file
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A state change applied by [`InstalledExtensions::recover`]
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub id: String,
    pub from: ExtensionState,
    pub to: ExtensionState,
}

/// The persisted registry, keyed by normalized id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledExtensions {
    pub version: u32,
    pub extensions: BTreeMap<String, InstalledExtension>,
}

impl Default for InstalledExtensions {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            extensions: BTreeMap::new(),
        }
    }
}

impl InstalledExtensions {
    /// Load from disk, returning an empty registry if missing or unreadable
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(data) => {
                    debug!(
                        path = ?path,
                        count = data.extensions.len(),
                        "Loaded installed extensions"
                    );
                    data
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to parse extension registry, starting fresh");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read extension registry");
                Self::default()
            }
        }
    }

    /// Write to disk through a temporary file in the same directory
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        debug!(path = ?path, count = self.extensions.len(), "Saved installed extensions");
        Ok(())
    }

    /// Normalize entries left in a transient state by a previous process
    pub fn recover(&mut self) -> Vec<Recovery> {
        let mut changes = Vec::new();
        for ext in self.extensions.values_mut() {
            let from = ext.state;
            let to = from.recovered();
            if from == to {
                continue;
            }
            match to {
                ExtensionState::Error => {
                    ext.set_error(format!("Interrupted while {}", from));
                    ext.enabled = false;
                }
                ExtensionState::Disabled => {
                    ext.set_state(to);
                    ext.enabled = false;
                }
                ExtensionState::Enabled => {
                    ext.set_state(to);
                    ext.enabled = true;
                }
                _ => ext.set_state(to),
            }
            changes.push(Recovery {
                id: ext.id.clone(),
                from,
                to,
            });
        }
        changes
    }

    pub fn get(&self, id: &str) -> Option<&InstalledExtension> {
        self.extensions.get(&id.to_lowercase())
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InstalledExtension> {
        self.extensions.get_mut(&id.to_lowercase())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.extensions.contains_key(&id.to_lowercase())
    }

    /// Insert or replace the entry for `ext.id`
    pub fn upsert(&mut self, ext: InstalledExtension) {
        self.extensions.insert(ext.id.clone(), ext);
    }

    pub fn remove(&mut self, id: &str) -> Option<InstalledExtension> {
        self.extensions.remove(&id.to_lowercase())
    }

    pub fn ids(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_folder_name_convention() {
        assert_eq!(folder_name("Acme", "Lint", "1.2.3"), "acme.lint-1.2.3");
    }

    #[test]
    fn test_split_id() {
        assert_eq!(split_id("acme.lint"), Some(("acme", "lint")));
        assert_eq!(split_id("acme.lint.extra"), Some(("acme", "lint.extra")));
        assert_eq!(split_id("acme"), None);
        assert_eq!(split_id(".lint"), None);
    }

    #[test]
    fn test_installed_states() {
        assert!(ExtensionState::Disabled.is_installed());
        assert!(ExtensionState::Enabling.is_installed());
        assert!(!ExtensionState::Installing.is_installed());
        assert!(!ExtensionState::Uninstalling.is_installed());
        assert!(!ExtensionState::Error.is_installed());
    }

    #[test]
    fn test_recovered_states() {
        assert_eq!(ExtensionState::Installing.recovered(), ExtensionState::Error);
        assert_eq!(ExtensionState::Uninstalling.recovered(), ExtensionState::Error);
        assert_eq!(ExtensionState::Enabling.recovered(), ExtensionState::Disabled);
        assert_eq!(ExtensionState::Disabling.recovered(), ExtensionState::Enabled);
        assert_eq!(ExtensionState::Installed.recovered(), ExtensionState::Installed);
        assert_eq!(ExtensionState::Error.recovered(), ExtensionState::Error);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ExtensionState::Uninstalling).unwrap();
        assert_eq!(json, "\"uninstalling\"");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extensions.json");

        let mut registry = InstalledExtensions::default();
        let mut ext = InstalledExtension::installing("acme", "lint", "1.0.0");
        ext.set_state(ExtensionState::Installed);
        registry.upsert(ext);
        registry.save(&path).unwrap();

        let loaded = InstalledExtensions::load(&path);
        assert_eq!(loaded.len(), 1);
        let entry = loaded.get("ACME.Lint").unwrap();
        assert_eq!(entry.state, ExtensionState::Installed);
        assert_eq!(entry.path, "acme.lint-1.0.0");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extensions.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(InstalledExtensions::load(&path).is_empty());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(InstalledExtensions::load(&dir.path().join("nope.json")).is_empty());
    }

    #[test]
    fn test_recover_normalizes_transient_states() {
        let mut registry = InstalledExtensions::default();
        for (name, state) in [
            ("a", ExtensionState::Installing),
            ("b", ExtensionState::Enabling),
            ("c", ExtensionState::Disabling),
            ("d", ExtensionState::Uninstalling),
            ("e", ExtensionState::Enabled),
        ] {
            let mut ext = InstalledExtension::installing("acme", name, "1.0.0");
            ext.state = state;
            registry.upsert(ext);
        }

        let changes = registry.recover();
        assert_eq!(changes.len(), 4);

        let a = registry.get("acme.a").unwrap();
        assert_eq!(a.state, ExtensionState::Error);
        assert_eq!(a.error.as_deref(), Some("Interrupted while installing"));
        assert_eq!(registry.get("acme.b").unwrap().state, ExtensionState::Disabled);
        assert!(!registry.get("acme.b").unwrap().enabled);
        assert_eq!(registry.get("acme.c").unwrap().state, ExtensionState::Enabled);
        assert!(registry.get("acme.c").unwrap().enabled);
        assert_eq!(registry.get("acme.d").unwrap().state, ExtensionState::Error);
        assert_eq!(registry.get("acme.e").unwrap().state, ExtensionState::Enabled);
    }

    #[test]
    fn test_apply_manifest_merges_dependencies() {
        let mut ext = InstalledExtension::installing("acme", "lint", "1.0.0");
        ext.dependencies.push("acme.core".into());
        ext.apply_manifest(ExtensionManifest {
            display_name: Some("Acme Lint".into()),
            extension_dependencies: vec!["Acme.Core".into(), "acme.util".into()],
            ..Default::default()
        });
        assert_eq!(ext.display_name, "Acme Lint");
        assert_eq!(ext.dependencies, vec!["acme.core", "acme.util"]);
    }

    #[test]
    fn test_set_state_clears_error() {
        let mut ext = InstalledExtension::installing("acme", "lint", "1.0.0");
        ext.set_error("boom");
        assert_eq!(ext.state, ExtensionState::Error);
        ext.set_state(ExtensionState::Installed);
        assert!(ext.error.is_none());
    }
}
