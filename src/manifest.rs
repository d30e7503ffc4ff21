//! Extension manifest (`package.json`) in the VS Code format.
//!
//! Only the fields the lifecycle manager and the contribution loader act on
//! are modelled; everything else in the descriptor is ignored on parse.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Activation event implied for extensions without code or explicit events
pub const ON_STARTUP_FINISHED: &str = "onStartupFinished";

/// Activation event that matches every trigger
pub const ACTIVATE_ALWAYS: &str = "*";

/// Parsed extension descriptor
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entry point executed inside the sandbox
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Web-worker entry point, used when no `main` is present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activation_events: Vec<String>,
    /// Ids (`publisher.name`) that must be installed first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension_dependencies: Vec<String>,
    /// Engine requirements, e.g. `{"vscode": "^1.80.0"}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engines: BTreeMap<String, String>,
    #[serde(default)]
    pub contributes: Contributes,
}

/// Static contribution declarations
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contributes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<LanguageContribution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grammars: Vec<GrammarContribution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub themes: Vec<ThemeContribution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snippets: Vec<SnippetContribution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icon_themes: Vec<IconThemeContribution>,
    /// Location (`activitybar`, `panel`) to containers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub views_containers: BTreeMap<String, Vec<ViewContainerContribution>>,
    /// Container id to views
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub views: BTreeMap<String, Vec<ViewContribution>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageContribution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filenames: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_line: Option<String>,
    /// Path to a language-configuration JSONC file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrammarContribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub scope_name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub embedded_languages: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inject_to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThemeContribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub label: String,
    /// `vs`, `vs-dark`, `hc-black` or `hc-light`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_theme: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SnippetContribution {
    /// Absent for global snippet files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IconThemeContribution {
    pub id: String,
    pub label: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ViewContainerContribution {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ViewContribution {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// `webview` for webview views, absent for tree views
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub view_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

impl ViewContribution {
    pub fn is_webview(&self) -> bool {
        self.view_type.as_deref() == Some("webview")
    }
}

impl ExtensionManifest {
    /// Normalized `publisher.name` id
    pub fn id(&self) -> String {
        format!("{}.{}", self.publisher, self.name).to_lowercase()
    }

    /// Entry point to run in the sandbox, if the extension ships code
    pub fn entry_point(&self) -> Option<&str> {
        self.main.as_deref().or(self.browser.as_deref())
    }

    pub fn has_entry_point(&self) -> bool {
        self.entry_point().is_some()
    }

    /// Webview views declared under `contributes.views`, with their container id
    pub fn webview_views(&self) -> impl Iterator<Item = (&str, &ViewContribution)> {
        self.contributes
            .views
            .iter()
            .flat_map(|(container, views)| views.iter().map(move |v| (container.as_str(), v)))
            .filter(|(_, view)| view.is_webview())
    }

    /// Declared activation events plus the ones implied by contributions.
    ///
    /// Every webview view implies `onView:<id>`. An extension without an entry
    /// point and without declared events gets `onStartupFinished`.
    pub fn effective_activation_events(&self) -> Vec<String> {
        let mut events = self.activation_events.clone();
        for (_, view) in self.webview_views() {
            let implied = format!("onView:{}", view.id);
            if !events.contains(&implied) {
                events.push(implied);
            }
        }
        if events.is_empty() && !self.has_entry_point() {
            events.push(ON_STARTUP_FINISHED.to_string());
        }
        events
    }

    /// Dependency ids, normalized
    pub fn dependency_ids(&self) -> Vec<String> {
        self.extension_dependencies
            .iter()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// Human-facing name
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}
