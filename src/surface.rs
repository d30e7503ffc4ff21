//! Editor surface contribution points.
//!
//! The editor exposes write-only sinks for each kind of static contribution.
//! Every registration hands back a [`Disposable`] that removes it again; the
//! host keeps those per loaded instance so unloading or hot-reloading an
//! extension releases exactly what that instance registered.

use crate::dispose::Disposable;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Kinds of static contributions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContributionKind {
    Language,
    Grammar,
    Theme,
    Snippets,
    IconTheme,
    WebviewView,
}

impl fmt::Display for ContributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Language => write!(f, "language"),
            Self::Grammar => write!(f, "grammar"),
            Self::Theme => write!(f, "theme"),
            Self::Snippets => write!(f, "snippets"),
            Self::IconTheme => write!(f, "icon theme"),
            Self::WebviewView => write!(f, "webview view"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageRegistration {
    pub extension_id: String,
    pub id: String,
    pub aliases: Vec<String>,
    pub extensions: Vec<String>,
    pub filenames: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_line: Option<String>,
    /// Parsed language-configuration file (brackets, comments, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrammarRegistration {
    pub extension_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub scope_name: String,
    pub embedded_languages: BTreeMap<String, String>,
    pub inject_to: Vec<String>,
    #[serde(skip)]
    pub grammar: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeRegistration {
    pub extension_id: String,
    pub id: String,
    pub label: String,
    pub ui_theme: String,
    #[serde(skip)]
    pub colors: Map<String, Value>,
    #[serde(skip)]
    pub token_colors: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub name: String,
    pub prefixes: Vec<String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetRegistration {
    pub extension_id: String,
    /// `None` for snippets available in every language
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub snippets: Vec<Snippet>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IconThemeRegistration {
    pub extension_id: String,
    pub id: String,
    pub label: String,
    /// Icon theme document with asset paths replaced by data URIs
    #[serde(skip)]
    pub definition: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebviewViewRegistration {
    pub extension_id: String,
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_title: Option<String>,
    pub view_id: String,
    pub name: String,
}

/// Errors raised by a contribution sink
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("{kind} rejected: {reason}")]
    Rejected {
        kind: ContributionKind,
        reason: String,
    },
}

/// Write-only editor sinks
pub trait EditorSurface: Send + Sync {
    fn register_language(&self, language: LanguageRegistration)
        -> Result<Disposable, SurfaceError>;
    fn register_grammar(&self, grammar: GrammarRegistration) -> Result<Disposable, SurfaceError>;
    fn register_theme(&self, theme: ThemeRegistration) -> Result<Disposable, SurfaceError>;
    fn register_snippets(&self, snippets: SnippetRegistration)
        -> Result<Disposable, SurfaceError>;
    fn register_icon_theme(&self, icon_theme: IconThemeRegistration)
        -> Result<Disposable, SurfaceError>;
    fn register_webview_view(&self, view: WebviewViewRegistration)
        -> Result<Disposable, SurfaceError>;
}

/// Everything currently registered on a [`RecordingSurface`], keyed by token
#[derive(Debug, Default)]
struct Recorded {
    languages: BTreeMap<u64, LanguageRegistration>,
    grammars: BTreeMap<u64, GrammarRegistration>,
    themes: BTreeMap<u64, ThemeRegistration>,
    snippets: BTreeMap<u64, SnippetRegistration>,
    icon_themes: BTreeMap<u64, IconThemeRegistration>,
    webview_views: BTreeMap<u64, WebviewViewRegistration>,
}

/// Every live registration of a [`RecordingSurface`], grouped by kind
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceSnapshot {
    pub languages: Vec<LanguageRegistration>,
    pub grammars: Vec<GrammarRegistration>,
    pub themes: Vec<ThemeRegistration>,
    pub snippets: Vec<SnippetRegistration>,
    pub icon_themes: Vec<IconThemeRegistration>,
    pub webview_views: Vec<WebviewViewRegistration>,
}

/// In-memory [`EditorSurface`] for headless tooling
#[derive(Clone, Default)]
pub struct RecordingSurface {
    recorded: Arc<Mutex<Recorded>>,
    next_token: Arc<AtomicU64>,
}

macro_rules! record {
    ($self:ident, $field:ident, $item:expr, $label:expr) => {{
        let token = $self.next_token.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut recorded) = $self.recorded.lock() {
            recorded.$field.insert(token, $item);
        }
        let recorded = $self.recorded.clone();
        Ok(Disposable::new($label, move || {
            if let Ok(mut recorded) = recorded.lock() {
                recorded.$field.remove(&token);
            }
            Ok(())
        }))
    }};
}

macro_rules! snapshot {
    ($self:ident, $field:ident) => {
        $self
            .recorded
            .lock()
            .map(|r| r.$field.values().cloned().collect())
            .unwrap_or_default()
    };
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn languages(&self) -> Vec<LanguageRegistration> {
        snapshot!(self, languages)
    }

    pub fn grammars(&self) -> Vec<GrammarRegistration> {
        snapshot!(self, grammars)
    }

    pub fn themes(&self) -> Vec<ThemeRegistration> {
        snapshot!(self, themes)
    }

    pub fn snippets(&self) -> Vec<SnippetRegistration> {
        snapshot!(self, snippets)
    }

    pub fn icon_themes(&self) -> Vec<IconThemeRegistration> {
        snapshot!(self, icon_themes)
    }

    pub fn webview_views(&self) -> Vec<WebviewViewRegistration> {
        snapshot!(self, webview_views)
    }

    pub fn snapshot(&self) -> SurfaceSnapshot {
        SurfaceSnapshot {
            languages: self.languages(),
            grammars: self.grammars(),
            themes: self.themes(),
            snippets: self.snippets(),
            icon_themes: self.icon_themes(),
            webview_views: self.webview_views(),
        }
    }

    /// Number of live registrations across all kinds
    pub fn total(&self) -> usize {
        self.recorded
            .lock()
            .map(|r| {
                r.languages.len()
                    + r.grammars.len()
                    + r.themes.len()
                    + r.snippets.len()
                    + r.icon_themes.len()
                    + r.webview_views.len()
            })
            .unwrap_or(0)
    }
}

impl EditorSurface for RecordingSurface {
    fn register_language(
        &self,
        language: LanguageRegistration,
    ) -> Result<Disposable, SurfaceError> {
        let label = format!("language:{}", language.id);
        record!(self, languages, language, label)
    }

    fn register_grammar(&self, grammar: GrammarRegistration) -> Result<Disposable, SurfaceError> {
        let label = format!("grammar:{}", grammar.scope_name);
        record!(self, grammars, grammar, label)
    }

    fn register_theme(&self, theme: ThemeRegistration) -> Result<Disposable, SurfaceError> {
        let label = format!("theme:{}", theme.id);
        record!(self, themes, theme, label)
    }

    fn register_snippets(
        &self,
        snippets: SnippetRegistration,
    ) -> Result<Disposable, SurfaceError> {
        let label = format!(
            "snippets:{}",
            snippets.language.as_deref().unwrap_or("global")
        );
        record!(self, snippets, snippets, label)
    }

    fn register_icon_theme(
        &self,
        icon_theme: IconThemeRegistration,
    ) -> Result<Disposable, SurfaceError> {
        let label = format!("icon-theme:{}", icon_theme.id);
        record!(self, icon_themes, icon_theme, label)
    }

    fn register_webview_view(
        &self,
        view: WebviewViewRegistration,
    ) -> Result<Disposable, SurfaceError> {
        let label = format!("webview:{}", view.view_id);
        record!(self, webview_views, view, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn language(id: &str) -> LanguageRegistration {
        LanguageRegistration {
            extension_id: "acme.lint".into(),
            id: id.into(),
            aliases: vec![],
            extensions: vec![],
            filenames: vec![],
            first_line: None,
            configuration: None,
        }
    }

    #[test]
    fn test_register_and_dispose() {
        let surface = RecordingSurface::new();
        let mut first = surface.register_language(language("acme")).unwrap();
        let _second = surface.register_language(language("acme")).unwrap();
        assert_eq!(surface.languages().len(), 2);

        first.dispose().unwrap();
        assert_eq!(surface.languages().len(), 1);
        assert_eq!(surface.total(), 1);
    }

    #[test]
    fn test_disposable_label() {
        let surface = RecordingSurface::new();
        let d = surface
            .register_webview_view(WebviewViewRegistration {
                extension_id: "acme.chat".into(),
                container_id: "acme".into(),
                container_title: None,
                view_id: "acme.chat.view".into(),
                name: "Chat".into(),
            })
            .unwrap();
        assert_eq!(d.label(), "webview:acme.chat.view");
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let surface = RecordingSurface::new();
        let _lang = surface.register_language(language("acme")).unwrap();
        let _theme = surface
            .register_theme(ThemeRegistration {
                extension_id: "acme.lint".into(),
                id: "Dark".into(),
                label: "Dark".into(),
                ui_theme: "vs-dark".into(),
                colors: Map::new(),
                token_colors: vec![],
            })
            .unwrap();

        let json = serde_json::to_value(surface.snapshot()).unwrap();
        assert_eq!(json["languages"][0]["extensionId"], "acme.lint");
        assert!(json["languages"][0].get("firstLine").is_none());
        assert_eq!(json["themes"][0]["uiTheme"], "vs-dark");
        assert!(json["themes"][0].get("colors").is_none());
        assert_eq!(json["iconThemes"], serde_json::json!([]));
        assert_eq!(json["webviewViews"], serde_json::json!([]));
    }

    #[test]
    fn test_clones_share_state() {
        let surface = RecordingSurface::new();
        let other = surface.clone();
        let _d = surface.register_language(language("acme")).unwrap();
        assert_eq!(other.languages()[0].id, "acme");
    }
}
