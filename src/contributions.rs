//! Contribution Loader - turns a manifest's static `contributes` block into
//! registrations on the editor surface.
//!
//! Loading is best-effort: every item of every kind is attempted, and a
//! failing item is logged and recorded as a warning without affecting its
//! siblings. Files are read through the [`PackageStore`] and parsed as JSONC.
//!
//! Paths in the manifest are relative to the extension folder and must stay
//! inside it. Icon themes are special: their asset paths are relative to the
//! icon theme file (often nested under `dist/` or `out/`), so they are
//! resolved from there and, failing that, walked back toward the extension
//! root. Assets are inlined as base64 data URIs.

use crate::dispose::Disposable;
use crate::jsonc;
use crate::manifest::{
    ExtensionManifest, GrammarContribution, IconThemeContribution, LanguageContribution,
    SnippetContribution, ThemeContribution, ViewContainerContribution,
};
use crate::store::{PackageStore, StoreError};
use crate::surface::{
    ContributionKind, EditorSurface, GrammarRegistration, IconThemeRegistration,
    LanguageRegistration, Snippet, SnippetRegistration, SurfaceError, ThemeRegistration,
    WebviewViewRegistration,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum depth of theme `include` chains
const MAX_THEME_INCLUDE_DEPTH: usize = 8;

/// Errors loading a single contribution item
#[derive(Debug, thiserror::Error)]
pub enum ContributionError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Path escapes the extension folder: {0}")]
    PathEscapesRoot(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Invalid contribution: {0}")]
    Invalid(String),

    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Everything registered for one extension instance
#[derive(Debug, Default)]
pub struct LoadedContributions {
    /// Theme, grammar, snippet, icon theme and webview registrations, in load order
    pub disposables: Vec<Disposable>,
    /// Language registrations keyed by language id
    pub language_services: BTreeMap<String, Vec<Disposable>>,
    pub view_containers: Vec<ViewContainerContribution>,
    pub webview_views: Vec<WebviewViewRegistration>,
    /// One entry per skipped item
    pub warnings: Vec<String>,
}

impl LoadedContributions {
    pub fn registration_count(&self) -> usize {
        self.disposables.len() + self.language_services.values().map(Vec::len).sum::<usize>()
    }

    fn skip(&mut self, kind: ContributionKind, item: &str, error: ContributionError) {
        warn!(kind = %kind, item = %item, error = %error, "Skipping contribution");
        self.warnings.push(format!("{} '{}': {}", kind, item, error));
    }
}

/// Lexically normalize `path`, resolving `.` and `..` without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve a manifest-relative path, rejecting anything outside `root`
pub fn resolve_in_root(root: &Path, base: &Path, relative: &str) -> Result<PathBuf, ContributionError> {
    let candidate = normalize(&base.join(relative));
    if candidate.starts_with(normalize(root)) {
        Ok(candidate)
    } else {
        Err(ContributionError::PathEscapesRoot(relative.to_string()))
    }
}

/// MIME type for an asset, by extension
fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        _ => "application/octet-stream",
    }
}

/// Encode raw bytes as a data URI; bytes are encoded as-is so UTF-8 text survives
pub fn data_uri(path: &Path, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type(path), STANDARD.encode(bytes))
}

/// Normalize a `string | string[]` snippet field
fn string_or_lines(value: &Value, joiner: &str) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(joiner),
        ),
        _ => None,
    }
}

/// Parse a VS Code snippet file
pub fn parse_snippets(document: &Value) -> Vec<Snippet> {
    let Some(entries) = document.as_object() else {
        return Vec::new();
    };
    let mut snippets = Vec::new();
    for (name, entry) in entries {
        let prefixes = match entry.get("prefix") {
            Some(Value::String(p)) => vec![p.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };
        let Some(body) = entry.get("body").and_then(|b| string_or_lines(b, "\n")) else {
            debug!(snippet = %name, "Snippet without body");
            continue;
        };
        if prefixes.is_empty() {
            debug!(snippet = %name, "Snippet without prefix");
            continue;
        }
        snippets.push(Snippet {
            name: name.clone(),
            prefixes,
            body,
            description: entry
                .get("description")
                .and_then(|d| string_or_lines(d, " ")),
        });
    }
    snippets
}

/// Loads static contributions for an extension folder
pub struct ContributionLoader {
    store: Arc<dyn PackageStore>,
    surface: Arc<dyn EditorSurface>,
}

impl ContributionLoader {
    pub fn new(store: Arc<dyn PackageStore>, surface: Arc<dyn EditorSurface>) -> Self {
        Self { store, surface }
    }

    /// Register every contribution of `manifest`, skipping the ones that fail
    pub async fn load(
        &self,
        extension_id: &str,
        root: &Path,
        manifest: &ExtensionManifest,
    ) -> LoadedContributions {
        let mut loaded = LoadedContributions::default();
        let contributes = &manifest.contributes;

        for language in &contributes.languages {
            match self.load_language(extension_id, root, language).await {
                Ok(d) => loaded
                    .language_services
                    .entry(language.id.clone())
                    .or_default()
                    .push(d),
                Err(e) => loaded.skip(ContributionKind::Language, &language.id, e),
            }
        }

        for grammar in &contributes.grammars {
            match self.load_grammar(extension_id, root, grammar).await {
                Ok(d) => loaded.disposables.push(d),
                Err(e) => loaded.skip(ContributionKind::Grammar, &grammar.scope_name, e),
            }
        }

        for theme in &contributes.themes {
            match self.load_theme(extension_id, root, theme).await {
                Ok(d) => loaded.disposables.push(d),
                Err(e) => loaded.skip(ContributionKind::Theme, &theme.label, e),
            }
        }

        for snippets in &contributes.snippets {
            match self.load_snippets(extension_id, root, snippets).await {
                Ok(d) => loaded.disposables.push(d),
                Err(e) => loaded.skip(ContributionKind::Snippets, &snippets.path, e),
            }
        }

        for icon_theme in &contributes.icon_themes {
            match self.load_icon_theme(extension_id, root, icon_theme).await {
                Ok((d, skipped)) => {
                    loaded.disposables.push(d);
                    loaded.warnings.extend(skipped);
                }
                Err(e) => loaded.skip(ContributionKind::IconTheme, &icon_theme.id, e),
            }
        }

        loaded.view_containers = contributes
            .views_containers
            .values()
            .flatten()
            .cloned()
            .collect();
        for (container_id, view) in manifest.webview_views() {
            let registration = WebviewViewRegistration {
                extension_id: extension_id.to_string(),
                container_id: container_id.to_string(),
                container_title: loaded
                    .view_containers
                    .iter()
                    .find(|c| c.id == container_id)
                    .map(|c| c.title.clone()),
                view_id: view.id.clone(),
                name: view.name.clone(),
            };
            match self.surface.register_webview_view(registration.clone()) {
                Ok(d) => {
                    loaded.disposables.push(d);
                    loaded.webview_views.push(registration);
                }
                Err(e) => loaded.skip(ContributionKind::WebviewView, &view.id, e.into()),
            }
        }

        info!(
            id = %extension_id,
            registrations = loaded.registration_count(),
            skipped = loaded.warnings.len(),
            "Loaded contributions"
        );
        loaded
    }

    async fn read_jsonc(&self, path: &Path) -> Result<Value, ContributionError> {
        let content = self
            .store
            .read_to_string(path)
            .await
            .map_err(|source| ContributionError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        jsonc::parse(&content).map_err(|source| ContributionError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn load_language(
        &self,
        extension_id: &str,
        root: &Path,
        language: &LanguageContribution,
    ) -> Result<Disposable, ContributionError> {
        if language.id.trim().is_empty() {
            return Err(ContributionError::Invalid("language without id".into()));
        }
        let configuration = match &language.configuration {
            Some(rel) => Some(self.read_jsonc(&resolve_in_root(root, root, rel)?).await?),
            None => None,
        };
        let registration = LanguageRegistration {
            extension_id: extension_id.to_string(),
            id: language.id.clone(),
            aliases: language.aliases.clone(),
            extensions: language.extensions.clone(),
            filenames: language.filenames.clone(),
            first_line: language.first_line.clone(),
            configuration,
        };
        Ok(self.surface.register_language(registration)?)
    }

    async fn load_grammar(
        &self,
        extension_id: &str,
        root: &Path,
        grammar: &GrammarContribution,
    ) -> Result<Disposable, ContributionError> {
        let path = resolve_in_root(root, root, &grammar.path)?;
        let lower = grammar.path.to_ascii_lowercase();
        if lower.ends_with(".tmlanguage") || lower.ends_with(".plist") {
            return Err(ContributionError::Unsupported(format!(
                "plist grammar {}",
                grammar.path
            )));
        }
        let document = self.read_jsonc(&path).await?;
        let registration = GrammarRegistration {
            extension_id: extension_id.to_string(),
            language: grammar.language.clone(),
            scope_name: grammar.scope_name.clone(),
            embedded_languages: grammar.embedded_languages.clone(),
            inject_to: grammar.inject_to.clone(),
            grammar: document,
        };
        Ok(self.surface.register_grammar(registration)?)
    }

    async fn load_theme(
        &self,
        extension_id: &str,
        root: &Path,
        theme: &ThemeContribution,
    ) -> Result<Disposable, ContributionError> {
        let path = resolve_in_root(root, root, &theme.path)?;
        let mut colors = Map::new();
        let mut token_colors = Vec::new();
        self.collect_theme(root, path, 0, &mut colors, &mut token_colors)
            .await?;

        let registration = ThemeRegistration {
            extension_id: extension_id.to_string(),
            id: theme.id.clone().unwrap_or_else(|| theme.label.clone()),
            label: theme.label.clone(),
            ui_theme: theme.ui_theme.clone().unwrap_or_else(|| "vs".to_string()),
            colors,
            token_colors,
        };
        Ok(self.surface.register_theme(registration)?)
    }

    /// Merge a theme file and its `include` chain, parents first
    fn collect_theme<'a>(
        &'a self,
        root: &'a Path,
        path: PathBuf,
        depth: usize,
        colors: &'a mut Map<String, Value>,
        token_colors: &'a mut Vec<Value>,
    ) -> BoxFuture<'a, Result<(), ContributionError>> {
        async move {
            if depth > MAX_THEME_INCLUDE_DEPTH {
                return Err(ContributionError::Invalid(format!(
                    "theme include chain deeper than {}",
                    MAX_THEME_INCLUDE_DEPTH
                )));
            }
            let document = self.read_jsonc(&path).await?;

            if let Some(include) = document.get("include").and_then(Value::as_str) {
                let base = path.parent().unwrap_or(root);
                let parent = resolve_in_root(root, base, include)?;
                self.collect_theme(root, parent, depth + 1, colors, token_colors)
                    .await?;
            }

            if let Some(own) = document.get("colors").and_then(Value::as_object) {
                for (key, value) in own {
                    colors.insert(key.clone(), value.clone());
                }
            }
            match document.get("tokenColors") {
                Some(Value::Array(rules)) => token_colors.extend(rules.iter().cloned()),
                Some(Value::String(file)) => {
                    return Err(ContributionError::Unsupported(format!(
                        "tokenColors file reference {}",
                        file
                    )))
                }
                _ => {}
            }
            Ok(())
        }
        .boxed()
    }

    async fn load_snippets(
        &self,
        extension_id: &str,
        root: &Path,
        contribution: &SnippetContribution,
    ) -> Result<Disposable, ContributionError> {
        let path = resolve_in_root(root, root, &contribution.path)?;
        let document = self.read_jsonc(&path).await?;
        let snippets = parse_snippets(&document);
        if snippets.is_empty() {
            return Err(ContributionError::Invalid(format!(
                "no usable snippets in {}",
                contribution.path
            )));
        }
        let registration = SnippetRegistration {
            extension_id: extension_id.to_string(),
            language: contribution.language.clone(),
            snippets,
        };
        Ok(self.surface.register_snippets(registration)?)
    }

    /// Find an icon asset starting from the theme file's folder, walking back to `root`
    async fn resolve_icon_asset(
        &self,
        root: &Path,
        theme_dir: &Path,
        relative: &str,
    ) -> Result<PathBuf, ContributionError> {
        if let Ok(direct) = resolve_in_root(root, theme_dir, relative) {
            if self.store.exists(&direct).await {
                return Ok(direct);
            }
        }

        let stripped: PathBuf = Path::new(relative)
            .components()
            .skip_while(|c| matches!(c, Component::CurDir | Component::ParentDir))
            .collect();
        let stripped = stripped.to_string_lossy().to_string();
        let root = normalize(root);
        let mut dir = normalize(theme_dir);
        loop {
            if let Ok(candidate) = resolve_in_root(&root, &dir, &stripped) {
                if self.store.exists(&candidate).await {
                    return Ok(candidate);
                }
            }
            if dir == root || !dir.pop() || !dir.starts_with(&root) {
                break;
            }
        }
        Err(ContributionError::AssetNotFound(relative.to_string()))
    }

    async fn inline_asset(
        &self,
        root: &Path,
        theme_dir: &Path,
        relative: &str,
    ) -> Result<String, ContributionError> {
        let path = self.resolve_icon_asset(root, theme_dir, relative).await?;
        let bytes = self
            .store
            .read_bytes(&path)
            .await
            .map_err(|source| ContributionError::Read {
                path: path.clone(),
                source,
            })?;
        Ok(data_uri(&path, &bytes))
    }

    /// Returns the registration plus one warning per asset that could not be inlined
    async fn load_icon_theme(
        &self,
        extension_id: &str,
        root: &Path,
        icon_theme: &IconThemeContribution,
    ) -> Result<(Disposable, Vec<String>), ContributionError> {
        let path = resolve_in_root(root, root, &icon_theme.path)?;
        let mut document = self.read_jsonc(&path).await?;
        let theme_dir = path.parent().unwrap_or(root).to_path_buf();
        let mut skipped = Vec::new();

        if let Some(definitions) = document
            .get_mut("iconDefinitions")
            .and_then(Value::as_object_mut)
        {
            let mut broken = Vec::new();
            for (id, definition) in definitions.iter_mut() {
                let Some(icon_path) = definition.get("iconPath").and_then(Value::as_str) else {
                    continue;
                };
                let icon_path = icon_path.to_string();
                match self.inline_asset(root, &theme_dir, &icon_path).await {
                    Ok(uri) => definition["iconPath"] = Value::String(uri),
                    Err(e) => {
                        warn!(icon = %id, error = %e, "Skipping icon definition");
                        skipped.push(format!("icon '{}': {}", id, e));
                        broken.push(id.clone());
                    }
                }
            }
            for id in broken {
                definitions.remove(&id);
            }
        }

        if let Some(fonts) = document.get_mut("fonts").and_then(Value::as_array_mut) {
            for font in fonts.iter_mut() {
                let font_id = font
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("font")
                    .to_string();
                let Some(sources) = font.get_mut("src").and_then(Value::as_array_mut) else {
                    continue;
                };
                for source in sources.iter_mut() {
                    let Some(src_path) = source.get("path").and_then(Value::as_str) else {
                        continue;
                    };
                    let src_path = src_path.to_string();
                    match self.inline_asset(root, &theme_dir, &src_path).await {
                        Ok(uri) => source["path"] = Value::String(uri),
                        Err(e) => {
                            warn!(font = %font_id, error = %e, "Font source not inlined");
                            skipped.push(format!("font '{}': {}", font_id, e));
                        }
                    }
                }
            }
        }

        let registration = IconThemeRegistration {
            extension_id: extension_id.to_string(),
            id: icon_theme.id.clone(),
            label: icon_theme.label.clone(),
            definition: document,
        };
        Ok((self.surface.register_icon_theme(registration)?, skipped))
    }
}
