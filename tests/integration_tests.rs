//! End-to-end integration tests for extkit
//!
//! These tests drive the extension manager against a mock Open VSX registry,
//! a real extension directory on disk and the inert sandbox runtime.

use extkit::activation::PatternActivationMatcher;
use extkit::config::{ExtensionsConfig, HealthConfig};
use extkit::events::ExtensionEvent;
use extkit::health::{HealthMonitor, ThresholdHealthMonitor};
use extkit::host::ExtensionHost;
use extkit::installed::{ExtensionState, InstalledExtension, InstalledExtensions};
use extkit::manager::{ExtensionError, ExtensionManager, InstallOptions};
use extkit::registry::OpenVsxRegistry;
use extkit::sandbox::InertSandboxFactory;
use extkit::store::{FsPackageStore, PackageStore};
use extkit::surface::RecordingSurface;
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Build a VSIX archive with everything under `extension/`
fn vsix(files: &[(&str, String)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("extension.vsixmanifest", SimpleFileOptions::default())
        .expect("Failed to start manifest entry");
    writer
        .write_all(b"<PackageManifest/>")
        .expect("Failed to write manifest entry");
    for (name, contents) in files {
        writer
            .start_file(format!("extension/{}", name), SimpleFileOptions::default())
            .expect("Failed to start zip entry");
        writer
            .write_all(contents.as_bytes())
            .expect("Failed to write zip entry");
    }
    writer.finish().expect("Failed to finish zip").into_inner()
}

/// Serve metadata and package for `manifest` from the mock registry
async fn publish(server: &MockServer, manifest: &Value, extra: &[(&str, String)]) {
    let publisher = manifest["publisher"].as_str().unwrap_or_default();
    let name = manifest["name"].as_str().unwrap_or_default();
    let version = manifest["version"].as_str().unwrap_or_default();

    let mut files = vec![("package.json", manifest.to_string())];
    files.extend(extra.iter().cloned());

    Mock::given(method("GET"))
        .and(path(format!("/api/{}/{}", publisher, name)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "namespace": publisher,
            "name": name,
            "version": version,
            "displayName": manifest["displayName"],
            "engines": { "vscode": "^1.80.0" }
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!(
            "/api/{}/{}/{}/file/{}.{}-{}.vsix",
            publisher, name, version, publisher, name, version
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vsix(&files)))
        .mount(server)
        .await;
}

struct Harness {
    surface: RecordingSurface,
    health: Arc<ThresholdHealthMonitor>,
    manager: ExtensionManager,
}

fn harness(root: &Path, registry_url: &str, timeout_secs: u64) -> Harness {
    let mut config = ExtensionsConfig::with_root(root);
    config.registry_url = registry_url.to_string();
    config.install_timeout_secs = timeout_secs;

    let surface = RecordingSurface::new();
    let health = Arc::new(ThresholdHealthMonitor::new(HealthConfig::default()));
    let store: Arc<dyn PackageStore> = Arc::new(FsPackageStore::new());
    let registry =
        Arc::new(OpenVsxRegistry::new(registry_url).expect("Failed to create registry client"));
    let host = ExtensionHost::new(
        Arc::new(surface.clone()),
        store.clone(),
        Arc::new(InertSandboxFactory),
        Arc::new(PatternActivationMatcher::new()),
        root,
    );
    let manager = ExtensionManager::new(config, registry, store, health.clone(), host)
        .expect("Failed to create manager");
    Harness {
        surface,
        health,
        manager,
    }
}

fn count(rx: &mut broadcast::Receiver<ExtensionEvent>, name: &str) -> usize {
    let mut n = 0;
    while let Ok(event) = rx.try_recv() {
        if event.name() == name {
            n += 1;
        }
    }
    n
}

fn lint_manifest() -> Value {
    json!({
        "name": "lint",
        "publisher": "acme",
        "version": "1.0.0",
        "displayName": "Acme Lint",
        "main": "./out/extension.js",
        "activationEvents": ["onLanguage:acme"],
        "contributes": {
            "languages": [{
                "id": "acme",
                "aliases": ["Acme"],
                "extensions": [".acme"],
                "configuration": "./language-configuration.json"
            }],
            "grammars": [{
                "language": "acme",
                "scopeName": "source.acme",
                "path": "./syntaxes/acme.tmLanguage.json"
            }],
            "snippets": [{ "language": "acme", "path": "./snippets/acme.json" }],
            "viewsContainers": {
                "activitybar": [{ "id": "acme-explorer", "title": "Acme" }]
            },
            "views": {
                "acme-explorer": [{ "id": "acme.findings", "name": "Findings", "type": "webview" }]
            }
        }
    })
}

fn lint_files() -> Vec<(&'static str, String)> {
    vec![
        (
            "language-configuration.json",
            r#"{
                // line comments are allowed here
                "comments": { "lineComment": "//" },
                "brackets": [["{", "}"]],
            }"#
            .to_string(),
        ),
        (
            "syntaxes/acme.tmLanguage.json",
            json!({ "scopeName": "source.acme", "patterns": [] }).to_string(),
        ),
        (
            "snippets/acme.json",
            json!({ "Rule": { "prefix": "rule", "body": ["rule ${1:name}"] } }).to_string(),
        ),
        ("out/extension.js", "exports.activate = () => {};".to_string()),
    ]
}

#[tokio::test]
async fn test_install_enable_uninstall_scenario() {
    let server = MockServer::start().await;
    publish(&server, &lint_manifest(), &lint_files()).await;
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(dir.path(), &server.uri(), 30);
    let mut rx = h.manager.subscribe();

    let ext = h
        .manager
        .install("acme", "lint", InstallOptions::default())
        .await
        .expect("install failed");
    assert_eq!(ext.state, ExtensionState::Installed);
    assert_eq!(h.manager.list().await.len(), 1);
    assert!(dir.path().join("acme.lint-1.0.0/package.json").exists());

    let ext = h.manager.enable("acme.lint").await.expect("enable failed");
    assert_eq!(ext.state, ExtensionState::Enabled);
    assert_eq!(count(&mut rx, "extension:enabled"), 1);
    {
        let host = h.manager.host().lock().await;
        assert_eq!(host.loaded_ids(), vec!["acme.lint"]);
        let loaded = host.loaded("acme.lint").expect("not loaded");
        assert!(!loaded.activated);
        assert!(loaded.load_warnings.is_empty());
    }

    let languages = h.surface.languages();
    assert_eq!(languages.len(), 1);
    let configuration = languages[0].configuration.as_ref().expect("configuration");
    assert_eq!(configuration["comments"]["lineComment"], "//");
    assert_eq!(h.surface.grammars().len(), 1);
    assert_eq!(h.surface.snippets()[0].snippets[0].body, "rule ${1:name}");
    assert_eq!(h.surface.webview_views()[0].view_id, "acme.findings");

    h.manager
        .uninstall("acme.lint", false)
        .await
        .expect("uninstall failed");
    assert!(h.manager.list().await.is_empty());
    assert!(h.manager.host().lock().await.loaded_ids().is_empty());
    assert!(h.health.record("acme.lint").is_none());
    assert!(!h.health.should_auto_disable("acme.lint"));
    assert_eq!(h.surface.total(), 0);
}

#[tokio::test]
async fn test_lazy_activation_and_webview_routing() {
    let server = MockServer::start().await;
    publish(&server, &lint_manifest(), &lint_files()).await;
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(dir.path(), &server.uri(), 30);

    h.manager
        .install("acme", "lint", InstallOptions::default())
        .await
        .expect("install failed");
    h.manager.enable("acme.lint").await.expect("enable failed");

    let mut host = h.manager.host().lock().await;
    assert!(host
        .send_message_to_extension("acme.lint", json!({ "type": "ping" }))
        .await
        .is_err());

    let outcome = host.trigger_activation_event("onLanguage:acme").await;
    assert_eq!(outcome.activated, vec!["acme.lint"]);
    assert!(outcome.failed.is_empty());

    let html = host
        .resolve_extension_webview("acme.lint", "acme.findings")
        .await
        .expect("webview failed");
    assert!(html.contains("acme.findings"));
    host.send_message_to_extension("acme.lint", json!({ "type": "ping" }))
        .await
        .expect("message failed");
}

#[tokio::test]
async fn test_enable_disable_round_trip() {
    let server = MockServer::start().await;
    publish(&server, &lint_manifest(), &lint_files()).await;
    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(dir.path(), &server.uri(), 30);
    h.manager
        .install("acme", "lint", InstallOptions::default())
        .await
        .expect("install failed");

    for _ in 0..2 {
        h.manager.enable("acme.lint").await.expect("enable failed");
        let ext = h.manager.disable("acme.lint").await.expect("disable failed");
        assert_eq!((ext.state, ext.enabled), (ExtensionState::Disabled, false));
        assert!(!h.manager.host().lock().await.is_loaded("acme.lint"));
        assert_eq!(h.surface.total(), 0);
    }
}

#[tokio::test]
async fn test_install_times_out_on_stalled_download() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/acme/slow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "namespace": "acme", "name": "slow", "version": "1.0.0"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/acme/slow/1.0.0/file/acme.slow-1.0.0.vsix"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(dir.path(), &server.uri(), 1);

    let err = h
        .manager
        .install("acme", "slow", InstallOptions::default())
        .await
        .expect_err("install should time out");
    assert!(matches!(err, ExtensionError::Timeout { seconds: 1, .. }));

    let ext = h.manager.get("acme.slow").await.expect("entry missing");
    assert_eq!(ext.state, ExtensionState::Error);
    assert!(ext.error.expect("error message").contains("timed out"));
    assert_eq!(h.health.record("acme.slow").expect("record").failures, 1);
}

#[tokio::test]
async fn test_missing_extension_leaves_no_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/acme/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let h = harness(dir.path(), &server.uri(), 30);
    let err = h
        .manager
        .install("acme", "ghost", InstallOptions::default())
        .await
        .expect_err("install should fail");
    assert!(matches!(err, ExtensionError::NotFound(_)));
    assert!(h.manager.list().await.is_empty());
}

#[tokio::test]
async fn test_startup_recovery_does_not_resume_install() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("Failed to create temp dir");

    let mut persisted = InstalledExtensions::default();
    persisted.upsert(InstalledExtension::installing("acme", "lint", "1.0.0"));
    persisted
        .save(&ExtensionsConfig::with_root(dir.path()).registry_file())
        .expect("Failed to seed registry");

    let h = harness(dir.path(), &server.uri(), 30);
    let ext = h.manager.get("acme.lint").await.expect("entry missing");
    assert_eq!(ext.state, ExtensionState::Error);
    assert!(!ext.enabled);

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

#[tokio::test]
async fn test_enabled_extensions_survive_restart() {
    let server = MockServer::start().await;
    publish(&server, &lint_manifest(), &lint_files()).await;
    let dir = TempDir::new().expect("Failed to create temp dir");

    {
        let h = harness(dir.path(), &server.uri(), 30);
        h.manager
            .install("acme", "lint", InstallOptions::default())
            .await
            .expect("install failed");
        h.manager.enable("acme.lint").await.expect("enable failed");
        h.manager.shutdown().await;
    }

    let h = harness(dir.path(), &server.uri(), 30);
    assert_eq!(h.manager.restore_enabled().await, 1);
    assert_eq!(h.surface.languages().len(), 1);
    let ext = h.manager.get("acme.lint").await.expect("entry missing");
    assert_eq!(ext.state, ExtensionState::Enabled);
    assert_eq!(ext.display_name, "Acme Lint");
}
