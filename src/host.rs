//! Extension Host - owns the runtime registry of loaded extensions.
//!
//! Loading an extension registers its static contributions, starts a sandbox
//! when the manifest has an entry point, and activates it right away if one
//! of its activation events has already fired.
//!
//! Loading an id that is already loaded with `reload = true` runs a reload
//! transaction. The replacement is built while the current instance keeps
//! serving. The two are then swapped and the replacement is activated. On
//! success the old instance is released. On failure the swap is undone and
//! only the replacement's resources are released.

use crate::activation::{ActivationMatcher, ActivationState};
use crate::contributions::ContributionLoader;
use crate::dispose::{dispose_all, Cleanup, Disposable};
use crate::installed::InstalledExtension;
use crate::manifest::{ViewContainerContribution, ACTIVATE_ALWAYS, ON_STARTUP_FINISHED};
use crate::sandbox::{SandboxError, SandboxFactory, SandboxHandle};
use crate::store::PackageStore;
use crate::surface::{EditorSurface, WebviewViewRegistration};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by the host
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Extension {0} is not loaded")]
    NotLoaded(String),

    #[error("Extension {0} has no runtime code")]
    NoSandbox(String),

    #[error("Extension {0} is not activated")]
    NotActivated(String),

    #[error("Extension {id} contributes no webview view {view_id}")]
    UnknownView { id: String, view_id: String },

    #[error("Sandbox for {id} failed: {source}")]
    Sandbox {
        id: String,
        #[source]
        source: SandboxError,
    },

    #[error("Activation of {id} on {event} failed: {source}")]
    Activation {
        id: String,
        event: String,
        #[source]
        source: SandboxError,
    },
}

/// Runtime state of one loaded extension instance
#[derive(Debug)]
pub struct LoadedExtension {
    /// Unique per built instance; a reload produces a new value
    pub instance_id: u64,
    pub extension: InstalledExtension,
    pub path: PathBuf,
    pub activated: bool,
    /// Event that caused the current activation
    pub activated_by: Option<String>,
    pub activation_events: Vec<String>,
    pub view_containers: Vec<ViewContainerContribution>,
    pub webview_views: Vec<WebviewViewRegistration>,
    /// Contribution items skipped while loading
    pub load_warnings: Vec<String>,
    sandbox: Option<SandboxHandle>,
    disposables: Vec<Disposable>,
    language_services: BTreeMap<String, Vec<Disposable>>,
}

impl LoadedExtension {
    pub fn id(&self) -> &str {
        &self.extension.id
    }

    pub fn has_sandbox(&self) -> bool {
        self.sandbox.is_some()
    }

    /// The sandbox's own activation flag; `None` without runtime code
    pub fn sandbox_activated(&self) -> Option<bool> {
        self.sandbox.as_ref().map(SandboxHandle::is_activated)
    }

    /// Language ids registered by this instance
    pub fn language_ids(&self) -> Vec<&str> {
        self.language_services.keys().map(String::as_str).collect()
    }

    pub fn disposable_count(&self) -> usize {
        self.disposables.len() + self.language_services.values().map(Vec::len).sum::<usize>()
    }

    fn attach(&self) {
        if let Some(sandbox) = &self.sandbox {
            sandbox.attach();
        }
    }

    fn detach(&self) {
        if let Some(sandbox) = &self.sandbox {
            sandbox.detach();
        }
    }

    async fn dispose_sandbox(&mut self) -> Cleanup {
        let mut cleanup = Cleanup::new();
        if let Some(sandbox) = self.sandbox.as_mut() {
            if let Err(e) = sandbox.dispose().await {
                cleanup.warn(format!("sandbox: {}", e));
            }
        }
        self.sandbox = None;
        self.activated = false;
        cleanup
    }

    /// Run disposables in registration order, then the language services
    fn release_contributions(&mut self) -> Cleanup {
        let mut cleanup = dispose_all(&mut self.disposables);
        for (_, mut services) in std::mem::take(&mut self.language_services) {
            cleanup.merge(dispose_all(&mut services));
        }
        cleanup
    }

    /// Release everything this instance acquired
    async fn dispose(mut self) -> Cleanup {
        self.detach();
        let mut cleanup = self.dispose_sandbox().await;
        cleanup.merge(self.release_contributions());
        cleanup
    }
}

/// Result of firing an activation event
#[derive(Debug, Default)]
pub struct ActivationOutcome {
    pub activated: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// The instance displaced by a swap, kept until the replacement proves itself
struct PendingSwap {
    id: String,
    previous: LoadedExtension,
}

pub struct ExtensionHost {
    loader: ContributionLoader,
    sandboxes: Arc<dyn SandboxFactory>,
    matcher: Arc<dyn ActivationMatcher>,
    extensions_root: PathBuf,
    loaded: HashMap<String, LoadedExtension>,
    fired_events: BTreeSet<String>,
    next_instance: u64,
}

impl ExtensionHost {
    pub fn new(
        surface: Arc<dyn EditorSurface>,
        store: Arc<dyn PackageStore>,
        sandboxes: Arc<dyn SandboxFactory>,
        matcher: Arc<dyn ActivationMatcher>,
        extensions_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            loader: ContributionLoader::new(store, surface),
            sandboxes,
            matcher,
            extensions_root: extensions_root.into(),
            loaded: HashMap::new(),
            fired_events: BTreeSet::new(),
            next_instance: 1,
        }
    }

    pub fn extensions_root(&self) -> &Path {
        &self.extensions_root
    }

    pub fn matcher(&self) -> &Arc<dyn ActivationMatcher> {
        &self.matcher
    }

    pub fn loaded(&self, id: &str) -> Option<&LoadedExtension> {
        self.loaded.get(&id.to_lowercase())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded.contains_key(&id.to_lowercase())
    }

    /// Loaded ids, sorted
    pub fn loaded_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loaded.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Events fired so far, sorted
    pub fn fired_events(&self) -> Vec<String> {
        self.fired_events.iter().cloned().collect()
    }

    /// Load `extension`, or hot-swap it when already loaded and `reload` is set
    pub async fn load_extension(
        &mut self,
        extension: &InstalledExtension,
        reload: bool,
    ) -> Result<(), HostError> {
        let id = extension.id.clone();
        if self.loaded.contains_key(&id) {
            if !reload {
                warn!(id = %id, "Extension already loaded, ignoring load request");
                return Ok(());
            }
            return self.reload_extension(extension).await;
        }

        let instance = self.build_instance(extension).await?;
        let instance_id = instance.instance_id;
        self.install_instance(instance);

        if let Some(event) = self.eager_event(&id) {
            if let Err(e) = self.activate_extension(&id, &event).await {
                let cleanup = self.unload_extension(&id).await;
                for warning in &cleanup.warnings {
                    warn!(id = %id, warning = %warning, "Cleanup after failed activation");
                }
                return Err(e);
            }
        }
        info!(id = %id, instance = instance_id, "Extension loaded");
        Ok(())
    }

    /// Tear down the instance for `id`. Unknown ids yield an empty outcome.
    pub async fn unload_extension(&mut self, id: &str) -> Cleanup {
        let id = id.to_lowercase();
        let Some(mut instance) = self.loaded.remove(&id) else {
            debug!(id = %id, "Unload requested for extension that is not loaded");
            return Cleanup::new();
        };
        instance.detach();
        let mut cleanup = instance.dispose_sandbox().await;
        self.matcher.unregister(&id);
        cleanup.merge(instance.release_contributions());

        if cleanup.is_clean() {
            info!(id = %id, "Extension unloaded");
        } else {
            warn!(id = %id, warnings = cleanup.warnings.len(), "Extension unloaded with warnings");
        }
        cleanup
    }

    pub async fn unload_all(&mut self) -> Cleanup {
        let mut cleanup = Cleanup::new();
        for id in self.loaded_ids() {
            cleanup.merge(self.unload_extension(&id).await);
        }
        cleanup
    }

    /// Activate `id` for `event`.
    ///
    /// A no-op when both the cached flag and the sandbox agree the extension is
    /// active; when they disagree the sandbox is activated again.
    pub async fn activate_extension(&mut self, id: &str, event: &str) -> Result<(), HostError> {
        let id = id.to_lowercase();
        let matcher = self.matcher.clone();
        let instance = self
            .loaded
            .get_mut(&id)
            .ok_or_else(|| HostError::NotLoaded(id.clone()))?;

        let Some(sandbox) = instance.sandbox.as_mut() else {
            if !instance.activated {
                instance.activated = true;
                instance.activated_by = Some(event.to_string());
                matcher.mark(&id, ActivationState::Activated);
                debug!(id = %id, event = %event, "Activated static extension");
            }
            return Ok(());
        };

        let sandbox_active = sandbox.is_activated();
        if instance.activated && sandbox_active {
            return Ok(());
        }
        if instance.activated != sandbox_active {
            warn!(
                id = %id,
                cached = instance.activated,
                sandbox = sandbox_active,
                "Activation state out of sync, re-activating"
            );
        }

        matcher.mark(&id, ActivationState::Activating);
        match sandbox.activate(event).await {
            Ok(()) => {
                instance.activated = true;
                instance.activated_by = Some(event.to_string());
                matcher.mark(&id, ActivationState::Activated);
                info!(id = %id, event = %event, "Extension activated");
                Ok(())
            }
            Err(source) => {
                instance.activated = false;
                matcher.mark(&id, ActivationState::Failed);
                Err(HostError::Activation {
                    id,
                    event: event.to_string(),
                    source,
                })
            }
        }
    }

    /// Fire `event` and activate every loaded extension interested in it.
    /// Each activation is independent of the others.
    pub async fn trigger_activation_event(&mut self, event: &str) -> ActivationOutcome {
        self.fired_events.insert(event.to_string());
        let mut outcome = ActivationOutcome::default();
        for id in self.matcher.extensions_for(event) {
            let already = self
                .loaded
                .get(&id)
                .map(|l| l.activated && l.sandbox_activated().unwrap_or(true));
            match already {
                None | Some(true) => continue,
                Some(false) => {}
            }
            match self.activate_extension(&id, event).await {
                Ok(()) => outcome.activated.push(id),
                Err(e) => {
                    warn!(id = %id, event = %event, error = %e, "Activation failed");
                    outcome.failed.push((id, e.to_string()));
                }
            }
        }
        outcome
    }

    pub async fn startup_finished(&mut self) -> ActivationOutcome {
        self.trigger_activation_event(ON_STARTUP_FINISHED).await
    }

    /// HTML for `view_id`, activating the owning extension first if needed
    pub async fn resolve_extension_webview(
        &mut self,
        id: &str,
        view_id: &str,
    ) -> Result<String, HostError> {
        let id = id.to_lowercase();
        let instance = self
            .loaded
            .get(&id)
            .ok_or_else(|| HostError::NotLoaded(id.clone()))?;
        if !instance.webview_views.iter().any(|v| v.view_id == view_id) {
            return Err(HostError::UnknownView {
                id,
                view_id: view_id.to_string(),
            });
        }
        if !instance.has_sandbox() {
            return Err(HostError::NoSandbox(id));
        }
        if !instance.activated || instance.sandbox_activated() != Some(true) {
            self.activate_extension(&id, &format!("onView:{}", view_id))
                .await?;
        }

        let sandbox = self
            .loaded
            .get_mut(&id)
            .and_then(|l| l.sandbox.as_mut())
            .ok_or_else(|| HostError::NoSandbox(id.clone()))?;
        sandbox
            .resolve_webview(view_id)
            .await
            .map_err(|source| HostError::Sandbox { id, source })
    }

    /// Forward a webview message; never activates
    pub async fn send_message_to_extension(
        &mut self,
        id: &str,
        message: Value,
    ) -> Result<(), HostError> {
        let id = id.to_lowercase();
        let instance = self
            .loaded
            .get_mut(&id)
            .ok_or_else(|| HostError::NotLoaded(id.clone()))?;
        if !instance.activated {
            return Err(HostError::NotActivated(id));
        }
        let sandbox = instance
            .sandbox
            .as_mut()
            .ok_or_else(|| HostError::NoSandbox(id.clone()))?;
        sandbox
            .post_message(message)
            .await
            .map_err(|source| HostError::Sandbox { id, source })
    }

    /// Build a complete instance without touching the runtime registry
    async fn build_instance(
        &mut self,
        extension: &InstalledExtension,
    ) -> Result<LoadedExtension, HostError> {
        let id = extension.id.clone();
        let manifest = &extension.manifest;
        let path = self.extensions_root.join(&extension.path);
        let contributions = self.loader.load(&id, &path, manifest).await;

        let mut instance = LoadedExtension {
            instance_id: self.next_instance,
            extension: extension.clone(),
            path: path.clone(),
            activated: false,
            activated_by: None,
            activation_events: manifest.effective_activation_events(),
            view_containers: contributions.view_containers,
            webview_views: contributions.webview_views,
            load_warnings: contributions.warnings,
            sandbox: None,
            disposables: contributions.disposables,
            language_services: contributions.language_services,
        };
        self.next_instance += 1;

        if manifest.has_entry_point() {
            let started = match self.sandboxes.create(manifest, &path) {
                Ok(sandbox) => SandboxHandle::start(&id, sandbox, self.matcher.clone()).await,
                Err(e) => Err(e),
            };
            match started {
                Ok(handle) => instance.sandbox = Some(handle),
                Err(source) => {
                    let cleanup = instance.dispose().await;
                    for warning in &cleanup.warnings {
                        warn!(id = %id, warning = %warning, "Cleanup after failed sandbox start");
                    }
                    return Err(HostError::Sandbox { id, source });
                }
            }
        }

        debug!(
            id = %id,
            instance = instance.instance_id,
            disposables = instance.disposable_count(),
            "Built extension instance"
        );
        Ok(instance)
    }

    /// Make `instance` the live one for its id
    fn install_instance(&mut self, instance: LoadedExtension) -> Option<LoadedExtension> {
        let id = instance.id().to_string();
        self.matcher.register(&id, &instance.activation_events);
        instance.attach();
        self.loaded.insert(id, instance)
    }

    /// Event to activate a freshly installed instance with, if any has been satisfied
    fn eager_event(&self, id: &str) -> Option<String> {
        let instance = self.loaded.get(id)?;
        if instance
            .activation_events
            .iter()
            .any(|e| e == ACTIVATE_ALWAYS)
        {
            return Some(ACTIVATE_ALWAYS.to_string());
        }
        self.fired_events
            .iter()
            .find(|event| self.matcher.should_activate(id, event))
            .cloned()
    }

    async fn reload_extension(&mut self, extension: &InstalledExtension) -> Result<(), HostError> {
        let id = extension.id.clone();
        let fresh = self.build_instance(extension).await?;
        let fresh_instance = fresh.instance_id;

        let Some(previous) = self.install_instance(fresh) else {
            return Ok(());
        };
        let swap = PendingSwap {
            id: id.clone(),
            previous,
        };

        let event = self
            .eager_event(&id)
            .or_else(|| swap.previous.activated_by.clone());
        let activated = match event {
            Some(event) => self.activate_extension(&id, &event).await,
            None => Ok(()),
        };

        match activated {
            Ok(()) => {
                let cleanup = self.commit(swap).await;
                info!(
                    id = %id,
                    instance = fresh_instance,
                    warnings = cleanup.warnings.len(),
                    "Extension reloaded"
                );
                Ok(())
            }
            Err(e) => {
                let cleanup = self.rollback(swap).await;
                warn!(
                    id = %id,
                    error = %e,
                    warnings = cleanup.warnings.len(),
                    "Reload failed, previous instance restored"
                );
                Err(e)
            }
        }
    }

    /// Release the displaced instance
    async fn commit(&mut self, swap: PendingSwap) -> Cleanup {
        debug!(id = %swap.id, instance = swap.previous.instance_id, "Releasing replaced instance");
        swap.previous.dispose().await
    }

    /// Put the displaced instance back and release the replacement
    async fn rollback(&mut self, swap: PendingSwap) -> Cleanup {
        let PendingSwap { id, previous } = swap;
        let was_activated = previous.activated;
        let failed = self.install_instance(previous);
        if was_activated {
            self.matcher.mark(&id, ActivationState::Activated);
        }
        match failed {
            Some(failed) => failed.dispose().await,
            None => Cleanup::new(),
        }
    }
}
