//! Extension Manager - install, enable, disable and uninstall.
//!
//! The manager owns the persisted registry (`extensions.json`) and drives
//! every entry through the lifecycle state machine:
//!
//! ```text
//! installing -> installed -> enabling -> enabled -> disabling -> disabled
//!                                ^                                  |
//!                                +----------------------------------+
//! ```
//!
//! Any non-terminal state can fall into `error`. Every transition is written
//! to disk before the matching [`ExtensionEvent`] is published, and every
//! public operation is serialized per extension id.

use crate::compatibility;
use crate::config::ExtensionsConfig;
use crate::dispose::Cleanup;
use crate::events::{EventBus, ExtensionEvent};
use crate::health::HealthMonitor;
use crate::host::{ExtensionHost, HostError};
use crate::installed::{
    extension_id, split_id, ExtensionState, InstalledExtension, InstalledExtensions, PersistError,
};
use crate::jsonc;
use crate::manifest::ExtensionManifest;
use crate::registry::{RegistryClient, RegistryError};
use crate::store::{PackageStore, StoreError};
use futures::future::BoxFuture;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Manifest file inside an extension folder
const MANIFEST_FILE: &str = "package.json";

/// Errors surfaced by manager operations
#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("Extension not found: {0}")]
    NotFound(String),

    #[error("Extension already installed: {0}")]
    AlreadyInstalled(String),

    #[error("Extension is incompatible: {}", .0.join("; "))]
    Incompatible(Vec<String>),

    #[error("Cannot {operation} {id} while it is {state}")]
    InvalidState {
        id: String,
        state: ExtensionState,
        operation: &'static str,
    },

    #[error("Installation of {id} timed out after {seconds}s")]
    Timeout { id: String, seconds: u64 },

    #[error("Dependency {dependency} of {id} is missing")]
    DependencyMissing { id: String, dependency: String },

    #[error("Dependency {dependency} of {id} is {state}")]
    DependencyUnavailable {
        id: String,
        dependency: String,
        state: ExtensionState,
    },

    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Invalid manifest for {id}: {reason}")]
    InvalidManifest { id: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Package store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("Failed to persist extension registry: {0}")]
    Persist(#[from] PersistError),

    #[error("{0}")]
    Unknown(String),
}

/// Options for [`ExtensionManager::install`]
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Exact version; latest when `None`
    pub version: Option<String>,
    /// Replace an existing installation
    pub force: bool,
}

/// Action taken by a health sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remediation {
    Disabled(String),
    Uninstalled(String),
}

/// Hex-encoded SHA-256 of a package
fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Clone)]
pub struct ExtensionManager {
    config: Arc<ExtensionsConfig>,
    registry: Arc<dyn RegistryClient>,
    store: Arc<dyn PackageStore>,
    health: Arc<dyn HealthMonitor>,
    host: Arc<Mutex<ExtensionHost>>,
    installed: Arc<RwLock<InstalledExtensions>>,
    op_locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    events: EventBus,
    sweep: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    platform: String,
}

impl ExtensionManager {
    /// Load the persisted registry and normalize entries left mid-transition
    pub fn new(
        config: ExtensionsConfig,
        registry: Arc<dyn RegistryClient>,
        store: Arc<dyn PackageStore>,
        health: Arc<dyn HealthMonitor>,
        host: ExtensionHost,
    ) -> Result<Self, ExtensionError> {
        let path = config.registry_file();
        let mut installed = InstalledExtensions::load(&path);
        let recovered = installed.recover();
        for change in &recovered {
            info!(
                id = %change.id,
                from = %change.from,
                to = %change.to,
                "Recovered extension state"
            );
        }
        if !recovered.is_empty() {
            installed.save(&path)?;
        }
        debug!(count = installed.len(), path = ?path, "Extension registry ready");

        Ok(Self {
            config: Arc::new(config),
            registry,
            store,
            health,
            host: Arc::new(Mutex::new(host)),
            installed: Arc::new(RwLock::new(installed)),
            op_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            events: EventBus::new(),
            sweep: Arc::new(std::sync::Mutex::new(None)),
            platform: compatibility::current_target_platform(),
        })
    }

    pub fn config(&self) -> &ExtensionsConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<Mutex<ExtensionHost>> {
        &self.host
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtensionEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, id: &str) -> Option<InstalledExtension> {
        self.installed.read().await.get(id).cloned()
    }

    /// All entries, ordered by id
    pub async fn list(&self) -> Vec<InstalledExtension> {
        self.installed
            .read()
            .await
            .extensions
            .values()
            .cloned()
            .collect()
    }

    fn extension_dir(&self, ext: &InstalledExtension) -> PathBuf {
        self.config.root.join(&ext.path)
    }

    /// Per-id serialization lock
    fn op_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .op_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id.to_lowercase()).or_default().clone()
    }

    fn persist(&self, installed: &InstalledExtensions) {
        if let Err(e) = installed.save(&self.config.registry_file()) {
            warn!(error = %e, "Failed to persist extension registry");
        }
    }

    /// Mutate the entry for `id`, persist, then publish the post-transition event
    async fn transition(
        &self,
        id: &str,
        update: impl FnOnce(&mut InstalledExtension) + Send,
    ) -> Result<InstalledExtension, ExtensionError> {
        let snapshot = {
            let mut installed = self.installed.write().await;
            let entry = installed
                .get_mut(id)
                .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
            update(entry);
            let snapshot = entry.clone();
            self.persist(&installed);
            snapshot
        };
        info!(id = %snapshot.id, state = %snapshot.state, "Extension state changed");
        self.events.emit(ExtensionEvent::for_state(&snapshot));
        Ok(snapshot)
    }

    /// Install `publisher.name` and any missing dependencies
    pub async fn install(
        &self,
        publisher: &str,
        name: &str,
        options: InstallOptions,
    ) -> Result<InstalledExtension, ExtensionError> {
        self.install_chain(publisher.to_string(), name.to_string(), options, Vec::new())
            .await
    }

    /// `chain` holds the ids whose installs are waiting on this one
    fn install_chain(
        &self,
        publisher: String,
        name: String,
        options: InstallOptions,
        chain: Vec<String>,
    ) -> BoxFuture<'_, Result<InstalledExtension, ExtensionError>> {
        async move {
            let id = extension_id(&publisher, &name);
            if chain.contains(&id) {
                let mut cycle = chain;
                cycle.push(id);
                return Err(ExtensionError::CyclicDependency(cycle));
            }
            let lock = self.op_lock(&id);
            let _guard = lock.lock().await;
            self.install_locked(&publisher, &name, options, chain).await
        }
        .boxed()
    }

    async fn install_locked(
        &self,
        publisher: &str,
        name: &str,
        options: InstallOptions,
        mut chain: Vec<String>,
    ) -> Result<InstalledExtension, ExtensionError> {
        let id = extension_id(publisher, name);
        let previous = self.get(&id).await;
        if previous.is_some() && !options.force {
            return Err(ExtensionError::AlreadyInstalled(id));
        }

        let metadata = self
            .registry
            .get_extension(publisher, name, options.version.as_deref())
            .await?
            .ok_or_else(|| ExtensionError::NotFound(id.clone()))?;

        let report = compatibility::check(&metadata, &self.config.api_version, &self.platform);
        for warning in &report.warnings {
            warn!(id = %id, warning = %warning, "Compatibility warning");
        }
        if !report.is_compatible() {
            return Err(ExtensionError::Incompatible(report.errors));
        }

        let mut entry = InstalledExtension::installing(publisher, name, &metadata.version);
        if let Some(display_name) = &metadata.display_name {
            entry.display_name = display_name.clone();
        }
        if let Some(description) = &metadata.description {
            entry.description = description.clone();
        }
        entry.dependencies = metadata
            .dependencies
            .iter()
            .map(|d| d.to_lowercase())
            .collect();
        entry.enabled = previous
            .as_ref()
            .is_some_and(|prev| prev.state == ExtensionState::Enabled);

        {
            let mut installed = self.installed.write().await;
            installed.upsert(entry.clone());
            self.persist(&installed);
        }
        info!(id = %id, version = %entry.version, "Installing extension");
        self.events.emit(ExtensionEvent::for_state(&entry));

        chain.push(id.clone());
        let installed = match self.complete_install(&entry, &chain).await {
            Ok(ext) => ext,
            Err(e) => {
                self.fail_install(&id, &e).await;
                return Err(e);
            }
        };

        match previous {
            Some(previous) if previous.state == ExtensionState::Enabled => {
                self.swap_reinstalled(installed, previous).await
            }
            Some(previous) => {
                self.remove_replaced_version(&installed, &previous).await;
                Ok(installed)
            }
            None => Ok(installed),
        }
    }

    /// Everything after the entry has been registered as `installing`
    async fn complete_install(
        &self,
        entry: &InstalledExtension,
        chain: &[String],
    ) -> Result<InstalledExtension, ExtensionError> {
        let id = entry.id.as_str();
        let (manifest, digest) =
            tokio::time::timeout(self.config.install_timeout(), self.fetch_package(entry))
                .await
                .map_err(|_| ExtensionError::Timeout {
                    id: id.to_string(),
                    seconds: self.config.install_timeout_secs,
                })??;

        let mut dependencies = entry.dependencies.clone();
        for dependency in manifest.dependency_ids() {
            if !dependencies.contains(&dependency) {
                dependencies.push(dependency);
            }
        }
        self.install_dependencies(id, &dependencies, chain).await?;

        let installed = self
            .transition(id, move |ext| {
                ext.apply_manifest(manifest);
                ext.package_sha256 = Some(digest);
                ext.set_state(ExtensionState::Installed);
            })
            .await?;
        self.health.record_success(id);
        Ok(installed)
    }

    /// Delete the folder of a replaced version unless the new one reuses it
    async fn remove_replaced_version(
        &self,
        installed: &InstalledExtension,
        replaced: &InstalledExtension,
    ) {
        if replaced.path == installed.path {
            return;
        }
        let dir = self.extension_dir(replaced);
        if let Err(e) = self.store.remove(&dir).await {
            warn!(id = %installed.id, path = ?dir, error = %e, "Failed to remove replaced version");
        }
    }

    /// Hot-swap a reinstalled extension that was enabled.
    ///
    /// The previous version's files and entry are only dropped once the new
    /// instance is live. If the swap fails the host keeps the previous
    /// instance, so its entry is put back and the new folder removed.
    async fn swap_reinstalled(
        &self,
        installed: InstalledExtension,
        previous: InstalledExtension,
    ) -> Result<InstalledExtension, ExtensionError> {
        let id = installed.id.clone();
        let installed = self
            .transition(&id, |ext| ext.set_state(ExtensionState::Enabling))
            .await?;
        let swapped = self
            .host
            .lock()
            .await
            .load_extension(&installed, true)
            .await;

        match swapped {
            Ok(()) => {
                self.remove_replaced_version(&installed, &previous).await;
                self.transition(&id, |ext| {
                    ext.set_state(ExtensionState::Enabled);
                    ext.enabled = true;
                })
                .await
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    id = %id,
                    version = %installed.version,
                    restored = %previous.version,
                    error = %message,
                    "Reinstalled version failed to start, previous version kept"
                );
                self.remove_replaced_version(&previous, &installed).await;
                self.transition(&id, move |ext| *ext = previous).await?;
                self.health.record_failure(&id, &message);
                Err(e.into())
            }
        }
    }

    /// Download, extract and read the manifest of the package for `entry`
    async fn fetch_package(
        &self,
        entry: &InstalledExtension,
    ) -> Result<(ExtensionManifest, String), ExtensionError> {
        let bytes = self
            .registry
            .download(&entry.publisher, &entry.name, &entry.version)
            .await?;
        let digest = sha256_hex(&bytes);
        debug!(id = %entry.id, bytes = bytes.len(), sha256 = %digest, "Downloaded package");

        let target = self.extension_dir(entry);
        self.store.extract(&bytes, &target).await?;
        let manifest = self.read_manifest(&entry.id, &target).await?;
        if manifest.id() != entry.id {
            warn!(id = %entry.id, manifest_id = %manifest.id(), "Package manifest id differs");
        }
        Ok((manifest, digest))
    }

    async fn read_manifest(
        &self,
        id: &str,
        dir: &Path,
    ) -> Result<ExtensionManifest, ExtensionError> {
        let raw = self.store.read_to_string(&dir.join(MANIFEST_FILE)).await?;
        let manifest: ExtensionManifest =
            jsonc::parse(&raw).map_err(|e| ExtensionError::InvalidManifest {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if manifest.name.is_empty() || manifest.publisher.is_empty() {
            return Err(ExtensionError::InvalidManifest {
                id: id.to_string(),
                reason: "missing name or publisher".to_string(),
            });
        }
        Ok(manifest)
    }

    async fn install_dependencies(
        &self,
        id: &str,
        dependencies: &[String],
        chain: &[String],
    ) -> Result<(), ExtensionError> {
        for dependency in dependencies {
            if chain.contains(dependency) {
                let mut cycle = chain.to_vec();
                cycle.push(dependency.clone());
                return Err(ExtensionError::CyclicDependency(cycle));
            }
            let force = match self.get(dependency).await.map(|dep| dep.state) {
                Some(state) if state.is_installed() => {
                    debug!(id = %id, dependency = %dependency, "Dependency already installed");
                    continue;
                }
                Some(ExtensionState::Error) => true,
                // Mid-install or mid-uninstall in another task
                Some(state) => {
                    return Err(ExtensionError::DependencyUnavailable {
                        id: id.to_string(),
                        dependency: dependency.clone(),
                        state,
                    })
                }
                None => false,
            };
            let Some((publisher, name)) = split_id(dependency) else {
                return Err(ExtensionError::DependencyMissing {
                    id: id.to_string(),
                    dependency: dependency.clone(),
                });
            };

            info!(id = %id, dependency = %dependency, reinstall = force, "Installing dependency");
            let options = InstallOptions {
                version: None,
                force,
            };
            match self
                .install_chain(
                    publisher.to_string(),
                    name.to_string(),
                    options,
                    chain.to_vec(),
                )
                .await
            {
                Ok(_) => {}
                Err(ExtensionError::NotFound(_)) => {
                    return Err(ExtensionError::DependencyMissing {
                        id: id.to_string(),
                        dependency: dependency.clone(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Record an install failure on the entry and with the health monitor
    async fn fail_install(&self, id: &str, error: &ExtensionError) {
        let message = error.to_string();
        warn!(id = %id, error = %message, "Installation failed");

        {
            let mut host = self.host.lock().await;
            if host.is_loaded(id) {
                let cleanup = host.unload_extension(id).await;
                for warning in &cleanup.warnings {
                    warn!(id = %id, warning = %warning, "Cleanup after failed install");
                }
            }
        }

        let reason = message.clone();
        if let Err(e) = self
            .transition(id, move |ext| {
                ext.set_error(reason);
                ext.enabled = false;
            })
            .await
        {
            warn!(id = %id, error = %e, "Failed to record install failure");
        }

        self.health.record_failure(id, &message);
        if self.health.should_auto_uninstall(id) {
            self.schedule_auto_uninstall(id);
        }
    }

    /// Remove a failed extension after a grace period, unless it recovered meanwhile
    fn schedule_auto_uninstall(&self, id: &str) {
        let manager = self.clone();
        let id = id.to_string();
        let delay = self.config.auto_uninstall_delay();
        info!(id = %id, delay_secs = delay.as_secs(), "Scheduling automatic uninstall");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_failed = manager
                .get(&id)
                .await
                .is_some_and(|ext| ext.state == ExtensionState::Error);
            if !still_failed {
                debug!(id = %id, "Skipping automatic uninstall, extension recovered");
                return;
            }
            match manager.uninstall(&id, true).await {
                Ok(cleanup) => info!(
                    id = %id,
                    warnings = cleanup.warnings.len(),
                    "Automatically uninstalled failing extension"
                ),
                Err(e) => warn!(id = %id, error = %e, "Automatic uninstall failed"),
            }
        });
    }

    /// Load an extension into the host and mark it enabled
    pub async fn enable(&self, id: &str) -> Result<InstalledExtension, ExtensionError> {
        let id = id.to_lowercase();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;
        self.enable_locked(&id).await
    }

    async fn enable_locked(&self, id: &str) -> Result<InstalledExtension, ExtensionError> {
        let ext = self
            .get(id)
            .await
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;

        if ext.state == ExtensionState::Enabled {
            let mut host = self.host.lock().await;
            if !host.is_loaded(id) {
                debug!(id = %id, "Enabled extension missing from host, loading");
                host.load_extension(&ext, false).await?;
            }
            return Ok(ext);
        }
        if !ext.state.can_enable() {
            return Err(ExtensionError::InvalidState {
                id: id.to_string(),
                state: ext.state,
                operation: "enable",
            });
        }

        let ext = self
            .transition(id, |e| e.set_state(ExtensionState::Enabling))
            .await?;
        let loaded = self.host.lock().await.load_extension(&ext, false).await;

        match loaded {
            Ok(()) => {
                self.health.record_success(id);
                self.transition(id, |e| {
                    e.set_state(ExtensionState::Enabled);
                    e.enabled = true;
                })
                .await
            }
            Err(e) => {
                let message = e.to_string();
                self.health.record_failure(id, &message);
                if self.health.should_auto_disable(id) {
                    warn!(id = %id, error = %message, "Failure threshold reached, disabling extension");
                    self.transition(id, move |ext| {
                        ext.set_state(ExtensionState::Disabled);
                        ext.enabled = false;
                        ext.error = Some(message);
                    })
                    .await?;
                } else {
                    self.transition(id, move |ext| {
                        ext.set_error(message);
                        ext.enabled = false;
                    })
                    .await?;
                }
                Err(e.into())
            }
        }
    }

    /// Unload an enabled extension from the host
    pub async fn disable(&self, id: &str) -> Result<InstalledExtension, ExtensionError> {
        let id = id.to_lowercase();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;
        let (ext, cleanup) = self.disable_locked(&id).await?;
        for warning in &cleanup.warnings {
            warn!(id = %id, warning = %warning, "Cleanup warning while disabling");
        }
        Ok(ext)
    }

    async fn disable_locked(
        &self,
        id: &str,
    ) -> Result<(InstalledExtension, Cleanup), ExtensionError> {
        let ext = self
            .get(id)
            .await
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        if ext.state != ExtensionState::Enabled {
            return Err(ExtensionError::InvalidState {
                id: id.to_string(),
                state: ext.state,
                operation: "disable",
            });
        }

        self.transition(id, |e| e.set_state(ExtensionState::Disabling))
            .await?;
        let cleanup = self.host.lock().await.unload_extension(id).await;
        let ext = self
            .transition(id, |e| {
                e.set_state(ExtensionState::Disabled);
                e.enabled = false;
            })
            .await?;
        Ok((ext, cleanup))
    }

    /// Remove an extension. Teardown problems are returned as warnings.
    ///
    /// Entries in a transient state need `force`. With `force`, a failing
    /// disable does not stop the removal.
    pub async fn uninstall(&self, id: &str, force: bool) -> Result<Cleanup, ExtensionError> {
        let id = id.to_lowercase();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;
        self.uninstall_locked(&id, force).await
    }

    async fn uninstall_locked(&self, id: &str, force: bool) -> Result<Cleanup, ExtensionError> {
        let ext = self
            .get(id)
            .await
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))?;
        if ext.state.is_transient() && !force {
            return Err(ExtensionError::InvalidState {
                id: id.to_string(),
                state: ext.state,
                operation: "uninstall",
            });
        }

        let mut cleanup = Cleanup::new();
        if ext.state == ExtensionState::Enabled {
            match self.disable_locked(id).await {
                Ok((_, disabled)) => cleanup.merge(disabled),
                Err(e) if force => {
                    warn!(id = %id, error = %e, "Disable failed during forced uninstall");
                    cleanup.warn(format!("disable: {}", e));
                }
                Err(e) => return Err(e),
            }
        }
        {
            let mut host = self.host.lock().await;
            if host.is_loaded(id) {
                cleanup.merge(host.unload_extension(id).await);
            }
        }

        let ext = self
            .transition(id, |e| e.set_state(ExtensionState::Uninstalling))
            .await?;
        let dir = self.extension_dir(&ext);
        if let Err(e) = self.store.remove(&dir).await {
            warn!(id = %id, path = ?dir, error = %e, "Failed to remove extension files");
            cleanup.warn(format!("remove {}: {}", dir.display(), e));
        }

        let removed = {
            let mut installed = self.installed.write().await;
            let removed = installed.remove(id);
            self.persist(&installed);
            removed
        };
        self.health.reset(id);

        let removed = removed.unwrap_or(ext);
        info!(id = %id, warnings = cleanup.warnings.len(), "Extension uninstalled");
        self.events.emit(ExtensionEvent::Uninstalled(removed));
        Ok(cleanup)
    }

    /// Re-read the manifest from disk and hot-swap the running instance
    pub async fn reload(&self, id: &str) -> Result<InstalledExtension, ExtensionError> {
        let id = id.to_lowercase();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        let ext = self
            .get(&id)
            .await
            .ok_or_else(|| ExtensionError::NotFound(id.clone()))?;
        if ext.state != ExtensionState::Enabled {
            return Err(ExtensionError::InvalidState {
                id,
                state: ext.state,
                operation: "reload",
            });
        }

        let manifest = self.read_manifest(&id, &self.extension_dir(&ext)).await?;
        let updated = {
            let mut installed = self.installed.write().await;
            let entry = installed
                .get_mut(&id)
                .ok_or_else(|| ExtensionError::Unknown(format!("{} vanished during reload", id)))?;
            entry.apply_manifest(manifest);
            let snapshot = entry.clone();
            self.persist(&installed);
            snapshot
        };

        let reloaded = self.host.lock().await.load_extension(&updated, true).await;
        match reloaded {
            Ok(()) => {
                self.health.record_success(&id);
                info!(id = %id, "Extension reloaded");
                Ok(updated)
            }
            Err(e) => {
                self.health.record_failure(&id, &e.to_string());
                warn!(id = %id, error = %e, "Reload failed, previous instance kept");
                Err(e.into())
            }
        }
    }

    /// Load every `enabled` entry into the host. Returns how many loaded.
    pub async fn restore_enabled(&self) -> usize {
        let ids: Vec<String> = self
            .installed
            .read()
            .await
            .extensions
            .values()
            .filter(|ext| ext.state == ExtensionState::Enabled)
            .map(|ext| ext.id.clone())
            .collect();

        let mut restored = 0;
        for id in ids {
            let lock = self.op_lock(&id);
            let _guard = lock.lock().await;
            let Some(ext) = self.get(&id).await else {
                continue;
            };
            if ext.state != ExtensionState::Enabled {
                continue;
            }

            let loaded = self.host.lock().await.load_extension(&ext, false).await;
            match loaded {
                Ok(()) => {
                    self.health.record_success(&id);
                    restored += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(id = %id, error = %message, "Failed to restore extension");
                    self.health.record_failure(&id, &message);
                    if let Err(e) = self
                        .transition(&id, move |ext| {
                            ext.set_error(message);
                            ext.enabled = false;
                        })
                        .await
                    {
                        warn!(id = %id, error = %e, "Failed to record restore failure");
                    }
                }
            }
        }
        info!(restored = restored, "Restored enabled extensions");
        restored
    }

    /// One pass over the extensions the health monitor reports unhealthy
    pub async fn run_health_sweep(&self) -> Vec<Remediation> {
        let mut actions = Vec::new();
        for id in self.health.unhealthy() {
            let Some(ext) = self.get(&id).await else {
                debug!(id = %id, "Dropping health record of unknown extension");
                self.health.reset(&id);
                continue;
            };
            if self.health.should_auto_uninstall(&id) {
                match self.uninstall(&id, true).await {
                    Ok(cleanup) => {
                        info!(id = %id, warnings = cleanup.warnings.len(), "Health sweep uninstalled extension");
                        actions.push(Remediation::Uninstalled(id));
                    }
                    Err(e) => warn!(id = %id, error = %e, "Health sweep uninstall failed"),
                }
            } else if self.health.should_auto_disable(&id) && ext.state == ExtensionState::Enabled
            {
                match self.disable(&id).await {
                    Ok(_) => {
                        info!(id = %id, "Health sweep disabled extension");
                        actions.push(Remediation::Disabled(id));
                    }
                    Err(e) => warn!(id = %id, error = %e, "Health sweep disable failed"),
                }
            }
        }
        actions
    }

    /// Run [`Self::run_health_sweep`] on the configured interval until shutdown
    pub fn spawn_health_sweep(&self) {
        let manager = self.clone();
        let period = self.config.health_sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let actions = manager.run_health_sweep().await;
                if !actions.is_empty() {
                    info!(count = actions.len(), "Health sweep remediated extensions");
                }
            }
        });
        if let Ok(mut sweep) = self.sweep.lock() {
            if let Some(previous) = sweep.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the health sweep and unload every running extension
    pub async fn shutdown(&self) -> Cleanup {
        if let Ok(mut sweep) = self.sweep.lock() {
            if let Some(handle) = sweep.take() {
                handle.abort();
            }
        }
        let cleanup = self.host.lock().await.unload_all().await;
        info!(warnings = cleanup.warnings.len(), "Extension manager shut down");
        cleanup
    }
}
