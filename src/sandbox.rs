//! Sandbox runtime seam.
//!
//! Extension code runs in an isolated execution context provided by the
//! embedding shell. The host only needs a small surface from it: initialize,
//! activate with an event, deactivate, dispose, resolve webview HTML and
//! forward webview messages. Lifecycle notifications flow back through
//! listeners registered with [`Sandbox::on_event`].
//!
//! [`SandboxHandle`] wraps a sandbox for one loaded instance and keeps the
//! activation matcher in step with what the sandbox reports.

use crate::activation::{ActivationMatcher, ActivationState};
use crate::manifest::ExtensionManifest;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Notification emitted by a sandbox
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    Activated,
    Deactivated,
    Error(String),
}

pub type SandboxListener = Arc<dyn Fn(&SandboxEvent) + Send + Sync>;

/// Errors raised by a sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox initialization failed: {0}")]
    Initialization(String),

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("No webview view named {0}")]
    UnknownView(String),

    #[error("Sandbox is not activated")]
    NotActivated,

    #[error("Sandbox has been disposed")]
    Disposed,

    #[error("Sandbox runtime error: {0}")]
    Runtime(String),
}

/// Isolated execution context for one extension instance
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn initialize(&mut self) -> Result<(), SandboxError>;

    /// Run the extension's activation entry point for `event`
    async fn activate(&mut self, event: &str) -> Result<(), SandboxError>;

    async fn deactivate(&mut self) -> Result<(), SandboxError>;

    /// Release the context; the sandbox is unusable afterwards
    async fn dispose(&mut self) -> Result<(), SandboxError>;

    /// The sandbox's own view of whether activation has completed
    fn is_activated(&self) -> bool;

    /// HTML for a webview view contributed by the extension
    async fn resolve_webview(&mut self, view_id: &str) -> Result<String, SandboxError>;

    /// Deliver a message posted by one of the extension's webviews
    async fn post_message(&mut self, message: Value) -> Result<(), SandboxError>;

    fn on_event(&mut self, listener: SandboxListener);
}

/// Creates sandboxes for extensions that ship code
pub trait SandboxFactory: Send + Sync {
    fn create(
        &self,
        manifest: &ExtensionManifest,
        path: &Path,
    ) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// A sandbox owned by one loaded instance.
///
/// Events are forwarded to the matcher only while the handle is attached, so a
/// detached instance being torn down during a reload cannot overwrite the
/// state of the instance that replaced it.
pub struct SandboxHandle {
    id: String,
    sandbox: Box<dyn Sandbox>,
    attached: Arc<AtomicBool>,
    disposed: bool,
}

impl SandboxHandle {
    /// Wire listeners and initialize. The handle starts detached.
    pub async fn start(
        id: &str,
        mut sandbox: Box<dyn Sandbox>,
        matcher: Arc<dyn ActivationMatcher>,
    ) -> Result<Self, SandboxError> {
        let attached = Arc::new(AtomicBool::new(false));
        let listener_id = id.to_string();
        let listener_attached = attached.clone();
        sandbox.on_event(Arc::new(move |event| {
            if !listener_attached.load(Ordering::SeqCst) {
                return;
            }
            match event {
                SandboxEvent::Activated => {
                    matcher.mark(&listener_id, ActivationState::Activated);
                }
                SandboxEvent::Deactivated => {
                    matcher.mark(&listener_id, ActivationState::Deactivated);
                }
                SandboxEvent::Error(message) => {
                    warn!(id = %listener_id, error = %message, "Extension runtime error");
                    matcher.mark(&listener_id, ActivationState::Failed);
                }
            }
        }));

        sandbox.initialize().await?;
        debug!(id = %id, "Sandbox initialized");
        Ok(Self {
            id: id.to_string(),
            sandbox,
            attached,
            disposed: false,
        })
    }

    pub fn attach(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_activated(&self) -> bool {
        !self.disposed && self.sandbox.is_activated()
    }

    pub async fn activate(&mut self, event: &str) -> Result<(), SandboxError> {
        if self.disposed {
            return Err(SandboxError::Disposed);
        }
        debug!(id = %self.id, event = %event, "Activating sandbox");
        self.sandbox.activate(event).await
    }

    pub async fn resolve_webview(&mut self, view_id: &str) -> Result<String, SandboxError> {
        if self.disposed {
            return Err(SandboxError::Disposed);
        }
        self.sandbox.resolve_webview(view_id).await
    }

    pub async fn post_message(&mut self, message: Value) -> Result<(), SandboxError> {
        if self.disposed {
            return Err(SandboxError::Disposed);
        }
        self.sandbox.post_message(message).await
    }

    /// Deactivate if needed, then dispose. Safe to call twice.
    pub async fn dispose(&mut self) -> Result<(), SandboxError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        let deactivated = if self.sandbox.is_activated() {
            self.sandbox.deactivate().await
        } else {
            Ok(())
        };
        let disposed = self.sandbox.dispose().await;
        deactivated.and(disposed)
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Sandbox that runs no code: activation is bookkeeping only and webviews get
/// a placeholder page. Used by the CLI, which has no script runtime.
pub struct InertSandbox {
    id: String,
    entry_point: Option<PathBuf>,
    webview_views: Vec<String>,
    activated: bool,
    disposed: bool,
    listeners: Vec<SandboxListener>,
}

impl InertSandbox {
    pub fn new(manifest: &ExtensionManifest, path: &Path) -> Self {
        Self {
            id: manifest.id(),
            entry_point: manifest.entry_point().map(|e| path.join(e)),
            webview_views: manifest
                .webview_views()
                .map(|(_, view)| view.id.clone())
                .collect(),
            activated: false,
            disposed: false,
            listeners: Vec::new(),
        }
    }

    fn emit(&self, event: SandboxEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }

    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.disposed {
            Err(SandboxError::Disposed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Sandbox for InertSandbox {
    async fn initialize(&mut self) -> Result<(), SandboxError> {
        self.ensure_live()?;
        debug!(id = %self.id, entry = ?self.entry_point, "Inert sandbox ready");
        Ok(())
    }

    async fn activate(&mut self, event: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        if !self.activated {
            debug!(id = %self.id, event = %event, "Inert activation");
            self.activated = true;
            self.emit(SandboxEvent::Activated);
        }
        Ok(())
    }

    async fn deactivate(&mut self) -> Result<(), SandboxError> {
        if self.activated {
            self.activated = false;
            self.emit(SandboxEvent::Deactivated);
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), SandboxError> {
        self.disposed = true;
        self.listeners.clear();
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.activated
    }

    async fn resolve_webview(&mut self, view_id: &str) -> Result<String, SandboxError> {
        self.ensure_live()?;
        if !self.webview_views.iter().any(|v| v == view_id) {
            return Err(SandboxError::UnknownView(view_id.to_string()));
        }
        Ok(format!(
            "<!DOCTYPE html><html><body><p>{} is provided by {}</p></body></html>",
            view_id, self.id
        ))
    }

    async fn post_message(&mut self, message: Value) -> Result<(), SandboxError> {
        self.ensure_live()?;
        if !self.activated {
            return Err(SandboxError::NotActivated);
        }
        debug!(id = %self.id, message = %message, "Dropping webview message");
        Ok(())
    }

    fn on_event(&mut self, listener: SandboxListener) {
        self.listeners.push(listener);
    }
}

/// [`SandboxFactory`] producing [`InertSandbox`]es
#[derive(Debug, Clone, Default)]
pub struct InertSandboxFactory;

impl SandboxFactory for InertSandboxFactory {
    fn create(
        &self,
        manifest: &ExtensionManifest,
        path: &Path,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        Ok(Box::new(InertSandbox::new(manifest, path)))
    }
}
