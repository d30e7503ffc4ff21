//! Lifecycle notifications delivered to the surrounding shell.
//!
//! Every state transition performed by the manager publishes exactly one
//! [`ExtensionEvent`] carrying the entry as it looks after the transition.

use crate::installed::{ExtensionState, InstalledExtension};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per subscriber before lagging receivers drop old ones
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ExtensionEvent {
    Installing(InstalledExtension),
    Installed(InstalledExtension),
    Enabling(InstalledExtension),
    Enabled(InstalledExtension),
    Disabling(InstalledExtension),
    Disabled(InstalledExtension),
    Uninstalling(InstalledExtension),
    Uninstalled(InstalledExtension),
    Error {
        extension: InstalledExtension,
        error: String,
    },
}

impl ExtensionEvent {
    /// Event for an entry that has just entered its current state
    pub fn for_state(extension: &InstalledExtension) -> Self {
        let ext = extension.clone();
        match extension.state {
            ExtensionState::Installing => Self::Installing(ext),
            ExtensionState::Installed => Self::Installed(ext),
            ExtensionState::Enabling => Self::Enabling(ext),
            ExtensionState::Enabled => Self::Enabled(ext),
            ExtensionState::Disabling => Self::Disabling(ext),
            ExtensionState::Disabled => Self::Disabled(ext),
            ExtensionState::Uninstalling => Self::Uninstalling(ext),
            ExtensionState::Error => Self::Error {
                error: extension.error.clone().unwrap_or_default(),
                extension: ext,
            },
        }
    }

    /// Channel name, e.g. `extension:enabled`
    pub fn name(&self) -> &'static str {
        match self {
            Self::Installing(_) => "extension:installing",
            Self::Installed(_) => "extension:installed",
            Self::Enabling(_) => "extension:enabling",
            Self::Enabled(_) => "extension:enabled",
            Self::Disabling(_) => "extension:disabling",
            Self::Disabled(_) => "extension:disabled",
            Self::Uninstalling(_) => "extension:uninstalling",
            Self::Uninstalled(_) => "extension:uninstalled",
            Self::Error { .. } => "extension:error",
        }
    }

    pub fn extension(&self) -> &InstalledExtension {
        match self {
            Self::Installing(ext)
            | Self::Installed(ext)
            | Self::Enabling(ext)
            | Self::Enabled(ext)
            | Self::Disabling(ext)
            | Self::Disabled(ext)
            | Self::Uninstalling(ext)
            | Self::Uninstalled(ext) => ext,
            Self::Error { extension, .. } => extension,
        }
    }
}

/// Fan-out channel for [`ExtensionEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExtensionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtensionEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers; events without subscribers are dropped
    pub fn emit(&self, event: ExtensionEvent) {
        debug!(event = event.name(), id = %event.extension().id, "Extension event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
