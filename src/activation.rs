//! Activation event matching.
//!
//! Extensions declare the events that should wake them (`onLanguage:rust`,
//! `onCommand:acme.*`, `*`). The matcher keeps the table of patterns per
//! extension along with the activation state reported by the sandbox.

use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Activation progress of a registered extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Activating,
    Activated,
    Failed,
    Deactivated,
}

/// Table of extension id to activation patterns
pub trait ActivationMatcher: Send + Sync {
    /// Register (or replace) the patterns of `id`
    fn register(&self, id: &str, events: &[String]);
    fn unregister(&self, id: &str);
    fn should_activate(&self, id: &str, event: &str) -> bool;
    /// Registered ids interested in `event`, sorted
    fn extensions_for(&self, event: &str) -> Vec<String>;
    fn mark(&self, id: &str, state: ActivationState);
    fn state(&self, id: &str) -> Option<ActivationState>;
}

/// Compile a glob-like activation pattern; `*` matches any run of characters
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern.trim()).replace("\\*", ".*");
    Regex::new(&format!("^{}$", escaped))
}

struct Registration {
    patterns: Vec<Regex>,
    state: Option<ActivationState>,
}

impl Registration {
    fn matches(&self, event: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(event))
    }
}

/// [`ActivationMatcher`] backed by compiled glob patterns
#[derive(Default)]
pub struct PatternActivationMatcher {
    registrations: Mutex<HashMap<String, Registration>>,
}

impl PatternActivationMatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivationMatcher for PatternActivationMatcher {
    fn register(&self, id: &str, events: &[String]) {
        let patterns = events
            .iter()
            .filter_map(|event| match compile_pattern(event) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(id = %id, event = %event, error = %e, "Invalid activation event pattern");
                    None
                }
            })
            .collect();
        if let Ok(mut registrations) = self.registrations.lock() {
            registrations.insert(
                id.to_string(),
                Registration {
                    patterns,
                    state: None,
                },
            );
        }
    }

    fn unregister(&self, id: &str) {
        if let Ok(mut registrations) = self.registrations.lock() {
            registrations.remove(id);
        }
    }

    fn should_activate(&self, id: &str, event: &str) -> bool {
        if let Ok(registrations) = self.registrations.lock() {
            return registrations
                .get(id)
                .map(|r| r.matches(event))
                .unwrap_or(false);
        }
        false
    }

    fn extensions_for(&self, event: &str) -> Vec<String> {
        let mut ids: Vec<String> = match self.registrations.lock() {
            Ok(registrations) => registrations
                .iter()
                .filter(|(_, r)| r.matches(event))
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    fn mark(&self, id: &str, state: ActivationState) {
        if let Ok(mut registrations) = self.registrations.lock() {
            if let Some(registration) = registrations.get_mut(id) {
                registration.state = Some(state);
            }
        }
    }

    fn state(&self, id: &str) -> Option<ActivationState> {
        self.registrations
            .lock()
            .ok()
            .and_then(|r| r.get(id).and_then(|r| r.state))
    }
}
