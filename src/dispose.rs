//! Scoped cleanup for resources acquired while loading an extension.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

type DisposeFn = Box<dyn FnOnce() -> Result<(), String> + Send + Sync>;

/// A cleanup action that runs at most once
pub struct Disposable {
    label: String,
    action: Option<DisposeFn>,
}

impl Disposable {
    pub fn new(
        label: impl Into<String>,
        action: impl FnOnce() -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            action: Some(Box::new(action)),
        }
    }

    /// A disposable with nothing to release
    pub fn noop(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the action; later calls do nothing
    pub fn dispose(&mut self) -> Result<(), String> {
        match self.action.take() {
            Some(action) => action(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("label", &self.label)
            .field("pending", &self.action.is_some())
            .finish()
    }
}

/// Outcome of a best-effort teardown: it always completes, failures become warnings
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Cleanup {
    pub warnings: Vec<String>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn merge(&mut self, other: Cleanup) {
        self.warnings.extend(other.warnings);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Dispose each item in order; a failure or panic never stops the ones after it
pub fn dispose_all(disposables: &mut Vec<Disposable>) -> Cleanup {
    let mut cleanup = Cleanup::new();
    for mut disposable in disposables.drain(..) {
        match panic::catch_unwind(AssertUnwindSafe(|| disposable.dispose())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => cleanup.warn(format!("{}: {}", disposable.label(), e)),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                cleanup.warn(format!("{}: panicked: {}", disposable.label(), message));
            }
        }
    }
    cleanup
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_dispose_runs_once() {
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let mut d = Disposable::new("counter", move || {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        d.dispose().unwrap();
        d.dispose().unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_dispose_all_continues_after_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut items = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            items.push(Disposable::new(format!("item-{}", i), move || {
                order.lock().unwrap().push(i);
                if i == 1 {
                    Err("broken".to_string())
                } else {
                    Ok(())
                }
            }));
        }

        let cleanup = dispose_all(&mut items);
        assert!(items.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(cleanup.warnings, vec!["item-1: broken".to_string()]);
        assert!(!cleanup.is_clean());
    }

    #[test]
    fn test_dispose_all_survives_panic() {
        let released = Arc::new(Mutex::new(false));
        let flag = released.clone();
        let mut items = vec![
            Disposable::new("grammar", || panic!("grammar registry gone")),
            Disposable::new("theme", move || {
                *flag.lock().unwrap() = true;
                Ok(())
            }),
        ];

        let cleanup = dispose_all(&mut items);
        assert!(items.is_empty());
        assert!(*released.lock().unwrap());
        assert_eq!(
            cleanup.warnings,
            vec!["grammar: panicked: grammar registry gone".to_string()]
        );
    }

    #[test]
    fn test_noop_disposable() {
        let mut d = Disposable::noop("nothing");
        assert!(d.dispose().is_ok());
    }

    #[test]
    fn test_cleanup_merge() {
        let mut a = Cleanup::new();
        a.warn("one");
        let mut b = Cleanup::new();
        b.warn("two");
        a.merge(b);
        assert_eq!(a.warnings, vec!["one", "two"]);
    }
}
