//! Environment compatibility check run before an install starts.
//!
//! Hard issues (engine range not satisfied, wrong target platform) block the
//! install; soft issues are reported as warnings and only logged.

use crate::registry::ExtensionMetadata;
use semver::{Version, VersionReq};

/// Engine key checked against the host API version
const ENGINE_KEY: &str = "vscode";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompatibilityReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CompatibilityReport {
    pub fn is_compatible(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Open VSX platform string for the running process, e.g. `linux-x64`
pub fn current_target_platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "x86" => "ia32",
        other => other,
    };
    format!("{}-{}", os, arch)
}

/// Parse an engine range the way VS Code writes them (`^1.80.0`, `>=1.60.0-insider`)
fn parse_engine_range(range: &str) -> Result<VersionReq, semver::Error> {
    let range = range.trim();
    let range = range.strip_suffix("-insider").unwrap_or(range);
    VersionReq::parse(range)
}

/// Check `metadata` against the host API version and platform
pub fn check(metadata: &ExtensionMetadata, api_version: &str, platform: &str) -> CompatibilityReport {
    let mut report = CompatibilityReport::default();

    match metadata.engines.get(ENGINE_KEY) {
        None => report
            .warnings
            .push("No engine requirement declared".to_string()),
        Some(range) => match (parse_engine_range(range), Version::parse(api_version)) {
            (Ok(req), Ok(version)) => {
                if !req.matches(&version) {
                    report.errors.push(format!(
                        "Requires engine {} {}, host provides {}",
                        ENGINE_KEY, range, api_version
                    ));
                }
            }
            (Err(e), _) => report
                .warnings
                .push(format!("Unparsable engine range '{}': {}", range, e)),
            (_, Err(e)) => report
                .warnings
                .push(format!("Host API version '{}' is invalid: {}", api_version, e)),
        },
    }

    if let Some(target) = metadata.target_platform.as_deref() {
        if target != "universal" && target != "web" && target != platform {
            report.errors.push(format!(
                "Built for platform {}, host is {}",
                target, platform
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(engine: Option<&str>, platform: Option<&str>) -> ExtensionMetadata {
        let mut meta = ExtensionMetadata {
            publisher: "acme".into(),
            name: "lint".into(),
            version: "1.0.0".into(),
            target_platform: platform.map(String::from),
            ..Default::default()
        };
        if let Some(engine) = engine {
            meta.engines.insert("vscode".into(), engine.into());
        }
        meta
    }

    #[test]
    fn test_satisfied_range() {
        let report = check(&metadata(Some("^1.80.0"), None), "1.90.0", "linux-x64");
        assert!(report.is_compatible());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_unsatisfied_range_is_hard_error() {
        let report = check(&metadata(Some("^1.95.0"), None), "1.90.0", "linux-x64");
        assert!(!report.is_compatible());
        assert!(report.errors[0].contains("^1.95.0"));
    }

    #[test]
    fn test_wildcard_range() {
        assert!(check(&metadata(Some("*"), None), "1.90.0", "linux-x64").is_compatible());
    }

    #[test]
    fn test_insider_suffix_accepted() {
        let report = check(&metadata(Some(">=1.60.0-insider"), None), "1.90.0", "linux-x64");
        assert!(report.is_compatible());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_garbage_range_is_warning() {
        let report = check(&metadata(Some("latest please"), None), "1.90.0", "linux-x64");
        assert!(report.is_compatible());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_missing_engine_is_warning() {
        let report = check(&metadata(None, None), "1.90.0", "linux-x64");
        assert!(report.is_compatible());
        assert_eq!(report.warnings, vec!["No engine requirement declared"]);
    }

    #[test]
    fn test_platform_mismatch() {
        let report = check(&metadata(Some("*"), Some("win32-x64")), "1.90.0", "linux-x64");
        assert!(!report.is_compatible());

        for ok in ["universal", "web", "linux-x64"] {
            assert!(check(&metadata(Some("*"), Some(ok)), "1.90.0", "linux-x64").is_compatible());
        }
    }

    #[test]
    fn test_current_platform_shape() {
        let platform = current_target_platform();
        assert!(platform.contains('-'));
        assert!(!platform.starts_with("macos"));
    }
}
