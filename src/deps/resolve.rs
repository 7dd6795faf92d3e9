//! Module request resolution
//!
//! Resolution is purely lexical: relative requests are joined onto the
//! importing file's directory and normalized without touching the disk.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Name under which test code imports the host framework itself
pub const FRAMEWORK_ALIAS: &str = "testrig";

/// Where a request points to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// A local file that gets bundled
    Local(PathBuf),
    /// A package-managed module or the framework itself, never bundled
    External,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveOptions {
    /// Extension appended to extensionless requests
    pub extension: String,
    /// Directory names holding package-managed modules
    pub package_dirs: Vec<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            extension: "tst".to_string(),
            package_dirs: vec!["vendor".to_string()],
        }
    }
}

impl ResolveOptions {
    /// Resolve `request` as imported from the file at `importer`
    pub fn resolve(&self, request: &str, importer: &Path) -> Resolution {
        if is_framework_request(request) || !is_path_request(request) {
            return Resolution::External;
        }

        let base = importer.parent().unwrap_or_else(|| Path::new("/"));
        let mut resolved = normalize(&base.join(request));
        if resolved.extension().is_none() {
            resolved.set_extension(&self.extension);
        }

        if self.is_package_path(&resolved) {
            Resolution::External
        } else {
            Resolution::Local(resolved)
        }
    }

    fn is_package_path(&self, path: &Path) -> bool {
        path.components().any(|component| match component {
            Component::Normal(name) => self
                .package_dirs
                .iter()
                .any(|dir| name.to_str() == Some(dir.as_str())),
            _ => false,
        })
    }
}

/// `testrig` or `testrig/...`
pub fn is_framework_request(request: &str) -> bool {
    request == FRAMEWORK_ALIAS
        || request
            .strip_prefix(FRAMEWORK_ALIAS)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn is_path_request(request: &str) -> bool {
    request.starts_with("./") || request.starts_with("../") || request.starts_with('/')
}

/// Collapse `.` and `..` components lexically
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(path: &str) -> Resolution {
        Resolution::Local(PathBuf::from(path))
    }

    #[test]
    fn test_relative_requests() {
        let options = ResolveOptions::default();
        let importer = Path::new("/project/tests/login.tst");

        assert_eq!(
            options.resolve("./helpers", importer),
            local("/project/tests/helpers.tst")
        );
        assert_eq!(
            options.resolve("../shared/page.tst", importer),
            local("/project/shared/page.tst")
        );
        assert_eq!(
            options.resolve("./data/users.json", importer),
            local("/project/tests/data/users.json")
        );
        assert_eq!(options.resolve("/abs/mod", importer), local("/abs/mod.tst"));
    }

    #[test]
    fn test_external_requests() {
        let options = ResolveOptions::default();
        let importer = Path::new("/project/tests/login.tst");

        assert_eq!(options.resolve("left-pad", importer), Resolution::External);
        assert_eq!(options.resolve("testrig", importer), Resolution::External);
        assert_eq!(options.resolve("testrig/api", importer), Resolution::External);
        assert_eq!(
            options.resolve("../vendor/assert/index", importer),
            Resolution::External
        );
    }

    #[test]
    fn test_framework_request() {
        assert!(is_framework_request("testrig"));
        assert!(is_framework_request("testrig/browser"));
        assert!(!is_framework_request("testrigger"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/a/b/./c/../d")),
            PathBuf::from("/a/b/d")
        );
    }
}
