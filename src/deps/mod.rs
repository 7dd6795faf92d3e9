//! Static dependency graph builder
//!
//! Turns one entry file into a self-contained [`DependencyDictionary`]
//! describing every local file it transitively imports, so that a worker can
//! resolve imports without disk access.
//!
//! Nodes live in an arena indexed by position. A node is inserted into the
//! path cache *before* its own imports are visited, which is what makes
//! diamond and circular imports collapse onto a single node.

mod reader;
mod resolve;

pub use reader::{FileReader, FsReader};
pub use resolve::{is_framework_request, Resolution, ResolveOptions};

#[cfg(test)]
pub use reader::MemoryReader;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::models::SourceFile;
use crate::script::{self, ParseError};

/// One direct import as seen from the importing file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEntry {
    pub path: String,
    pub content: String,
}

/// absolute path -> (request -> direct import)
pub type DependencyDictionary = BTreeMap<String, BTreeMap<String, DependencyEntry>>;

/// Dependency graph build errors; any of them aborts the whole build
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot find module '{request}' imported from {importer} (resolved to {path})")]
    NotFound {
        request: String,
        importer: String,
        path: String,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ParseError,
    },
}

/// Callee marking an import unless configured otherwise
pub const DEFAULT_IMPORT_CALLEE: &str = "require";

/// Options for [`build_dependency_dictionary`]
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Callee name that marks an import call
    pub import_callee: String,
    pub resolve: ResolveOptions,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            import_callee: DEFAULT_IMPORT_CALLEE.to_string(),
            resolve: ResolveOptions::default(),
        }
    }
}

#[derive(Debug)]
struct DependencyNode {
    path: String,
    content: String,
    /// `None` until the node's own imports have been visited
    children: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Default)]
struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    cache: HashMap<String, usize>,
}

impl DependencyGraph {
    fn insert(&mut self, path: String, content: String) -> usize {
        let index = self.nodes.len();
        self.cache.insert(path.clone(), index);
        self.nodes.push(DependencyNode {
            path,
            content,
            children: None,
        });
        index
    }

    fn flatten(&self) -> DependencyDictionary {
        self.nodes
            .iter()
            .map(|node| {
                let imports = node
                    .children
                    .iter()
                    .flatten()
                    .map(|(request, &child)| {
                        let child = &self.nodes[child];
                        (
                            request.clone(),
                            DependencyEntry {
                                path: child.path.clone(),
                                content: child.content.clone(),
                            },
                        )
                    })
                    .collect();
                (node.path.clone(), imports)
            })
            .collect()
    }
}

/// Build the dependency dictionary of `file`, reading imports through `reader`
pub async fn build_dependency_dictionary(
    file: &SourceFile,
    reader: &dyn FileReader,
    options: &BuildOptions,
) -> Result<DependencyDictionary, BuildError> {
    let mut graph = DependencyGraph::default();
    let mut pending = vec![graph.insert(file.path.clone(), file.content.clone())];

    while let Some(index) = pending.pop() {
        let importer = graph.nodes[index].path.clone();
        let program =
            script::parse(&graph.nodes[index].content).map_err(|source| BuildError::Parse {
                path: importer.clone(),
                source,
            })?;

        let mut children = BTreeMap::new();
        for request in program.import_requests(&options.import_callee) {
            let path = match options.resolve.resolve(request, Path::new(&importer)) {
                Resolution::Local(path) => path,
                Resolution::External => {
                    debug!(request, importer = %importer, "skipping external module");
                    continue;
                }
            };

            let key = path.display().to_string();
            let child = match graph.cache.get(&key) {
                Some(&existing) => existing,
                None => {
                    let source = reader
                        .read_file(&path)
                        .await
                        .map_err(|source| BuildError::Read {
                            path: key.clone(),
                            source,
                        })?
                        .ok_or_else(|| BuildError::NotFound {
                            request: request.to_string(),
                            importer: importer.clone(),
                            path: key.clone(),
                        })?;

                    let child = graph.insert(key, source.content);
                    pending.push(child);
                    child
                }
            };
            children.insert(request.to_string(), child);
        }

        graph.nodes[index].children = Some(children);
    }

    debug!(
        entry = %file.path,
        modules = graph.nodes.len(),
        "built dependency dictionary"
    );
    Ok(graph.flatten())
}

/// Shallow right-biased union of two dictionaries
pub fn merge_dependency_dictionaries(
    mut left: DependencyDictionary,
    right: DependencyDictionary,
) -> DependencyDictionary {
    left.extend(right);
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn build(reader: &MemoryReader, path: &str) -> Result<DependencyDictionary, BuildError> {
        let entry = reader
            .read_file(Path::new(path))
            .await
            .unwrap()
            .expect("entry exists");
        build_dependency_dictionary(&entry, reader, &BuildOptions::default()).await
    }

    #[tokio::test]
    async fn test_circular_imports_terminate() {
        let reader = MemoryReader::new()
            .with_file("/p/a.tst", "require(\"./b\"); log(\"a\")")
            .with_file("/p/b.tst", "require(\"./a\"); log(\"b\")");

        let dict = build(&reader, "/p/a.tst").await.unwrap();

        assert_eq!(dict.len(), 2);
        assert_eq!(dict["/p/a.tst"]["./b"].path, "/p/b.tst");
        assert_eq!(dict["/p/b.tst"]["./a"].path, "/p/a.tst");
        assert_eq!(reader.reads("/p/b.tst"), 1);
    }

    #[tokio::test]
    async fn test_shared_import_read_once() {
        let reader = MemoryReader::new()
            .with_file("/p/main.tst", "require(\"./left\"); require(\"./right\")")
            .with_file("/p/left.tst", "require(\"./util\")")
            .with_file("/p/right.tst", "require(\"./util.tst\")")
            .with_file("/p/util.tst", "log(\"util\")");

        let dict = build(&reader, "/p/main.tst").await.unwrap();

        assert_eq!(reader.reads("/p/util.tst"), 1);
        assert_eq!(
            dict["/p/left.tst"]["./util"],
            dict["/p/right.tst"]["./util.tst"]
        );
        assert!(dict["/p/util.tst"].is_empty());
    }

    #[tokio::test]
    async fn test_external_modules_not_bundled() {
        let reader = MemoryReader::new()
            .with_file(
                "/p/main.tst",
                "require(\"assert-lib\"); require(\"./vendor/pkg\"); require(\"testrig/api\")",
            )
            .with_file("/p/vendor/pkg.tst", "require(\"./deeper\")");

        let dict = build(&reader, "/p/main.tst").await.unwrap();

        assert_eq!(dict.len(), 1);
        assert!(dict["/p/main.tst"].is_empty());
        assert_eq!(reader.reads("/p/vendor/pkg.tst"), 0);
    }

    #[tokio::test]
    async fn test_direct_children_only() {
        let reader = MemoryReader::new()
            .with_file("/p/a.tst", "require(\"./b\")")
            .with_file("/p/b.tst", "require(\"./c\")")
            .with_file("/p/c.tst", "log(\"c\")");

        let dict = build(&reader, "/p/a.tst").await.unwrap();

        assert_eq!(dict["/p/a.tst"].len(), 1);
        assert!(dict["/p/a.tst"].contains_key("./b"));
        assert!(dict["/p/b.tst"].contains_key("./c"));
    }

    #[tokio::test]
    async fn test_missing_import_fails_build() {
        let reader = MemoryReader::new()
            .with_file("/p/a.tst", "require(\"./b\")")
            .with_file("/p/b.tst", "require(\"./gone\")");

        let err = build(&reader, "/p/a.tst").await.unwrap_err();
        assert!(matches!(err, BuildError::NotFound { ref path, .. } if path == "/p/gone.tst"));
    }

    #[tokio::test]
    async fn test_parse_error_fails_build() {
        let reader = MemoryReader::new()
            .with_file("/p/a.tst", "require(\"./b\")")
            .with_file("/p/b.tst", "log(");

        let err = build(&reader, "/p/a.tst").await.unwrap_err();
        assert!(matches!(err, BuildError::Parse { ref path, .. } if path == "/p/b.tst"));
    }

    #[test]
    fn test_merge_is_right_biased() {
        let entry = |content: &str| DependencyEntry {
            path: "/p/x.tst".to_string(),
            content: content.to_string(),
        };

        let mut left = DependencyDictionary::new();
        left.insert("/p/a.tst".into(), BTreeMap::from([("./x".into(), entry("old"))]));
        left.insert("/p/only-left.tst".into(), BTreeMap::new());

        let mut right = DependencyDictionary::new();
        right.insert("/p/a.tst".into(), BTreeMap::from([("./x".into(), entry("new"))]));

        let merged = merge_dependency_dictionaries(left, right);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["/p/a.tst"]["./x"].content, "new");
    }
}
