//! File readers used to load test sources and their imports

use futures::future::BoxFuture;
use std::io;
use std::path::Path;

use crate::models::SourceFile;

/// Reads source files; `Ok(None)` means the file does not exist
pub trait FileReader: Send + Sync {
    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Option<SourceFile>>>;
}

/// Reads from the local filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct FsReader;

impl FileReader for FsReader {
    fn read_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, io::Result<Option<SourceFile>>> {
        Box::pin(async move {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => Ok(Some(SourceFile::new(path.display().to_string(), content))),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err),
            }
        })
    }
}

#[cfg(test)]
pub use memory::MemoryReader;

#[cfg(test)]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// In-memory reader that counts reads per path
    #[derive(Default)]
    pub struct MemoryReader {
        files: HashMap<PathBuf, String>,
        reads: Mutex<HashMap<PathBuf, usize>>,
    }

    impl MemoryReader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_file(mut self, path: &str, content: &str) -> Self {
            self.files.insert(PathBuf::from(path), content.to_string());
            self
        }

        pub fn reads(&self, path: &str) -> usize {
            self.reads
                .lock()
                .unwrap()
                .get(Path::new(path))
                .copied()
                .unwrap_or(0)
        }
    }

    impl FileReader for MemoryReader {
        fn read_file<'a>(
            &'a self,
            path: &'a Path,
        ) -> BoxFuture<'a, io::Result<Option<SourceFile>>> {
            Box::pin(async move {
                *self
                    .reads
                    .lock()
                    .unwrap()
                    .entry(path.to_path_buf())
                    .or_default() += 1;
                Ok(self
                    .files
                    .get(path)
                    .map(|content| SourceFile::new(path.display().to_string(), content.clone())))
            })
        }
    }
}
