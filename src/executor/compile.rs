use thiserror::Error;

use crate::script;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct CompileError {
    pub path: String,
    pub message: String,
}

/// Source-to-source transform applied to every file before it is shipped
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str, path: &str) -> Result<String, CompileError>;
}

/// Validates a script and renders it in canonical form
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptCompiler;

impl Compiler for ScriptCompiler {
    fn compile(&self, source: &str, path: &str) -> Result<String, CompileError> {
        script::parse(source)
            .map(|program| program.to_string())
            .map_err(|err| CompileError {
                path: path.to_string(),
                message: err.to_string(),
            })
    }
}
