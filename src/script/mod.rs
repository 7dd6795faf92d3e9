//! Test script syntax
//!
//! Test files are a flat sequence of call statements with literal
//! arguments, e.g.
//!
//! ```text
//! require("./login");
//! emit("started");
//! emit_after(100, "finished");
//! ```
//!
//! The same tree serves the compiler (canonical rendering), the dependency
//! graph builder (import discovery) and the sandbox (execution).

mod parser;

pub use parser::{parse, ParseError};

use std::fmt;

/// A parsed test script
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub statements: Vec<Call>,
}

/// One call statement, `callee(args...)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub callee: String,
    pub args: Vec<Literal>,
    pub line: usize,
    pub column: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    Str(String),
    Int(i64),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(value) => Some(value),
            Literal::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Literal::Int(value) => Some(*value),
            Literal::Str(_) => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(value) => write!(f, "{value}"),
            Literal::Str(value) => {
                f.write_str("\"")?;
                for ch in value.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.callee)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(");")
    }
}

/// Canonical form: one statement per line, comments dropped
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for call in &self.statements {
            writeln!(f, "{call}")?;
        }
        Ok(())
    }
}

impl Program {
    /// Walk every call expression in source order
    pub fn visit_calls<'a>(&'a self, mut visitor: impl FnMut(&'a Call)) {
        for call in &self.statements {
            visitor(call);
        }
    }

    /// Import requests: calls to `callee` with a single string literal argument
    pub fn import_requests(&self, callee: &str) -> Vec<&str> {
        let mut requests = Vec::new();
        self.visit_calls(|call| {
            if call.callee == callee {
                if let [Literal::Str(request)] = call.args.as_slice() {
                    requests.push(request.as_str());
                }
            }
        });
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_rendering() {
        let program = parse("log(\"a\\\"b\")   # trailing\nsleep(10)").unwrap();
        assert_eq!(program.to_string(), "log(\"a\\\"b\");\nsleep(10);\n");

        // rendering is stable
        let reparsed = parse(&program.to_string()).unwrap();
        assert_eq!(reparsed.to_string(), program.to_string());
    }

    #[test]
    fn test_import_requests() {
        let program = parse(
            r#"
            require("./a");
            require("./b", "extra");
            require(42);
            load("./c");
            require("vendor-pkg");
            "#,
        )
        .unwrap();

        assert_eq!(program.import_requests("require"), vec!["./a", "vendor-pkg"]);
        assert_eq!(program.import_requests("load"), vec!["./c"]);
    }
}
