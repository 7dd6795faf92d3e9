//! Output formatting module
//!
//! Renders run reports for the terminal or for export.

mod formatter;

pub use formatter::{OutputFormat, ResultFormatter};
