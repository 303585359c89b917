//! External interfaces for tool execution and file delivery.
//!
//! Both the shell sandbox and the file writer are traits owned by the
//! embedding application in production; this crate ships local,
//! non-sandboxed reference implementations for tests and the demo binary.

pub mod adapter;
pub mod file_writer;

pub use adapter::{
    truncate_output, LocalToolAdapter, ShellResult, ToolAdapter, DEFAULT_MAX_SHELL_RESPONSE_CHARS,
    DEFAULT_SHELL_TIMEOUT,
};
pub use file_writer::{FileWriteError, FileWriter, LocalFileWriter};
