//! File delivery interface: a path that escapes the project root is rejected
//! outright rather than silently clamped; [`LocalFileWriter::write`] returns
//! [`FileWriteError::PathEscapesRoot`] instead.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileWriteError {
    #[error("path escapes project root: {0}")]
    PathEscapesRoot(String),
    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Delivers generated file content to disk (or wherever the embedding
/// application chooses).
pub trait FileWriter: Send + Sync {
    fn write(&self, path: &str, content: &str) -> Result<(), FileWriteError>;
}

/// Some providers emit literal `\n`/`\r\n` escape sequences instead of real
/// newlines when asked to produce file content inline. If the content
/// contains no real newline already, unescape the literal sequences;
/// otherwise leave it untouched (it is presumably already correct).
pub fn unescape_newlines(content: &str) -> String {
    if content.contains('\n') {
        return content.to_string();
    }
    content.replace("\\r\\n", "\n").replace("\\n", "\n")
}

/// Lexically normalizes a path (resolves `.` and `..` components without
/// touching the filesystem, so it works for paths that don't exist yet).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Joins `relative` onto `root` and verifies the normalized result stays
/// within the normalized root.
fn resolve_within_root(root: &Path, relative: &str) -> Result<PathBuf, FileWriteError> {
    let trimmed = relative.trim_start_matches("./").trim_start_matches('/');
    let joined = root.join(trimmed);
    let normalized_root = normalize_lexically(root);
    let normalized_joined = normalize_lexically(&joined);
    if !normalized_joined.starts_with(&normalized_root) {
        return Err(FileWriteError::PathEscapesRoot(relative.to_string()));
    }
    Ok(normalized_joined)
}

/// Reference `FileWriter`: writes under a fixed project root on the local
/// filesystem, creating parent directories as needed.
pub struct LocalFileWriter {
    root: PathBuf,
}

impl LocalFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileWriter for LocalFileWriter {
    fn write(&self, path: &str, content: &str) -> Result<(), FileWriteError> {
        let target = resolve_within_root(&self.root, path)?;
        let unescaped = unescape_newlines(content);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FileWriteError::Io {
                path: path.to_string(),
                source,
            })?;
        }
        std::fs::write(&target, unescaped).map_err(|source| FileWriteError::Io {
            path: path.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalFileWriter::new(dir.path());
        writer.write("notes/out.txt", "hello").unwrap();
        let written = std::fs::read_to_string(dir.path().join("notes/out.txt")).unwrap();
        assert_eq!(written, "hello");
    }

    #[test]
    fn rejects_path_escaping_root() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalFileWriter::new(dir.path());
        let err = writer.write("../../etc/passwd", "x").unwrap_err();
        assert!(matches!(err, FileWriteError::PathEscapesRoot(_)));
    }

    #[test]
    fn rejects_absolute_escape_via_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalFileWriter::new(dir.path());
        let err = writer
            .write("subdir/../../escape.txt", "x")
            .unwrap_err();
        assert!(matches!(err, FileWriteError::PathEscapesRoot(_)));
    }

    #[test]
    fn unescape_newlines_converts_literal_sequences() {
        let input = "line one\\nline two\\r\\nline three";
        let out = unescape_newlines(input);
        assert_eq!(out, "line one\nline two\nline three");
    }

    #[test]
    fn unescape_newlines_leaves_real_newlines_untouched() {
        let input = "line one\nliteral \\n stays";
        let out = unescape_newlines(input);
        assert_eq!(out, input);
    }
}
