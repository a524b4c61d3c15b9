//! Workspace Builder
//!
//! Materializes a submission's files under a fresh host temp directory. The
//! directory is removed by [`Workspace::teardown`] or, failing that, on drop,
//! so every exit path releases it.

use crate::error::{Result, SandboxError};
use runbox_common::types::{RunFile, RunRequest};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

pub struct Workspace {
    root: PathBuf,
    dir: Option<TempDir>,
}

impl Workspace {
    /// Create a temp root and write every file beneath it, creating parent
    /// directories as needed. All names are checked before anything is written.
    pub fn materialize(files: &[RunFile]) -> Result<Self> {
        let relative: Vec<PathBuf> = files
            .iter()
            .map(|file| resolve_relative(&file.name))
            .collect::<Result<_>>()?;

        let dir = tempfile::Builder::new().prefix("runbox-").tempdir()?;
        let root = dir.path().to_path_buf();

        for (file, rel) in files.iter().zip(&relative) {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, file.content.as_bytes())?;
        }

        debug!(root = %root.display(), files = files.len(), "Workspace materialized");

        Ok(Self { root, dir: Some(dir) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tar the workspace contents under `prefix` for injection into a container.
    pub fn archive(&self, prefix: &str) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.mode(tar::HeaderMode::Deterministic);
        builder.append_dir_all(prefix, &self.root)?;
        Ok(builder.into_inner()?)
    }

    /// Remove the workspace root. Safe to call repeatedly and after the
    /// directory was deleted externally.
    pub fn teardown(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        match dir.close() {
            Ok(()) => {
                debug!(root = %self.root.display(), "Workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Workspace(e)),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// Normalize a submitted file name into a path relative to the workspace
/// root. `..` may only cancel components the name itself introduced.
pub fn resolve_relative(name: &str) -> Result<PathBuf> {
    let invalid = || SandboxError::InvalidPath(name.to_string());

    if name.contains('\0') {
        return Err(invalid());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(invalid());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(invalid());
    }
    Ok(normalized)
}

/// Reject requests that can never run: blank language, no files, or a file
/// name escaping the workspace.
pub fn validate_request(request: &RunRequest) -> Result<()> {
    if request.language.trim().is_empty() {
        return Err(SandboxError::MalformedJob("missing language".to_string()));
    }
    if request.files.is_empty() {
        return Err(SandboxError::MalformedJob("files must not be empty".to_string()));
    }
    for file in &request.files {
        resolve_relative(&file.name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative() {
        assert_eq!(resolve_relative("Main.py").unwrap(), PathBuf::from("Main.py"));
        assert_eq!(resolve_relative("./src/lib.rs").unwrap(), PathBuf::from("src/lib.rs"));
        assert_eq!(resolve_relative("a/../b.txt").unwrap(), PathBuf::from("b.txt"));
    }

    #[test]
    fn test_resolve_relative_rejects_escape() {
        for name in ["../../etc/passwd", "/etc/passwd", "a/../../b", "", ".", "x\0y"] {
            assert!(
                matches!(resolve_relative(name), Err(SandboxError::InvalidPath(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_materialize_nested_files() {
        let files = vec![
            RunFile::new("Main.py", "print('hi')"),
            RunFile::new("pkg/util/helpers.py", "X = 1"),
        ];
        let workspace = Workspace::materialize(&files).unwrap();

        let main = fs::read_to_string(workspace.root().join("Main.py")).unwrap();
        assert_eq!(main, "print('hi')");
        let nested = fs::read_to_string(workspace.root().join("pkg/util/helpers.py")).unwrap();
        assert_eq!(nested, "X = 1");
    }

    #[test]
    fn test_traversal_writes_nothing() {
        let files = vec![
            RunFile::new("ok.txt", "fine"),
            RunFile::new("../../etc/passwd", "root::0:0"),
        ];
        let err = Workspace::materialize(&files).err().unwrap();
        assert!(matches!(err, SandboxError::InvalidPath(name) if name == "../../etc/passwd"));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut workspace = Workspace::materialize(&[RunFile::new("a.txt", "a")]).unwrap();
        let root = workspace.root().to_path_buf();

        workspace.teardown().unwrap();
        assert!(!root.exists());
        workspace.teardown().unwrap();
    }

    #[test]
    fn test_teardown_after_external_removal() {
        let mut workspace = Workspace::materialize(&[RunFile::new("a.txt", "a")]).unwrap();
        fs::remove_dir_all(workspace.root()).unwrap();
        workspace.teardown().unwrap();
    }

    #[test]
    fn test_drop_removes_root() {
        let root = {
            let workspace = Workspace::materialize(&[RunFile::new("a.txt", "a")]).unwrap();
            workspace.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn test_archive_contains_prefixed_files() {
        let workspace = Workspace::materialize(&[RunFile::new("dir/Main.go", "package main")]).unwrap();
        let bytes = workspace.archive("workspace").unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "workspace/dir/Main.go"), "{:?}", names);
    }

    #[test]
    fn test_validate_request() {
        let ok = RunRequest::new("python", vec![RunFile::new("Main.py", "")]);
        assert!(validate_request(&ok).is_ok());

        let no_files = RunRequest::new("python", vec![]);
        assert!(matches!(validate_request(&no_files), Err(SandboxError::MalformedJob(_))));

        let no_language = RunRequest::new(" ", vec![RunFile::new("Main.py", "")]);
        assert!(matches!(validate_request(&no_language), Err(SandboxError::MalformedJob(_))));

        let escaping = RunRequest::new("python", vec![RunFile::new("../x", "")]);
        assert!(matches!(validate_request(&escaping), Err(SandboxError::InvalidPath(_))));
    }
}
