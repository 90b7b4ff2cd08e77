//! Per-scenario workspace store.
//!
//! Layout: `<root>/<vars_dir>/`, `<root>/<classes_dir>/` and
//! `<root>/<resources_dir>/`, each holding files addressed by a relative path.
//! Variables and classes are addressed by `<symbol>.<extension>`.
//!
//! A root has a single writer; callers serialise staging for a given root.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::WorkspaceLayout;
use crate::error::{Result, ShlibError};
use crate::obs;

/// The three source roots of a workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SourceSet {
    Variables,
    Classes,
    Resources,
}

impl SourceSet {
    pub const ALL: [SourceSet; 3] = [
        SourceSet::Variables,
        SourceSet::Classes,
        SourceSet::Resources,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SourceSet::Variables => "variables",
            SourceSet::Classes => "classes",
            SourceSet::Resources => "resources",
        }
    }
}

/// A staged file: path relative to its source set, plus text content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub content: String,
}

enum Backing {
    Temp(TempDir),
    Fixed(PathBuf),
}

/// Isolated directory tree for one scenario.
pub struct WorkspaceRoot {
    backing: Backing,
    layout: WorkspaceLayout,
}

impl std::fmt::Debug for WorkspaceRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRoot")
            .field("path", &self.path())
            .field("temporary", &matches!(self.backing, Backing::Temp(_)))
            .finish()
    }
}

impl WorkspaceRoot {
    /// Create a fresh temporary workspace with empty source directories.
    /// The directory is removed when the root is dropped.
    pub fn create(layout: &WorkspaceLayout) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("shlib-ws-")
            .tempdir()
            .map_err(|e| ShlibError::io(std::env::temp_dir(), e))?;
        let root = Self {
            backing: Backing::Temp(dir),
            layout: layout.clone(),
        };
        root.ensure_dirs()?;
        Ok(root)
    }

    /// Attach to an existing directory. The store never deletes it.
    ///
    /// The directory is not required to exist yet; staging creates it and a
    /// rebuild against a missing root reports a scan error.
    pub fn open(path: impl Into<PathBuf>, layout: &WorkspaceLayout) -> Self {
        Self {
            backing: Backing::Fixed(path.into()),
            layout: layout.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        match &self.backing {
            Backing::Temp(dir) => dir.path(),
            Backing::Fixed(path) => path,
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    /// Directory backing a source set.
    pub fn dir(&self, set: SourceSet) -> PathBuf {
        let name = match set {
            SourceSet::Variables => &self.layout.vars_dir,
            SourceSet::Classes => &self.layout.classes_dir,
            SourceSet::Resources => &self.layout.resources_dir,
        };
        self.path().join(name)
    }

    /// Relative path of the source file for a symbol.
    pub fn symbol_path(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("{name}.{}", self.layout.extension))
    }

    /// Write `content` at `relative` inside `set`, creating parent
    /// directories and replacing any existing file.
    pub fn stage(&self, set: SourceSet, relative: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
        let relative = relative.as_ref();
        let target = self.resolve_inside(set, relative)?;

        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir(set));
        fs::create_dir_all(&parent).map_err(|e| ShlibError::io(&parent, e))?;

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| ShlibError::io(&parent, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| ShlibError::io(&target, e))?;
        tmp.persist(&target)
            .map_err(|e| ShlibError::io(&target, e.error))?;

        obs::emit_source_staged(set.name(), &relative.to_string_lossy(), content.len());
        Ok(target)
    }

    /// Stage a symbol's source as `<name>.<ext>` under the variables or
    /// classes directory.
    pub fn stage_symbol(&self, set: SourceSet, name: &str, source: &str) -> Result<PathBuf> {
        let relative = self.symbol_path(name);
        self.stage(set, relative, source)
    }

    /// Remove every staged file and recreate the empty source directories.
    pub fn clear(&self) -> Result<()> {
        for set in SourceSet::ALL {
            let dir = self.dir(set);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ShlibError::io(&dir, e)),
            }
        }
        self.ensure_dirs()?;
        debug!(root = %self.path().display(), "workspace cleared");
        Ok(())
    }

    /// Staged files of `set`, ordered by relative path.
    pub fn files(&self, set: SourceSet) -> Result<Vec<SourceFile>> {
        let dir = self.dir(set);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());
                ShlibError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let content =
                fs::read_to_string(entry.path()).map_err(|e| ShlibError::io(entry.path(), e))?;
            let path = entry
                .path()
                .strip_prefix(&dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| entry.path().to_path_buf());
            files.push(SourceFile { path, content });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Delete the workspace now, surfacing I/O errors that a drop would hide.
    pub fn destroy(self) -> Result<()> {
        match self.backing {
            Backing::Temp(dir) => {
                let path = dir.path().to_path_buf();
                dir.close().map_err(|e| ShlibError::io(path, e))
            }
            Backing::Fixed(_) => Ok(()),
        }
    }

    /// Keep the workspace on disk and return its location.
    pub fn persist(self) -> PathBuf {
        match self.backing {
            Backing::Temp(dir) => dir.keep(),
            Backing::Fixed(path) => path,
        }
    }

    fn ensure_dirs(&self) -> Result<()> {
        for set in SourceSet::ALL {
            let dir = self.dir(set);
            fs::create_dir_all(&dir).map_err(|e| ShlibError::io(&dir, e))?;
        }
        Ok(())
    }

    fn resolve_inside(&self, set: SourceSet, relative: &Path) -> Result<PathBuf> {
        let escapes = relative.as_os_str().is_empty()
            || relative.components().any(|c| {
                !matches!(c, Component::Normal(_) | Component::CurDir)
            })
            || relative.components().all(|c| matches!(c, Component::CurDir));
        if escapes {
            return Err(ShlibError::io(
                relative,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path must be relative and stay inside the workspace root",
                ),
            ));
        }
        Ok(self.dir(set).join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn make_root() -> WorkspaceRoot {
        WorkspaceRoot::create(&WorkspaceLayout::default()).unwrap()
    }

    #[test]
    fn test_create_makes_source_dirs() {
        let root = make_root();
        for set in SourceSet::ALL {
            assert!(root.dir(set).is_dir(), "{} dir missing", set.name());
        }
    }

    #[test]
    fn test_stage_creates_parents_and_overwrites() {
        let root = make_root();
        let path = root
            .stage(SourceSet::Resources, "org/acme/banner.txt", "v1")
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "v1");

        root.stage(SourceSet::Resources, "org/acme/banner.txt", "v2")
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "v2");

        let files = root.files(SourceSet::Resources).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, PathBuf::from("org/acme/banner.txt"));
    }

    #[test]
    fn test_stage_rejects_escaping_paths() {
        let root = make_root();
        for bad in ["../evil.lib", "/etc/passwd", "", "a/../../b", "."] {
            let err = root.stage(SourceSet::Variables, bad, "x").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IoFailure, "path {bad:?}");
        }
        assert!(root.files(SourceSet::Variables).unwrap().is_empty());
    }

    #[test]
    fn test_stage_symbol_uses_extension() {
        let root = make_root();
        let path = root
            .stage_symbol(SourceSet::Variables, "acme", "field name")
            .unwrap();
        assert_eq!(path, root.dir(SourceSet::Variables).join("acme.lib"));
    }

    #[test]
    fn test_files_are_ordered_and_recursive() {
        let root = make_root();
        root.stage(SourceSet::Classes, "b.lib", "").unwrap();
        root.stage(SourceSet::Classes, "a/z.lib", "").unwrap();
        root.stage(SourceSet::Classes, "a.lib", "").unwrap();
        let paths: Vec<_> = root
            .files(SourceSet::Classes)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("a.lib"),
                PathBuf::from("a/z.lib"),
                PathBuf::from("b.lib")
            ]
        );
    }

    #[test]
    fn test_clear_is_idempotent() {
        let root = make_root();
        root.stage_symbol(SourceSet::Variables, "acme", "").unwrap();
        root.stage(SourceSet::Resources, "r.txt", "").unwrap();
        root.clear().unwrap();
        root.clear().unwrap();
        for set in SourceSet::ALL {
            assert!(root.files(set).unwrap().is_empty());
            assert!(root.dir(set).is_dir());
        }
    }

    #[test]
    fn test_destroy_removes_directory() {
        let root = make_root();
        let path = root.path().to_path_buf();
        root.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_persist_keeps_directory() {
        let root = make_root();
        root.stage(SourceSet::Resources, "keep.txt", "kept").unwrap();
        let path = root.persist();
        assert!(path.join("resources/keep.txt").is_file());
        fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_open_missing_directory_reports_absent() {
        let dir = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::open(dir.path().join("nope"), &WorkspaceLayout::default());
        assert!(!root.exists());
        assert!(root.files(SourceSet::Variables).unwrap().is_empty());
    }
}
