//! Library registry: the catalog of global variables and classes.
//!
//! A rebuild scans a [`WorkspaceRoot`], compiles every variable and class
//! source and publishes a new immutable [`Snapshot`] with a single pointer
//! swap. Readers clone the `Arc` of whichever snapshot is current, so they
//! never observe a partially built catalog. A failed rebuild publishes
//! nothing and the previous snapshot stays active.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::digest::Digest;
use crate::error::{Result, ShlibError};
use crate::metrics::METRICS;
use crate::obs;
use crate::workspace::{SourceSet, WorkspaceRoot};

/// Kind of a library symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// Global variable: one implicit instance per run.
    Variable,
    /// Supporting class: instantiated with `new`.
    Class,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Variable => "variable",
            SymbolKind::Class => "class",
        }
    }
}

/// Opaque compiled form of a definition, produced and interpreted by the
/// compiler that built it.
pub type CompiledHandle = Arc<dyn Any + Send + Sync>;

/// Compile capability the registry delegates to during a rebuild.
pub trait LibraryCompiler: Send + Sync {
    /// Compile one source. The error string becomes the `cause` of a
    /// [`ShlibError::Compile`].
    fn compile(
        &self,
        name: &str,
        kind: SymbolKind,
        source: &str,
    ) -> std::result::Result<CompiledHandle, String>;
}

/// A compiled library symbol.
pub struct LibraryDefinition {
    pub name: String,
    pub kind: SymbolKind,
    /// Workspace-relative source path.
    pub path: PathBuf,
    pub source: String,
    pub digest: Digest,
    pub compiled: CompiledHandle,
}

impl fmt::Debug for LibraryDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// Immutable symbol table produced by one rebuild.
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    digest: Digest,
    built_at: DateTime<Utc>,
    definitions: BTreeMap<String, Arc<LibraryDefinition>>,
    resources: BTreeMap<String, Arc<str>>,
}

impl Snapshot {
    /// The generation-0 snapshot every registry starts with.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            digest: Digest::of_parts(std::iter::empty::<&[u8]>()),
            built_at: Utc::now(),
            definitions: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Digest over every definition and resource. Two rebuilds of identical
    /// workspace contents produce identical digests.
    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn resolve(&self, name: &str) -> Option<&Arc<LibraryDefinition>> {
        self.definitions.get(name)
    }

    /// Resolve `name` only if it has the given kind.
    pub fn resolve_kind(&self, name: &str, kind: SymbolKind) -> Option<&Arc<LibraryDefinition>> {
        self.resolve(name).filter(|def| def.kind == kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Arc<LibraryDefinition>> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Text of a resource captured at rebuild time (path uses `/`).
    pub fn resource(&self, path: &str) -> Option<&Arc<str>> {
        self.resources.get(path)
    }

    pub fn resource_paths(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

/// Registry holding the active snapshot.
#[derive(Debug)]
pub struct LibraryRegistry {
    active: RwLock<Arc<Snapshot>>,
    rebuild_lock: Mutex<()>,
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(Snapshot::empty())),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// The active snapshot. Hold on to the `Arc` to pin it.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look `name` up in the active snapshot.
    pub fn resolve(&self, name: &str) -> Option<Arc<LibraryDefinition>> {
        self.snapshot().resolve(name).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    /// Rescan `root`, compile every variable and class and publish the
    /// result as the new active snapshot.
    ///
    /// Rebuilds on one registry are serialised. On error the active
    /// snapshot is left untouched.
    ///
    /// # Errors
    /// - [`ShlibError::Scan`] when the root is missing or unreadable.
    /// - [`ShlibError::Compile`] for the first source (variables before
    ///   classes, each in path order) that fails to compile, has an invalid
    ///   symbol name, or reuses a name already defined.
    pub fn rebuild(
        &self,
        root: &WorkspaceRoot,
        compiler: &dyn LibraryCompiler,
    ) -> Result<Arc<Snapshot>> {
        let _guard = self
            .rebuild_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match self.build(root, compiler) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.active.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
                METRICS.inc_rebuilds_published();
                obs::emit_rebuild_published(
                    snapshot.generation(),
                    snapshot.len(),
                    &snapshot.digest().short(),
                );
                Ok(snapshot)
            }
            Err(err) => {
                METRICS.inc_rebuilds_rejected();
                obs::emit_rebuild_rejected(&err);
                Err(err)
            }
        }
    }

    fn build(&self, root: &WorkspaceRoot, compiler: &dyn LibraryCompiler) -> Result<Snapshot> {
        if !root.exists() {
            return Err(ShlibError::Scan {
                path: root.path().to_path_buf(),
                reason: "workspace root does not exist".to_string(),
            });
        }

        let extension = root.layout().extension.as_str();
        let mut definitions: BTreeMap<String, Arc<LibraryDefinition>> = BTreeMap::new();
        let mut parts: Vec<String> = Vec::new();

        for (set, kind) in [
            (SourceSet::Variables, SymbolKind::Variable),
            (SourceSet::Classes, SymbolKind::Class),
        ] {
            let files = root.files(set).map_err(|err| scan_error(root, err))?;
            for file in files {
                let Some(name) = symbol_name(&file.path, extension) else {
                    debug!(path = %file.path.display(), "skipping non-library file");
                    continue;
                };
                if !is_valid_symbol(&name) {
                    return Err(ShlibError::Compile {
                        symbol: name,
                        cause: "not a valid symbol name".to_string(),
                    });
                }
                if let Some(existing) = definitions.get(&name) {
                    return Err(ShlibError::Compile {
                        cause: format!(
                            "defined more than once ({} {} and {} {})",
                            existing.kind.as_str(),
                            existing.path.display(),
                            kind.as_str(),
                            file.path.display()
                        ),
                        symbol: name,
                    });
                }

                let compiled = compiler
                    .compile(&name, kind, &file.content)
                    .map_err(|cause| ShlibError::Compile {
                        symbol: name.clone(),
                        cause,
                    })?;
                let digest = Digest::compute(file.content.as_bytes());
                parts.push(format!("{}:{}:{}", kind.as_str(), name, digest.to_hex()));
                definitions.insert(
                    name.clone(),
                    Arc::new(LibraryDefinition {
                        name,
                        kind,
                        path: file.path,
                        source: file.content,
                        digest,
                        compiled,
                    }),
                );
            }
        }

        let mut resources = BTreeMap::new();
        let files = root
            .files(SourceSet::Resources)
            .map_err(|err| scan_error(root, err))?;
        for file in files {
            let key = resource_key(&file.path);
            parts.push(format!(
                "resource:{}:{}",
                key,
                Digest::compute(file.content.as_bytes()).to_hex()
            ));
            resources.insert(key, Arc::<str>::from(file.content));
        }

        Ok(Snapshot {
            generation: self.generation() + 1,
            digest: Digest::of_parts(&parts),
            built_at: Utc::now(),
            definitions,
            resources,
        })
    }
}

fn scan_error(root: &WorkspaceRoot, err: ShlibError) -> ShlibError {
    ShlibError::Scan {
        path: root.path().to_path_buf(),
        reason: err.to_string(),
    }
}

/// Symbol name for a source path: the file stem, when the extension matches.
fn symbol_name(path: &Path, extension: &str) -> Option<String> {
    if path.extension()?.to_str()? != extension {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}

fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn resource_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceLayout;

    /// Accepts any source except one containing `!!`.
    struct FakeCompiler;

    impl LibraryCompiler for FakeCompiler {
        fn compile(
            &self,
            _name: &str,
            _kind: SymbolKind,
            source: &str,
        ) -> std::result::Result<CompiledHandle, String> {
            if source.contains("!!") {
                Err("unexpected `!!`".to_string())
            } else {
                Ok(Arc::new(source.len()))
            }
        }
    }

    fn make_root() -> WorkspaceRoot {
        WorkspaceRoot::create(&WorkspaceLayout::default()).unwrap()
    }

    #[test]
    fn test_starts_with_empty_generation_zero() {
        let registry = LibraryRegistry::new();
        assert_eq!(registry.generation(), 0);
        assert!(registry.snapshot().is_empty());
        assert!(registry.resolve("acme").is_none());
    }

    #[test]
    fn test_rebuild_publishes_variables_classes_and_resources() {
        let root = make_root();
        root.stage_symbol(SourceSet::Variables, "acme", "ok").unwrap();
        root.stage(SourceSet::Classes, "org/acme/Greeting.lib", "ok")
            .unwrap();
        root.stage(SourceSet::Resources, "org/acme/banner.txt", "hello")
            .unwrap();
        root.stage(SourceSet::Variables, "README.md", "ignored").unwrap();

        let registry = LibraryRegistry::new();
        let snapshot = registry.rebuild(&root, &FakeCompiler).unwrap();

        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["Greeting", "acme"]);
        assert_eq!(snapshot.resolve("acme").unwrap().kind, SymbolKind::Variable);
        assert!(snapshot.resolve_kind("Greeting", SymbolKind::Class).is_some());
        assert!(snapshot.resolve_kind("Greeting", SymbolKind::Variable).is_none());
        assert_eq!(
            snapshot.resource("org/acme/banner.txt").map(|r| r.as_ref()),
            Some("hello")
        );
        assert!(registry.resolve("README").is_none());
    }

    #[test]
    fn test_compile_error_keeps_previous_snapshot() {
        let root = make_root();
        root.stage_symbol(SourceSet::Variables, "acme", "ok").unwrap();
        let registry = LibraryRegistry::new();
        let first = registry.rebuild(&root, &FakeCompiler).unwrap();

        root.stage_symbol(SourceSet::Variables, "broken", "!!").unwrap();
        let err = registry.rebuild(&root, &FakeCompiler).unwrap_err();
        match err {
            ShlibError::Compile { symbol, cause } => {
                assert_eq!(symbol, "broken");
                assert!(cause.contains("!!"));
            }
            other => panic!("expected Compile, got {other:?}"),
        }

        assert!(Arc::ptr_eq(&first, &registry.snapshot()));
        assert!(registry.resolve("acme").is_some());
        assert!(registry.resolve("broken").is_none());
    }

    #[test]
    fn test_missing_root_is_scan_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::open(dir.path().join("gone"), &WorkspaceLayout::default());
        let registry = LibraryRegistry::new();
        let err = registry.rebuild(&root, &FakeCompiler).unwrap_err();
        assert!(matches!(err, ShlibError::Scan { .. }), "{err:?}");
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn test_duplicate_symbol_across_sets_rejected() {
        let root = make_root();
        root.stage_symbol(SourceSet::Variables, "acme", "ok").unwrap();
        root.stage_symbol(SourceSet::Classes, "acme", "ok").unwrap();
        let err = LibraryRegistry::new()
            .rebuild(&root, &FakeCompiler)
            .unwrap_err();
        assert!(err.to_string().contains("defined more than once"), "{err}");
    }

    #[test]
    fn test_invalid_symbol_name_rejected() {
        let root = make_root();
        root.stage(SourceSet::Variables, "my-step.lib", "ok").unwrap();
        let err = LibraryRegistry::new()
            .rebuild(&root, &FakeCompiler)
            .unwrap_err();
        assert!(matches!(err, ShlibError::Compile { ref symbol, .. } if symbol == "my-step"));
    }

    #[test]
    fn test_rebuild_drops_stale_entries() {
        let root = make_root();
        root.stage_symbol(SourceSet::Variables, "old", "ok").unwrap();
        let registry = LibraryRegistry::new();
        registry.rebuild(&root, &FakeCompiler).unwrap();

        root.clear().unwrap();
        root.stage_symbol(SourceSet::Variables, "fresh", "ok").unwrap();
        let snapshot = registry.rebuild(&root, &FakeCompiler).unwrap();
        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["fresh"]);
        assert!(registry.resolve("old").is_none());
    }

    #[test]
    fn test_identical_contents_give_identical_digest() {
        let root = make_root();
        root.stage_symbol(SourceSet::Variables, "acme", "ok").unwrap();
        let registry = LibraryRegistry::new();
        let first = registry.rebuild(&root, &FakeCompiler).unwrap();
        root.stage_symbol(SourceSet::Variables, "acme", "ok").unwrap();
        let second = registry.rebuild(&root, &FakeCompiler).unwrap();
        assert_eq!(first.digest(), second.digest());
        assert_eq!(second.generation(), first.generation() + 1);

        root.stage_symbol(SourceSet::Variables, "acme", "changed").unwrap();
        let third = registry.rebuild(&root, &FakeCompiler).unwrap();
        assert_ne!(first.digest(), third.digest());
    }

    #[test]
    fn test_pinned_snapshot_survives_rebuild() {
        let root = make_root();
        root.stage_symbol(SourceSet::Variables, "acme", "ok").unwrap();
        let registry = LibraryRegistry::new();
        registry.rebuild(&root, &FakeCompiler).unwrap();
        let pinned = registry.snapshot();

        root.stage_symbol(SourceSet::Variables, "beta", "ok").unwrap();
        registry.rebuild(&root, &FakeCompiler).unwrap();

        assert!(!pinned.contains("beta"));
        assert!(registry.resolve("beta").is_some());
    }

    #[test]
    fn test_symbol_validation() {
        assert!(is_valid_symbol("acme"));
        assert!(is_valid_symbol("_private2"));
        assert!(!is_valid_symbol("2fast"));
        assert!(!is_valid_symbol(""));
        assert!(!is_valid_symbol("a.b"));
    }
}
