// crates/post-deploy-harness/src/fixture.rs
// ============================================================================
// Module: Template Materializer
// Description: Copies a Terraform module tree into an isolated temp directory.
// Purpose: Keep local state files and caches out of the test working copy.
// Dependencies: tempfile, walkdir, thiserror
// ============================================================================

//! ## Overview
//! The materializer copies a module root into a fresh temporary directory so
//! each run starts from a clean tree. Hidden paths, local state, and local
//! variable files are filtered out; Terraform version pins and provider lock
//! files are kept. The temporary directory is removed when the
//! [`WorkingCopy`] is dropped.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;
use thiserror::Error;
use walkdir::WalkDir;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Hidden file names that are always copied.
const KEPT_HIDDEN_FILES: [&str; 2] = [".terraform-version", ".terraform.lock.hcl"];

/// Local state and variable files that are never copied.
const SKIPPED_FILES: [&str; 4] =
    ["terraform.tfstate", "terraform.tfstate.backup", "terraform.tfvars", "terraform.tfvars.json"];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Materialization errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// The module root does not exist or is not a directory.
    #[error("module root not found: {}", .0.display())]
    RootMissing(PathBuf),
    /// The module subdirectory is absolute or escapes the root.
    #[error("module path must be relative to the root: {}", .0.display())]
    InvalidModulePath(PathBuf),
    /// The module subdirectory does not exist under the root.
    #[error("module directory not found: {}", .0.display())]
    ModuleMissing(PathBuf),
    /// A filesystem operation failed.
    #[error("{} {}: {}", .action, .path.display(), .source)]
    Io {
        /// Operation label.
        action: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Directory traversal failed.
    #[error("walk module tree: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Wraps an [`io::Error`] with its action and path.
fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> FixtureError + use<> {
    let path = path.to_path_buf();
    move |source| FixtureError::Io {
        action,
        path,
        source,
    }
}

// ============================================================================
// SECTION: Copy Filter
// ============================================================================

/// Path filter applied while copying a module tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFilter {
    /// Directory names skipped anywhere in the tree.
    excluded_dirs: BTreeSet<String>,
}

impl Default for CopyFilter {
    fn default() -> Self {
        Self {
            excluded_dirs: BTreeSet::from(["target".to_string()]),
        }
    }
}

impl CopyFilter {
    /// Creates a filter with no extra excluded directories.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            excluded_dirs: BTreeSet::new(),
        }
    }

    /// Adds a directory name to skip anywhere in the tree.
    #[must_use]
    pub fn exclude_dir(mut self, name: impl Into<String>) -> Self {
        self.excluded_dirs.insert(name.into());
        self
    }

    /// Returns true when the path, relative to the module root, is copied.
    ///
    /// Names are compared as OS strings, so non-UTF-8 names are filtered by
    /// the same rules as any other name.
    #[must_use]
    pub fn should_copy(&self, relative: &Path) -> bool {
        if let Some(file_name) = relative.file_name() {
            if names_contain(&KEPT_HIDDEN_FILES, file_name) {
                return true;
            }
            if names_contain(&SKIPPED_FILES, file_name) {
                return false;
            }
        }
        relative.components().all(|component| match component {
            Component::Normal(part) => {
                !part.as_encoded_bytes().starts_with(b".") && !self.is_excluded_dir(part)
            }
            _ => true,
        })
    }

    /// Returns true when `name` matches an excluded directory name.
    fn is_excluded_dir(&self, name: &OsStr) -> bool {
        self.excluded_dirs.iter().any(|excluded| OsStr::new(excluded) == name)
    }
}

/// Returns true when `name` equals one of `names`.
fn names_contain(names: &[&str], name: &OsStr) -> bool {
    names.iter().any(|candidate| OsStr::new(candidate) == name)
}

// ============================================================================
// SECTION: Working Copy
// ============================================================================

/// Temporary copy of a module tree.
///
/// # Invariants
/// - `module_dir` is inside `temp` for the lifetime of this value.
#[derive(Debug)]
pub struct WorkingCopy {
    /// Owning handle for the temporary directory.
    temp: TempDir,
    /// Directory Terraform runs in.
    module_dir: PathBuf,
}

impl WorkingCopy {
    /// Returns the directory Terraform runs in.
    #[must_use]
    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }

    /// Returns the root of the temporary directory.
    #[must_use]
    pub fn temp_root(&self) -> &Path {
        self.temp.path()
    }
}

/// Copies `root` into a new temp directory and returns the working copy of
/// `module_subdir` (use `.` for the root itself).
///
/// # Errors
///
/// Returns [`FixtureError`] when the root or module is missing, the module
/// path escapes the root, or any copy fails.
pub fn copy_terraform_folder_to_temp(
    root: &Path,
    module_subdir: &Path,
    filter: &CopyFilter,
) -> Result<WorkingCopy, FixtureError> {
    if !root.is_dir() {
        return Err(FixtureError::RootMissing(root.to_path_buf()));
    }
    if module_subdir.is_absolute()
        || module_subdir.components().any(|component| matches!(component, Component::ParentDir))
    {
        return Err(FixtureError::InvalidModulePath(module_subdir.to_path_buf()));
    }
    if !root.join(module_subdir).is_dir() {
        return Err(FixtureError::ModuleMissing(root.join(module_subdir)));
    }
    let canonical = fs::canonicalize(root).map_err(io_err("resolve", root))?;
    let root_name = canonical
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("module")
        .to_string();

    let temp = tempfile::Builder::new()
        .prefix(&format!("{root_name}-"))
        .tempdir()
        .map_err(io_err("create temp dir for", &canonical))?;
    let dest_root = temp.path().join(&root_name);
    copy_tree(&canonical, &dest_root, filter)?;
    let module_dir = dest_root.join(module_subdir);
    Ok(WorkingCopy {
        temp,
        module_dir,
    })
}

/// Copies a single file, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`FixtureError`] when the source cannot be read or the
/// destination cannot be written.
pub fn copy_file(source: &Path, dest: &Path) -> Result<(), FixtureError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_err("create", parent))?;
    }
    fs::copy(source, dest).map_err(io_err("copy", source))?;
    Ok(())
}

/// Recursively copies the filtered tree under `source` into `dest`.
fn copy_tree(source: &Path, dest: &Path, filter: &CopyFilter) -> Result<(), FixtureError> {
    fs::create_dir_all(dest).map_err(io_err("create", dest))?;
    let walker = WalkDir::new(source).follow_links(false).min_depth(1).into_iter();
    for entry in walker.filter_entry(|entry| {
        entry.path().strip_prefix(source).is_ok_and(|relative| filter.should_copy(relative))
    }) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(io_err("create", &target))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_err("copy", entry.path()))?;
        }
    }
    Ok(())
}

/// Recreates a symlink at `target` pointing where `link` points.
#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<(), FixtureError> {
    let points_to = fs::read_link(link).map_err(io_err("read link", link))?;
    std::os::unix::fs::symlink(&points_to, target).map_err(io_err("link", target))
}

/// Copies the file a symlink resolves to.
#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<(), FixtureError> {
    fs::copy(link, target).map(|_| ()).map_err(io_err("copy", link))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
