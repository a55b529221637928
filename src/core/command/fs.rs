//! Filesystem commands.
//!
//! Reversible deletes never remove data during `execute`: the target is
//! renamed to a hidden staging sibling and only purged in `finalize`, after
//! the owning processor committed. Overwrites snapshot the original into the
//! context's backup directory first.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::core::error::CommandError;

use super::{Command, ProcessorContext, Rollback};

fn exists(operation: &'static str, path: &Path) -> Result<bool, CommandError> {
    path.try_exists()
        .map_err(|source| CommandError::io(operation, path, source))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "unnamed".to_owned(), |n| n.to_string_lossy().into_owned())
}

/// Hidden sibling a reversible delete moves its target to.
fn staging_path(path: &Path) -> PathBuf {
    path.with_file_name(format!(".{}.deleted-{}", file_name(path), Uuid::new_v4().simple()))
}

fn purge(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(err) = result {
        if err.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %err, "failed to purge staged path");
        }
    }
}

/// Recursively copy `source` into `destination`, creating directories as
/// needed.
fn copy_tree(source: &Path, destination: &Path) -> Result<(), CommandError> {
    fs::create_dir_all(destination)
        .map_err(|err| CommandError::io("copy_tree.create_dir", destination, err))?;

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|err| CommandError::walkdir("copy_tree.walk", source, err))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| CommandError::Invalid(format!("{} escapes {}", entry.path().display(), source.display())))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| CommandError::io("copy_tree.create_dir", &target, err))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|err| CommandError::io("copy_tree.copy_entry", &target, err))?;
        }
    }
    Ok(())
}

// ============================================================================
// Save
// ============================================================================

#[derive(Debug)]
enum SaveSource {
    Bytes(Vec<u8>),
    CopyFrom(PathBuf),
}

/// Write a file, optionally replacing an existing one.
///
/// The new content lands in a temp sibling first and is renamed over the
/// target, so a reader never sees a half-written file.
#[derive(Debug)]
pub struct SaveFileCommand {
    target: PathBuf,
    source: SaveSource,
    overwrite: bool,
    rollback: Rollback,
    backup: Option<PathBuf>,
    created: bool,
    written: bool,
}

impl SaveFileCommand {
    /// Save `bytes` to `target`.
    pub fn from_bytes(
        target: impl Into<PathBuf>,
        bytes: impl Into<Vec<u8>>,
        overwrite: bool,
        rollback: Rollback,
    ) -> Self {
        Self::build(target.into(), SaveSource::Bytes(bytes.into()), overwrite, rollback)
    }

    /// Save a copy of the file at `source` to `target`.
    pub fn copy_from(
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        overwrite: bool,
        rollback: Rollback,
    ) -> Self {
        Self::build(target.into(), SaveSource::CopyFrom(source.into()), overwrite, rollback)
    }

    const fn build(target: PathBuf, source: SaveSource, overwrite: bool, rollback: Rollback) -> Self {
        Self {
            target,
            source,
            overwrite,
            rollback,
            backup: None,
            created: false,
            written: false,
        }
    }

    /// Path written by this command.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    fn snapshot(&mut self, ctx: &dyn ProcessorContext) -> Result<(), CommandError> {
        let dir = ctx.backup_directory();
        fs::create_dir_all(dir).map_err(|err| CommandError::io("save.backup_dir", dir, err))?;
        let backup = dir.join(format!("{}-{}", Uuid::new_v4().simple(), file_name(&self.target)));
        fs::copy(&self.target, &backup).map_err(|err| CommandError::io("save.backup", &backup, err))?;
        self.backup = Some(backup);
        Ok(())
    }

    fn write_temp(&self, temp: &Path) -> Result<(), CommandError> {
        match &self.source {
            SaveSource::Bytes(bytes) => {
                fs::write(temp, bytes).map_err(|err| CommandError::io("save.write", temp, err))
            }
            SaveSource::CopyFrom(source) => fs::copy(source, temp)
                .map(|_| ())
                .map_err(|err| CommandError::io("save.copy", source, err)),
        }
    }
}

impl Command for SaveFileCommand {
    fn name(&self) -> &str {
        "save_file"
    }

    fn requires_rollback(&self) -> bool {
        self.rollback.is_required()
    }

    fn execute(&mut self, ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        let existed = exists("save.stat", &self.target)?;
        if existed && !self.overwrite {
            return Err(CommandError::AlreadyExists {
                path: self.target.clone(),
            });
        }
        if let SaveSource::CopyFrom(source) = &self.source {
            if !exists("save.stat_source", source)? {
                return Err(CommandError::NotFound { path: source.clone() });
            }
        }
        if existed && self.rollback.is_required() {
            self.snapshot(ctx)?;
        }
        self.created = !existed;

        let temp = self
            .target
            .with_file_name(format!(".{}.{}.tmp", file_name(&self.target), Uuid::new_v4().simple()));
        if let Err(err) = self.write_temp(&temp) {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }
        if let Err(err) = fs::rename(&temp, &self.target) {
            let _ = fs::remove_file(&temp);
            return Err(CommandError::io("save.rename", &self.target, err));
        }
        self.written = true;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !self.rollback.is_required() {
            return Ok(());
        }
        if let Some(backup) = self.backup.take() {
            fs::copy(&backup, &self.target)
                .map_err(|err| CommandError::io("save.restore", &self.target, err))?;
            let _ = fs::remove_file(&backup);
        } else if self.created && self.written {
            fs::remove_file(&self.target)
                .map_err(|err| CommandError::io("save.remove_new", &self.target, err))?;
        }
        self.written = false;
        Ok(())
    }

    fn finalize(&mut self) {
        if let Some(backup) = self.backup.take() {
            purge(&backup);
        }
    }
}

// ============================================================================
// Delete
// ============================================================================

/// Delete a single file. Deleting a missing file succeeds.
#[derive(Debug)]
pub struct DeleteFileCommand {
    path: PathBuf,
    rollback: Rollback,
    staged: Option<PathBuf>,
}

impl DeleteFileCommand {
    /// Delete `path`. With [`Rollback::Required`] the file is staged until
    /// commit instead of being removed.
    pub fn new(path: impl Into<PathBuf>, rollback: Rollback) -> Self {
        Self {
            path: path.into(),
            rollback,
            staged: None,
        }
    }
}

impl Command for DeleteFileCommand {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn requires_rollback(&self) -> bool {
        self.rollback.is_required()
    }

    fn execute(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !exists("delete_file.stat", &self.path)? {
            debug!(path = %self.path.display(), "file already absent");
            return Ok(());
        }
        if self.rollback.is_required() {
            let staged = staging_path(&self.path);
            fs::rename(&self.path, &staged)
                .map_err(|err| CommandError::io("delete_file.stage", &self.path, err))?;
            self.staged = Some(staged);
        } else {
            fs::remove_file(&self.path)
                .map_err(|err| CommandError::io("delete_file.remove", &self.path, err))?;
        }
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if let Some(staged) = self.staged.take() {
            fs::rename(&staged, &self.path)
                .map_err(|err| CommandError::io("delete_file.restore", &self.path, err))?;
        }
        Ok(())
    }

    fn finalize(&mut self) {
        if let Some(staged) = self.staged.take() {
            purge(&staged);
        }
    }
}

/// Delete a directory tree. Deleting a missing directory succeeds.
#[derive(Debug)]
pub struct DeleteDirectoryCommand {
    path: PathBuf,
    rollback: Rollback,
    staged: Option<PathBuf>,
}

impl DeleteDirectoryCommand {
    /// Delete the tree at `path`.
    pub fn new(path: impl Into<PathBuf>, rollback: Rollback) -> Self {
        Self {
            path: path.into(),
            rollback,
            staged: None,
        }
    }
}

impl Command for DeleteDirectoryCommand {
    fn name(&self) -> &str {
        "delete_directory"
    }

    fn requires_rollback(&self) -> bool {
        self.rollback.is_required()
    }

    fn execute(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !exists("delete_dir.stat", &self.path)? {
            debug!(path = %self.path.display(), "directory already absent");
            return Ok(());
        }
        if self.rollback.is_required() {
            let staged = staging_path(&self.path);
            fs::rename(&self.path, &staged)
                .map_err(|err| CommandError::io("delete_dir.stage", &self.path, err))?;
            self.staged = Some(staged);
        } else {
            fs::remove_dir_all(&self.path)
                .map_err(|err| CommandError::io("delete_dir.remove", &self.path, err))?;
        }
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if let Some(staged) = self.staged.take() {
            fs::rename(&staged, &self.path)
                .map_err(|err| CommandError::io("delete_dir.restore", &self.path, err))?;
        }
        Ok(())
    }

    fn finalize(&mut self) {
        if let Some(staged) = self.staged.take() {
            purge(&staged);
        }
    }
}

// ============================================================================
// Rename / create
// ============================================================================

/// Rename a file. Fails when the source is missing or the destination exists.
#[derive(Debug)]
pub struct RenameFileCommand {
    source: PathBuf,
    destination: PathBuf,
    rollback: Rollback,
    renamed: bool,
}

impl RenameFileCommand {
    /// Rename `source` to `destination`.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, rollback: Rollback) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            rollback,
            renamed: false,
        }
    }
}

impl Command for RenameFileCommand {
    fn name(&self) -> &str {
        "rename_file"
    }

    fn requires_rollback(&self) -> bool {
        self.rollback.is_required()
    }

    fn execute(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !exists("rename.stat_source", &self.source)? {
            return Err(CommandError::NotFound {
                path: self.source.clone(),
            });
        }
        if exists("rename.stat_destination", &self.destination)? {
            return Err(CommandError::AlreadyExists {
                path: self.destination.clone(),
            });
        }
        fs::rename(&self.source, &self.destination)
            .map_err(|err| CommandError::io("rename", &self.source, err))?;
        self.renamed = true;
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if self.renamed && self.rollback.is_required() {
            fs::rename(&self.destination, &self.source)
                .map_err(|err| CommandError::io("rename.undo", &self.destination, err))?;
            self.renamed = false;
        }
        Ok(())
    }
}

/// Create a directory and any missing ancestors. Idempotent.
#[derive(Debug)]
pub struct CreateDirectoryCommand {
    path: PathBuf,
    rollback: Rollback,
    created: Vec<PathBuf>,
}

impl CreateDirectoryCommand {
    /// Create `path`.
    pub fn new(path: impl Into<PathBuf>, rollback: Rollback) -> Self {
        Self {
            path: path.into(),
            rollback,
            created: Vec::new(),
        }
    }

    /// Directories this command created, deepest first.
    #[must_use]
    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }
}

impl Command for CreateDirectoryCommand {
    fn name(&self) -> &str {
        "create_directory"
    }

    fn requires_rollback(&self) -> bool {
        self.rollback.is_required()
    }

    fn execute(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        let mut missing = Vec::new();
        for ancestor in self.path.ancestors() {
            if ancestor.as_os_str().is_empty() || exists("create_dir.stat", ancestor)? {
                break;
            }
            missing.push(ancestor.to_path_buf());
        }
        if missing.is_empty() {
            return Ok(());
        }
        // Record before creating so a partial create_dir_all is still undone.
        self.created = missing;
        fs::create_dir_all(&self.path)
            .map_err(|err| CommandError::io("create_dir", &self.path, err))
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !self.rollback.is_required() {
            return Ok(());
        }
        for dir in self.created.drain(..) {
            match fs::remove_dir(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    debug!(path = %dir.display(), error = %err, "created directory not removed");
                    break;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Copy / move trees
// ============================================================================

/// Copy a directory tree to a destination that must not exist yet.
#[derive(Debug)]
pub struct CopyDirectoryCommand {
    source: PathBuf,
    destination: PathBuf,
    rollback: Rollback,
    started: bool,
}

impl CopyDirectoryCommand {
    /// Copy `source` to `destination`.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, rollback: Rollback) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            rollback,
            started: false,
        }
    }
}

impl Command for CopyDirectoryCommand {
    fn name(&self) -> &str {
        "copy_directory"
    }

    fn requires_rollback(&self) -> bool {
        self.rollback.is_required()
    }

    fn execute(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !self.source.is_dir() {
            return Err(CommandError::NotFound {
                path: self.source.clone(),
            });
        }
        if exists("copy_dir.stat_destination", &self.destination)? {
            return Err(CommandError::AlreadyExists {
                path: self.destination.clone(),
            });
        }
        self.started = true;
        copy_tree(&self.source, &self.destination)
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if self.started && self.rollback.is_required() {
            self.started = false;
            match fs::remove_dir_all(&self.destination) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(CommandError::io("copy_dir.undo", &self.destination, err)),
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
enum MoveState {
    Renamed,
    Copied { staged_source: Option<PathBuf> },
}

/// Move a directory tree. Falls back to copy-then-delete when a plain rename
/// is not possible (e.g. across filesystems).
#[derive(Debug)]
pub struct MoveDirectoryCommand {
    source: PathBuf,
    destination: PathBuf,
    rollback: Rollback,
    state: Option<MoveState>,
}

impl MoveDirectoryCommand {
    /// Move `source` to `destination`. The destination's parent must exist.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, rollback: Rollback) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            rollback,
            state: None,
        }
    }
}

impl Command for MoveDirectoryCommand {
    fn name(&self) -> &str {
        "move_directory"
    }

    fn requires_rollback(&self) -> bool {
        self.rollback.is_required()
    }

    fn execute(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !self.source.is_dir() {
            return Err(CommandError::NotFound {
                path: self.source.clone(),
            });
        }
        if exists("move_dir.stat_destination", &self.destination)? {
            return Err(CommandError::AlreadyExists {
                path: self.destination.clone(),
            });
        }

        match fs::rename(&self.source, &self.destination) {
            Ok(()) => {
                self.state = Some(MoveState::Renamed);
                return Ok(());
            }
            Err(err) => {
                debug!(
                    source = %self.source.display(),
                    error = %err,
                    "rename failed; copying tree instead"
                );
            }
        }

        self.state = Some(MoveState::Copied { staged_source: None });
        copy_tree(&self.source, &self.destination)?;
        if self.rollback.is_required() {
            let staged = staging_path(&self.source);
            fs::rename(&self.source, &staged)
                .map_err(|err| CommandError::io("move_dir.stage_source", &self.source, err))?;
            self.state = Some(MoveState::Copied {
                staged_source: Some(staged),
            });
        } else {
            fs::remove_dir_all(&self.source)
                .map_err(|err| CommandError::io("move_dir.remove_source", &self.source, err))?;
        }
        Ok(())
    }

    fn undo(&mut self, _ctx: &mut dyn ProcessorContext) -> Result<(), CommandError> {
        if !self.rollback.is_required() {
            return Ok(());
        }
        match self.state.take() {
            None => Ok(()),
            Some(MoveState::Renamed) => fs::rename(&self.destination, &self.source)
                .map_err(|err| CommandError::io("move_dir.undo", &self.destination, err)),
            Some(MoveState::Copied { staged_source }) => {
                if let Some(staged) = staged_source {
                    fs::rename(&staged, &self.source)
                        .map_err(|err| CommandError::io("move_dir.restore_source", &self.source, err))?;
                }
                match fs::remove_dir_all(&self.destination) {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(CommandError::io("move_dir.remove_copy", &self.destination, err)),
                }
            }
        }
    }

    fn finalize(&mut self) {
        if let Some(MoveState::Copied {
            staged_source: Some(staged),
        }) = self.state.take()
        {
            purge(&staged);
        }
    }
}
