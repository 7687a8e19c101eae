//! Working-directory guard for scopes.

use crate::error::Result;
use crate::scope::{Context, ScopedResource, TeardownResult};
use std::path::{Path, PathBuf};

/// Makes a directory the current directory of a scope's context.
///
/// The directory is created on entry. On teardown the previous current
/// directory is restored, and the directory is removed only if nothing was
/// left inside it. The process working directory is never changed.
#[derive(Debug)]
pub struct ScopedDirectory {
    path: PathBuf,
    previous: Option<PathBuf>,
}

impl ScopedDirectory {
    /// Create `path` (relative paths resolve against the context's current
    /// directory) and bind it as `context`'s current directory.
    pub fn enter(context: &mut Context, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let path = if path.is_relative() {
            context.current_directory().join(path)
        } else {
            path
        };
        std::fs::create_dir_all(&path)?;
        let previous = context.own_directory().map(Path::to_path_buf);
        context.set_current_directory(&path);
        tracing::debug!(path = %path.display(), "Entered scoped directory");
        Ok(Self { path, previous })
    }

    /// The guarded directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScopedResource for ScopedDirectory {
    fn name(&self) -> String {
        format!("directory {}", self.path.display())
    }

    fn tear_down(&mut self, context: &mut Context) -> TeardownResult {
        context.restore_current_directory(self.previous.take());

        let is_empty = match std::fs::read_dir(&self.path) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if is_empty {
            std::fs::remove_dir(&self.path)?;
            tracing::debug!(path = %self.path.display(), "Removed empty scoped directory");
        } else {
            tracing::debug!(path = %self.path.display(), "Keeping non-empty scoped directory");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Scope, ScopeStack};

    #[test]
    fn test_empty_directory_removed_and_previous_restored() {
        let root = tempfile::tempdir().unwrap();
        let mut stack = ScopeStack::new(root.path());
        stack.enter_scope("test");
        let target = root.path().join("x");

        stack.enter_directory(&target).unwrap();
        assert!(target.is_dir());
        assert_eq!(stack.get_current_directory(), target);

        stack.exit_scope().unwrap();
        assert!(!target.exists());
        assert_eq!(stack.get_current_directory(), root.path());
    }

    #[test]
    fn test_non_empty_directory_kept() {
        let root = tempfile::tempdir().unwrap();
        let mut stack = ScopeStack::new(root.path());
        stack.enter_scope("test");
        stack.enter_directory("node0").unwrap();
        let log = stack.get_current_directory().join("stderr.log");
        std::fs::write(&log, "started").unwrap();

        stack.exit_scope().unwrap();
        assert!(log.exists());
        assert_eq!(stack.get_current_directory(), root.path());
    }

    #[test]
    fn test_restores_explicit_previous_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut scope = Scope::root(root.path());
        let explicit = root.path().join("explicit");
        scope.context_mut().set_current_directory(&explicit);

        let guard = ScopedDirectory::enter(scope.context_mut(), "nested").unwrap();
        assert_eq!(guard.path(), explicit.join("nested"));
        scope.register(Box::new(guard)).unwrap();
        assert_eq!(scope.context().current_directory(), explicit.join("nested"));

        scope.exit().unwrap();
        assert_eq!(scope.context().current_directory(), explicit);
        assert!(!explicit.join("nested").exists());
    }
}
