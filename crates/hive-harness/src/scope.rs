//! Nested lifetime scopes and the resources they own.
//!
//! A [`ScopeStack`] is passed explicitly to whatever creates test subjects;
//! there is no ambient "current scope". The top of the stack is the current
//! scope. Resources register with it and are torn down, last registered
//! first, when the scope exits.

use crate::error::{BoxError, HarnessError, Result, TeardownFailure};
use crate::directory::ScopedDirectory;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

/// Outcome of a single resource teardown.
pub type TeardownResult = std::result::Result<(), BoxError>;

/// Something a scope tears down when it exits.
pub trait ScopedResource: Send {
    /// Name used in logs and teardown failure reports.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Release the resource. `context` is the owning scope's context.
    fn tear_down(&mut self, context: &mut Context) -> TeardownResult;
}

/// Closure-backed [`ScopedResource`].
pub struct OnExit<F> {
    name: String,
    action: Option<F>,
}

impl<F> OnExit<F>
where
    F: FnOnce(&mut Context) -> TeardownResult + Send,
{
    /// Run `action` when the owning scope exits.
    pub fn new(name: impl Into<String>, action: F) -> Self {
        Self {
            name: name.into(),
            action: Some(action),
        }
    }
}

impl<F> ScopedResource for OnExit<F>
where
    F: FnOnce(&mut Context) -> TeardownResult + Send,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn tear_down(&mut self, context: &mut Context) -> TeardownResult {
        match self.action.take() {
            Some(action) => action(context),
            None => Ok(()),
        }
    }
}

/// Unique identifier for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(Uuid);

impl ScopeId {
    /// Create a new random scope ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Accepting registrations.
    Active,
    /// Tearing down its registrants.
    Exiting,
    /// Every registrant has been torn down.
    TornDown,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Exiting => write!(f, "Exiting"),
            Self::TornDown => write!(f, "TornDown"),
        }
    }
}

/// Directory and logger state inherited along the scope chain.
///
/// Only the current directory can be rebound. An unset directory falls
/// back to the parent's.
#[derive(Debug, Clone)]
pub struct Context {
    current_directory: Option<PathBuf>,
    span: Span,
    parent: Option<Arc<Context>>,
}

impl Context {
    /// Root context with the process-wide default directory.
    pub fn root(default_directory: impl Into<PathBuf>) -> Self {
        Self {
            current_directory: Some(default_directory.into()),
            span: tracing::info_span!("scope", name = "root"),
            parent: None,
        }
    }

    /// Child context inheriting directory and logger from `parent`.
    pub fn child_of(parent: &Context, name: &str) -> Self {
        Self {
            current_directory: None,
            span: tracing::info_span!(parent: &parent.span, "scope", name = %name),
            parent: Some(Arc::new(parent.clone())),
        }
    }

    /// Current directory, falling back along the parent chain.
    pub fn current_directory(&self) -> &Path {
        match (&self.current_directory, &self.parent) {
            (Some(dir), _) => dir,
            (None, Some(parent)) => parent.current_directory(),
            // Only the root has no parent and it always has a directory.
            (None, None) => Path::new("."),
        }
    }

    /// Directory bound in this context itself, ignoring parents.
    pub fn own_directory(&self) -> Option<&Path> {
        self.current_directory.as_deref()
    }

    /// Rebind the current directory of this context.
    pub fn set_current_directory(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        tracing::debug!(parent: &self.span, path = %path.display(), "Current directory set");
        self.current_directory = Some(path);
    }

    /// Restore a value previously returned by [`own_directory`](Self::own_directory).
    pub fn restore_current_directory(&mut self, previous: Option<PathBuf>) {
        if self.parent.is_none() && previous.is_none() {
            // The root context always keeps a directory.
            return;
        }
        self.current_directory = previous;
    }

    /// Logger handle of this context.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Parent context, if any.
    pub fn parent(&self) -> Option<&Context> {
        self.parent.as_deref()
    }
}

struct Registrant {
    name: String,
    resource: Box<dyn ScopedResource>,
}

/// A lifetime boundary owning a [`Context`] and the resources registered
/// with it.
pub struct Scope {
    id: ScopeId,
    name: String,
    context: Context,
    registrants: Vec<Registrant>,
    state: ScopeState,
    created_at: DateTime<Utc>,
}

impl Scope {
    /// Create the outermost scope.
    pub fn root(default_directory: impl Into<PathBuf>) -> Self {
        Self::with_context("root", Context::root(default_directory))
    }

    /// Create a scope nested in `parent`.
    pub fn nested(parent: &Scope, name: impl Into<String>) -> Self {
        let name = name.into();
        let context = Context::child_of(&parent.context, &name);
        Self::with_context(name, context)
    }

    fn with_context(name: impl Into<String>, context: Context) -> Self {
        let scope = Self {
            id: ScopeId::new(),
            name: name.into(),
            context,
            registrants: Vec::new(),
            state: ScopeState::Active,
            created_at: Utc::now(),
        };
        tracing::debug!(
            parent: scope.context.span(),
            scope_id = %scope.id,
            directory = %scope.context.current_directory().display(),
            "Entered scope"
        );
        scope
    }

    /// Get the scope ID.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Get the scope name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state.
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Context owned by this scope.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Mutable context owned by this scope.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Number of resources waiting for teardown.
    pub fn registrant_count(&self) -> usize {
        self.registrants.len()
    }

    /// Register a resource for teardown when this scope exits.
    ///
    /// The resource is owned by this scope from now on.
    pub fn register(&mut self, resource: Box<dyn ScopedResource>) -> Result<()> {
        self.ensure_active()?;
        let name = resource.name();
        tracing::debug!(
            parent: self.context.span(),
            scope_id = %self.id,
            resource = %name,
            position = self.registrants.len(),
            "Registered resource"
        );
        self.registrants.push(Registrant { name, resource });
        Ok(())
    }

    /// Tear down every registrant, last registered first.
    ///
    /// A failing teardown does not stop the remaining ones. All failures are
    /// returned together once every registrant has been visited.
    pub fn exit(&mut self) -> Result<()> {
        self.ensure_active()?;
        let start = std::time::Instant::now();
        self.state = ScopeState::Exiting;
        tracing::debug!(
            parent: self.context.span(),
            scope_id = %self.id,
            registrants = self.registrants.len(),
            "Exiting scope"
        );

        let mut failures = Vec::new();
        while let Some(Registrant { name, mut resource }) = self.registrants.pop() {
            tracing::trace!(parent: self.context.span(), resource = %name, "Tearing down");
            if let Err(error) = resource.tear_down(&mut self.context) {
                tracing::error!(
                    parent: self.context.span(),
                    scope_id = %self.id,
                    resource = %name,
                    error = %error,
                    "Teardown failed"
                );
                failures.push(TeardownFailure {
                    resource: name,
                    error,
                });
            }
        }

        self.state = ScopeState::TornDown;
        tracing::debug!(
            parent: self.context.span(),
            scope_id = %self.id,
            failures = failures.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Scope torn down"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Teardown {
                scope: self.name.clone(),
                failures,
            })
        }
    }

    /// Ensure the scope is in the Active state.
    fn ensure_active(&self) -> Result<()> {
        if self.state != ScopeState::Active {
            return Err(HarnessError::InvalidState {
                scope: self.id,
                expected: ScopeState::Active.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.state == ScopeState::Active && !self.registrants.is_empty() {
            tracing::warn!(
                scope_id = %self.id,
                registrants = self.registrants.len(),
                "Scope dropped without exit, tearing down"
            );
            let _ = self.exit();
        }
    }
}

/// Stack of nested scopes; the top is the current scope.
///
/// The root scope is created with the stack and exits when the stack is
/// closed or dropped.
pub struct ScopeStack {
    scopes: Vec<Scope>,
}

impl ScopeStack {
    /// Create a stack holding only the root scope.
    pub fn new(default_directory: impl Into<PathBuf>) -> Self {
        Self {
            scopes: vec![Scope::root(default_directory)],
        }
    }

    /// Number of scopes, the root included.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// The current scope.
    pub fn current(&self) -> &Scope {
        self.scopes.last().unwrap_or_else(|| unreachable!("root scope is never popped"))
    }

    /// The current scope, mutably.
    pub fn current_mut(&mut self) -> &mut Scope {
        self.scopes
            .last_mut()
            .unwrap_or_else(|| unreachable!("root scope is never popped"))
    }

    /// Context of the current scope.
    pub fn context(&self) -> &Context {
        self.current().context()
    }

    /// Mutable context of the current scope.
    pub fn context_mut(&mut self) -> &mut Context {
        self.current_mut().context_mut()
    }

    /// Push a new scope inheriting the current one's context.
    pub fn enter_scope(&mut self, name: impl Into<String>) -> ScopeId {
        let scope = Scope::nested(self.current(), name);
        let id = scope.id();
        self.scopes.push(scope);
        id
    }

    /// Register a resource with the current scope.
    pub fn register(&mut self, resource: Box<dyn ScopedResource>) -> Result<()> {
        self.current_mut().register(resource)
    }

    /// Current directory of the current scope.
    pub fn get_current_directory(&self) -> &Path {
        self.context().current_directory()
    }

    /// Rebind the current directory of the current scope.
    pub fn set_current_directory(&mut self, path: impl Into<PathBuf>) {
        self.context_mut().set_current_directory(path);
    }

    /// Create `path`, make it the current directory and register a
    /// [`ScopedDirectory`] that undoes both when the current scope exits.
    pub fn enter_directory(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let guard = ScopedDirectory::enter(self.context_mut(), path)?;
        self.register(Box::new(guard))
    }

    /// Pop and tear down the current scope.
    ///
    /// # Errors
    ///
    /// [`HarnessError::NoScopeToExit`] if only the root is left, otherwise
    /// the aggregated teardown failures of the popped scope.
    pub fn exit_scope(&mut self) -> Result<()> {
        if self.scopes.len() <= 1 {
            return Err(HarnessError::NoScopeToExit);
        }
        let mut scope = self
            .scopes
            .pop()
            .unwrap_or_else(|| unreachable!("checked above"));
        scope.exit()
    }

    /// Run `f` inside a fresh scope that is always exited afterwards.
    ///
    /// If `f` fails its error is returned and a teardown failure is only
    /// logged; otherwise the teardown result decides.
    pub fn with_scope<R, F>(&mut self, name: impl Into<String>, f: F) -> Result<R>
    where
        F: FnOnce(&mut ScopeStack) -> Result<R>,
    {
        let depth = self.depth();
        self.enter_scope(name);
        let outcome = f(self);

        // Scopes `f` left open are closed first.
        let mut teardown = Ok(());
        while self.depth() > depth {
            if let Err(e) = self.exit_scope() {
                if teardown.is_ok() {
                    teardown = Err(e);
                } else {
                    tracing::error!(error = %e, "Additional teardown failure");
                }
            }
        }

        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_error)) => {
                tracing::error!(error = %teardown_error, "Teardown failed after scope body error");
                Err(e)
            }
        }
    }

    /// Tear down every scope, innermost first, root included.
    pub fn close(mut self) -> Result<()> {
        self.unwind()
    }

    fn unwind(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(mut scope) = self.scopes.pop() {
            if scope.state() != ScopeState::Active {
                continue;
            }
            if let Err(e) = scope.exit() {
                match first_error {
                    None => first_error = Some(e),
                    Some(_) => tracing::error!(error = %e, "Additional teardown failure"),
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ScopeStack {
    fn drop(&mut self) {
        if let Err(e) = self.unwind() {
            tracing::error!(error = %e, "Teardown failed while dropping scope stack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Box<dyn ScopedResource> {
        let log = Arc::clone(log);
        let entry = name.to_string();
        Box::new(OnExit::new(name, move |_: &mut Context| {
            log.lock().unwrap().push(entry);
            Ok(())
        }))
    }

    fn failing(name: &str) -> Box<dyn ScopedResource> {
        let message = format!("{name} refused to stop");
        Box::new(OnExit::new(name, move |_: &mut Context| Err(message.into())))
    }

    #[test]
    fn test_teardown_is_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopeStack::new("/tmp/hive");
        stack.enter_scope("test");
        for name in ["A", "B", "C"] {
            stack.register(recorder(&log, name)).unwrap();
        }
        stack.exit_scope().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_failures_do_not_stop_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopeStack::new("/tmp/hive");
        stack.enter_scope("test");
        stack.register(recorder(&log, "A")).unwrap();
        stack.register(failing("B")).unwrap();
        stack.register(recorder(&log, "C")).unwrap();
        stack.register(failing("D")).unwrap();

        let err = stack.exit_scope().unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["C", "A"]);
        match err {
            HarnessError::Teardown { scope, failures } => {
                assert_eq!(scope, "test");
                let names: Vec<_> = failures.iter().map(|f| f.resource.as_str()).collect();
                assert_eq!(names, vec!["D", "B"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_torn_down_scope_rejects_registration() {
        let mut scope = Scope::root("/tmp/hive");
        scope.exit().unwrap();
        assert_eq!(scope.state(), ScopeState::TornDown);
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            scope.register(recorder(&log, "late")),
            Err(HarnessError::InvalidState { .. })
        ));
        assert!(scope.exit().is_err());
    }

    #[test]
    fn test_directory_inherited_and_rebound() {
        let mut stack = ScopeStack::new("/tmp/hive");
        stack.enter_scope("outer");
        stack.set_current_directory("/tmp/hive/outer");
        stack.enter_scope("inner");
        assert_eq!(stack.get_current_directory(), Path::new("/tmp/hive/outer"));
        assert!(stack.context().own_directory().is_none());
        stack.exit_scope().unwrap();
        stack.exit_scope().unwrap();
        assert_eq!(stack.get_current_directory(), Path::new("/tmp/hive"));
    }

    #[test]
    fn test_root_cannot_be_exited() {
        let mut stack = ScopeStack::new("/tmp/hive");
        assert!(matches!(stack.exit_scope(), Err(HarnessError::NoScopeToExit)));
    }

    #[test]
    fn test_with_scope_exits_nested_scopes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopeStack::new("/tmp/hive");
        let inner_log = Arc::clone(&log);
        let value = stack
            .with_scope("outer", |stack| {
                stack.register(recorder(&inner_log, "outer-resource"))?;
                stack.enter_scope("left-open");
                stack.register(recorder(&inner_log, "inner-resource"))?;
                Ok(42)
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(stack.depth(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["inner-resource", "outer-resource"]);
    }

    #[test]
    fn test_with_scope_body_error_wins() {
        let mut stack = ScopeStack::new("/tmp/hive");
        let err = stack
            .with_scope("test", |stack| -> Result<()> {
                stack.register(failing("A"))?;
                Err(HarnessError::Config("body failed".into()))
            })
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_close_tears_down_root() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ScopeStack::new("/tmp/hive");
        stack.register(recorder(&log, "root-resource")).unwrap();
        stack.enter_scope("test");
        stack.register(recorder(&log, "test-resource")).unwrap();
        stack.close().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["test-resource", "root-resource"]);
    }

    #[test]
    fn test_drop_tears_down() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut stack = ScopeStack::new("/tmp/hive");
            stack.enter_scope("test");
            stack.register(recorder(&log, "A")).unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["A"]);
    }
}
