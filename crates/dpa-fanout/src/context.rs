use std::sync::{Arc, Mutex, MutexGuard};

/// An execution context that must be entered before talking to a backend and
/// reverted afterwards, e.g. switching the calling thread into a target
/// network namespace.
///
/// Implementations return an RAII guard from [`enter`](Self::enter); dropping
/// the guard reverts the context. The guard runs on every exit path,
/// including errors and panics, so a failed retrieval can never leak the
/// thread in the wrong context.
pub trait ScopedContext {
    type Guard;
    type Error;

    fn enter(&self) -> Result<Self::Guard, Self::Error>;
}

/// Serializes context borrowing process-wide.
///
/// Context switches are a process-wide side effect, so only one caller at a
/// time may hold an entered context, and no other backend call may interleave
/// while it is held. Clones share the same underlying lock; hand one clone to
/// every component that enters contexts instead of relying on a global.
#[derive(Debug, Clone, Default)]
pub struct ContextLock {
    inner: Arc<Mutex<()>>,
}

impl ContextLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the process-wide permit, then enters `ctx`. The returned
    /// [`EnteredContext`] reverts the context before releasing the permit.
    /// If entering fails, the permit is released immediately.
    pub fn enter<'a, C: ScopedContext>(
        &'a self,
        ctx: &C,
    ) -> Result<EnteredContext<'a, C::Guard>, C::Error> {
        let permit = self.inner.lock().unwrap_or_else(|poisoned| {
            // Guards revert during unwind, so a poisoned permit never means
            // a leaked context.
            poisoned.into_inner()
        });
        let guard = ctx.enter()?;
        Ok(EnteredContext {
            guard,
            _permit: permit,
        })
    }
}

/// Proof that the caller holds both the process-wide permit and an entered
/// context. Fields drop in declaration order: the context reverts first, the
/// permit is released after.
pub struct EnteredContext<'a, G> {
    guard: G,
    _permit: MutexGuard<'a, ()>,
}

impl<G> EnteredContext<'_, G> {
    pub fn guard(&self) -> &G {
        &self.guard
    }
}
