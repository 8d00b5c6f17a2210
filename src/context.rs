//! Request-scoped context.
//!
//! A `Context` carries cancellation, an optional deadline and a chain of
//! keyed values down a call chain. It is immutable: every `with_*` call
//! derives a child node and leaves the parent untouched. Cloning is cheap.

use crate::error::{DbError, DbResult};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Key under which a value is stored in a context.
///
/// Keys compare by name, so two independently declared keys with the same
/// name address the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey(&'static str);

impl ContextKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

type ContextValue = Arc<dyn Any + Send + Sync>;

struct Node {
    parent: Option<Context>,
    entry: Option<(ContextKey, ContextValue)>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

#[derive(Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// The root context: never cancelled, no deadline, no values.
    pub fn background() -> Self {
        Self {
            node: Arc::new(Node {
                parent: None,
                entry: None,
                cancel: CancellationToken::new(),
                deadline: None,
            }),
        }
    }

    fn derive(
        &self,
        entry: Option<(ContextKey, ContextValue)>,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            node: Arc::new(Node {
                parent: Some(self.clone()),
                entry,
                cancel,
                deadline,
            }),
        }
    }

    /// Derive a child carrying `value` under `key`.
    pub fn with_value<T>(&self, key: ContextKey, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let value: ContextValue = Arc::new(value);
        self.derive(
            Some((key, value)),
            self.node.cancel.clone(),
            self.node.deadline,
        )
    }

    /// Derive a child that can be cancelled independently of its parent.
    pub fn with_cancel(&self) -> Self {
        self.derive(None, self.node.cancel.child_token(), self.node.deadline)
    }

    /// Derive a cancellable child whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a cancellable child with the earlier of the parent's deadline
    /// and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.node.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        self.derive(None, self.node.cancel.child_token(), Some(deadline))
    }

    /// Look up the nearest value stored under `key`.
    pub fn value(&self, key: &ContextKey) -> Option<&(dyn Any + Send + Sync)> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some((k, v)) = &ctx.node.entry {
                if k == key {
                    return Some(v.as_ref());
                }
            }
            current = ctx.node.parent.as_ref();
        }
        None
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.node.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    /// Check whether the context is already done, without waiting.
    pub fn err(&self) -> Option<DbError> {
        if self.is_cancelled() {
            return Some(DbError::Cancelled);
        }
        match self.node.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(DbError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first. The losing future is dropped.
    pub async fn run<F, T, E>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = Result<T, E>>,
        DbError: From<E>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        let deadline = self.node.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            res = fut => res.map_err(DbError::from),
            _ = self.node.cancel.cancelled() => Err(DbError::Cancelled),
            _ = expired => Err(DbError::DeadlineExceeded),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.node.entry.as_ref().map(|(k, _)| k.name()))
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.node.deadline)
            .finish_non_exhaustive()
    }
}

/// Unwrap an optional context, rejecting an absent one.
pub(crate) fn require<'a>(ctx: impl Into<Option<&'a Context>>) -> DbResult<&'a Context> {
    ctx.into().ok_or(DbError::NilContext)
}
