//! Transaction boundary around a job's business logic.
//!
//! The dispatcher begins one transaction per execution attempt and hands a
//! `&mut dyn TransactionHandle` to the continuation. Commit and rollback take
//! the transaction by value, so once the attempt is resolved the handle is gone
//! and failure bookkeeping cannot run inside it.

use thiserror::Error;

/// Hook run right before commit; an error aborts the commit.
pub type BeforeCommitListener = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Effect applied only if the transaction commits.
pub type CommitAction = Box<dyn FnOnce() + Send>;

/// Reason a transaction did not commit.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Business logic asked for the transaction to be rolled back.
    #[error("transaction marked rollback-only: {reason}")]
    RollbackOnly { reason: String },

    /// A before-commit listener failed.
    #[error("before-commit listener '{listener}' failed")]
    ListenerFailed {
        listener: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// What business logic may do with the running transaction.
pub trait TransactionHandle {
    /// Request rollback; the eventual commit attempt fails with
    /// [`TransactionError::RollbackOnly`].
    fn set_rollback_only(&mut self, reason: &str);

    fn is_rollback_only(&self) -> bool;

    /// Register a listener run (in registration order) before commit.
    fn before_commit(&mut self, name: &str, listener: BeforeCommitListener);

    /// Stage an effect applied on successful commit.
    fn on_commit(&mut self, action: CommitAction);
}

/// A running transaction, owned by the dispatcher.
pub trait Transaction: TransactionHandle + Send {
    fn commit(self) -> Result<(), TransactionError>;

    fn rollback(self);
}

/// Factory for transactions (the persistence engine's unit of work).
pub trait TransactionManager: Send + Sync {
    type Tx: Transaction;

    fn begin(&self) -> Result<Self::Tx, TransactionError>;
}

impl<M> TransactionManager for std::sync::Arc<M>
where
    M: TransactionManager + ?Sized,
{
    type Tx = M::Tx;

    fn begin(&self) -> Result<Self::Tx, TransactionError> {
        (**self).begin()
    }
}

/// In-process transaction: staged effects are applied on commit and dropped
/// on rollback.
#[derive(Default)]
pub struct LocalTransaction {
    rollback_only: Option<String>,
    listeners: Vec<(String, BeforeCommitListener)>,
    actions: Vec<CommitAction>,
}

impl LocalTransaction {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("rollback_only", &self.rollback_only)
            .field("listeners", &self.listeners.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl TransactionHandle for LocalTransaction {
    fn set_rollback_only(&mut self, reason: &str) {
        if self.rollback_only.is_none() {
            self.rollback_only = Some(reason.to_string());
        }
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.is_some()
    }

    fn before_commit(&mut self, name: &str, listener: BeforeCommitListener) {
        self.listeners.push((name.to_string(), listener));
    }

    fn on_commit(&mut self, action: CommitAction) {
        self.actions.push(action);
    }
}

impl Transaction for LocalTransaction {
    fn commit(self) -> Result<(), TransactionError> {
        if let Some(reason) = self.rollback_only {
            return Err(TransactionError::RollbackOnly { reason });
        }

        for (name, listener) in self.listeners {
            listener().map_err(|e| TransactionError::ListenerFailed {
                listener: name,
                source: e.into(),
            })?;
        }

        for action in self.actions {
            action();
        }
        Ok(())
    }

    fn rollback(self) {}
}

/// Hands out [`LocalTransaction`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransactionManager;

impl TransactionManager for LocalTransactionManager {
    type Tx = LocalTransaction;

    fn begin(&self) -> Result<Self::Tx, TransactionError> {
        Ok(LocalTransaction::new())
    }
}
