//! Persistent state behind one repository interface.
//!
//! The flat-file backend is the default; `--features backend-sql` swaps in
//! SQLite. Both own every user, transaction and session record, and each
//! trait method is atomic with respect to the others.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::auth::SessionToken;
use crate::credentials::CreateUserError;
use crate::ledger::TransferError;
use crate::session::Session;
use crate::time::Timestamp;
use crate::transaction::{Amount, Transaction, TransactionId};
use crate::user::User;

pub mod backend_file;
#[cfg(feature = "backend-sql")]
pub mod backend_sql;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "backend-sql")]
    #[error("sql: {0}")]
    Sql(#[from] sqlx::Error),

    #[cfg(feature = "backend-sql")]
    #[error("migration: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("no such user: {0}")]
    UnknownUser(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<User>>;

    /// Fails with `AlreadyExists` when the username is taken.
    async fn create_user(&self, user: &User) -> Result<(), CreateUserError>;

    /// No-op for unknown users.
    async fn set_admin(&self, username: &str) -> Result<()>;

    async fn users(&self) -> Result<Vec<User>>;

    /// Check the sender's balance, append to the log and move the balances, as
    /// one unit. `from: None` mints. `amount` has already been validated.
    async fn transfer(
        &self,
        from: Option<&str>,
        to: &str,
        amount: Amount,
    ) -> Result<TransactionId, TransferError>;

    /// The log in id order, optionally only entries touching `username`.
    async fn transactions(&self, username: Option<&str>) -> Result<Vec<Transaction>>;

    /// Drop every session of `session.username`, then store `session`.
    async fn replace_session(&self, session: &Session) -> Result<()>;

    async fn find_session(&self, token: &SessionToken) -> Result<Option<Session>>;

    async fn delete_session(&self, token: &SessionToken) -> Result<()>;

    async fn delete_user_sessions(&self, username: &str) -> Result<()>;

    /// Returns how many sessions expired before `now`.
    async fn delete_expired_sessions(&self, now: Timestamp) -> Result<u64>;
}

pub async fn open(data_dir: &Path) -> Result<Arc<dyn Store>> {
    #[cfg(feature = "backend-sql")]
    {
        let backend = backend_sql::Backend::new(data_dir).await?;
        return Ok(Arc::new(backend));
    }

    #[cfg(not(feature = "backend-sql"))]
    {
        let backend = backend_file::Backend::new(data_dir).await?;
        Ok(Arc::new(backend))
    }
}
