use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{error, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{query, query_as, Pool, Sqlite};
use tokio::sync::Mutex;

use crate::auth::SessionToken;
use crate::backend::{Result, Store, StoreError};
use crate::credentials::CreateUserError;
use crate::ledger::TransferError;
use crate::session::Session;
use crate::time::Timestamp;
use crate::transaction::{Amount, Transaction, TransactionId};
use crate::user::User;

/// SQLite behind a connection pool.
///
/// Each mutation runs in one SQL transaction. Writers additionally queue on
/// `write`, so a check-then-write sequence never races another one from this
/// process. The database file must not be shared between server processes.
pub struct Backend {
    pool: Pool<Sqlite>,
    write: Mutex<()>,
}

const USER_COLUMNS: &str =
    "username, pw_hash AS pwhash, salt, is_admin AS admin, balance_cache AS balance";

fn into_sql(path: &Path) -> PathBuf {
    path.join("coin.sql")
}

fn sql(e: sqlx::Error) -> StoreError {
    error!("sql: {e:?}");
    e.into()
}

impl Backend {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let db_path = into_sql(data_dir);
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(sql)?;

        info!("Using {}", db_path.display());
        Self::migrated(pool).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            error!("migration: {e:?}");
            e
        })?;

        Ok(Self {
            pool,
            write: Mutex::new(()),
        })
    }
}

#[async_trait]
impl Store for Backend {
    async fn find_user(&self, username: &str) -> Result<Option<User>> {
        query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql)
    }

    async fn create_user(&self, user: &User) -> Result<(), CreateUserError> {
        let _write = self.write.lock().await;

        let inserted = query(
            "
            INSERT INTO users
            (username, pw_hash, salt, is_admin, balance_cache)
            VALUES
            (?, ?, ?, ?, ?)
            ON CONFLICT
            DO NOTHING
            ",
        )
        .bind(&user.username)
        .bind(&user.pwhash)
        .bind(&user.salt)
        .bind(user.admin)
        .bind(user.balance)
        .execute(&self.pool)
        .await
        .map_err(sql)?
        .rows_affected();

        if inserted == 0 {
            return Err(CreateUserError::AlreadyExists);
        }
        Ok(())
    }

    async fn set_admin(&self, username: &str) -> Result<()> {
        let _write = self.write.lock().await;

        query("UPDATE users SET is_admin = TRUE WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(sql)?;
        Ok(())
    }

    async fn users(&self) -> Result<Vec<User>> {
        query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY username"))
            .fetch_all(&self.pool)
            .await
            .map_err(sql)
    }

    async fn transfer(
        &self,
        from: Option<&str>,
        to: &str,
        amount: Amount,
    ) -> Result<TransactionId, TransferError> {
        let _write = self.write.lock().await;
        // dropping `tx` before commit rolls everything back
        let mut tx = self.pool.begin().await.map_err(sql)?;

        let recipient_exists = query("SELECT 1 FROM users WHERE username = ?")
            .bind(to)
            .fetch_optional(&mut tx)
            .await
            .map_err(sql)?
            .is_some();
        if !recipient_exists {
            return Err(TransferError::UnknownUser);
        }

        if let Some(from) = from {
            let debited = query(
                "
                UPDATE users
                SET balance_cache = balance_cache - ?
                WHERE username = ?
                    AND balance_cache >= ?
                ",
            )
            .bind(amount)
            .bind(from)
            .bind(amount)
            .execute(&mut tx)
            .await
            .map_err(sql)?
            .rows_affected();

            if debited == 0 {
                let sender_exists = query("SELECT 1 FROM users WHERE username = ?")
                    .bind(from)
                    .fetch_optional(&mut tx)
                    .await
                    .map_err(sql)?
                    .is_some();

                return Err(if sender_exists {
                    TransferError::InsufficientBalance
                } else {
                    TransferError::UnknownUser
                });
            }
        }

        let credited = query(
            "
            UPDATE users
            SET balance_cache = balance_cache + ?
            WHERE username = ?
                AND balance_cache <= ?
            ",
        )
        .bind(amount)
        .bind(to)
        .bind(Amount::MAX - amount)
        .execute(&mut tx)
        .await
        .map_err(sql)?
        .rows_affected();

        if credited == 0 {
            return Err(TransferError::BalanceOverflow);
        }

        let id = query("INSERT INTO transactions (sender, recipient, amount) VALUES (?, ?, ?)")
            .bind(from)
            .bind(to)
            .bind(amount)
            .execute(&mut tx)
            .await
            .map_err(sql)?
            .last_insert_rowid();

        tx.commit().await.map_err(|e| {
            error!("error committing transaction: {:?}", e);
            StoreError::from(e)
        })?;

        Ok(id)
    }

    async fn transactions(&self, username: Option<&str>) -> Result<Vec<Transaction>> {
        query_as::<_, Transaction>(
            "
            SELECT id, sender, recipient, amount
            FROM transactions
            WHERE ? IS NULL
                OR sender = ?
                OR recipient = ?
            ORDER BY id
            ",
        )
        .bind(username)
        .bind(username)
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .map_err(sql)
    }

    async fn replace_session(&self, session: &Session) -> Result<()> {
        let _write = self.write.lock().await;
        let mut tx = self.pool.begin().await.map_err(sql)?;

        let user_exists = query("SELECT 1 FROM users WHERE username = ?")
            .bind(&session.username)
            .fetch_optional(&mut tx)
            .await
            .map_err(sql)?
            .is_some();
        if !user_exists {
            return Err(StoreError::UnknownUser(session.username.clone()));
        }

        query("DELETE FROM sessions WHERE username = ?")
            .bind(&session.username)
            .execute(&mut tx)
            .await
            .map_err(sql)?;

        query("INSERT INTO sessions (token, username, expiry) VALUES (?, ?, ?)")
            .bind(session.token.as_str())
            .bind(&session.username)
            .bind(session.expiry)
            .execute(&mut tx)
            .await
            .map_err(sql)?;

        tx.commit().await.map_err(sql)
    }

    async fn find_session(&self, token: &SessionToken) -> Result<Option<Session>> {
        let row = query_as::<_, (String, Timestamp)>(
            "SELECT username, expiry FROM sessions WHERE token = ?",
        )
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql)?;

        Ok(row.map(|(username, expiry)| Session {
            token: token.clone(),
            username,
            expiry,
        }))
    }

    async fn delete_session(&self, token: &SessionToken) -> Result<()> {
        let _write = self.write.lock().await;

        query("DELETE FROM sessions WHERE token = ?")
            .bind(token.as_str())
            .execute(&self.pool)
            .await
            .map_err(sql)?;
        Ok(())
    }

    async fn delete_user_sessions(&self, username: &str) -> Result<()> {
        let _write = self.write.lock().await;

        query("DELETE FROM sessions WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(sql)?;
        Ok(())
    }

    async fn delete_expired_sessions(&self, now: Timestamp) -> Result<u64> {
        let _write = self.write.lock().await;

        query("DELETE FROM sessions WHERE expiry < ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected())
            .map_err(sql)
    }
}
