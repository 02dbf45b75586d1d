use log::{error, info, warn};
use thiserror::Error;

use crate::auth::{hash_password, new_salt};
use crate::backend::{Result, Store, StoreError};
use crate::user::User;

const USERNAME_MAX_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("Username must be 1-32 letters, digits, '-' or '_'")]
    InvalidUsername,

    #[error("Password must not be empty")]
    InvalidPassword,

    #[error("User already exists")]
    AlreadyExists,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Usernames double as file-backend path components, so keep them boring.
pub fn valid_username(username: &str) -> bool {
    (1..=USERNAME_MAX_LEN).contains(&username.len())
        && username
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub struct CredentialStore<'a> {
    store: &'a dyn Store,
}

impl<'a> CredentialStore<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<(), CreateUserError> {
        if !valid_username(username) {
            return Err(CreateUserError::InvalidUsername);
        }
        if password.is_empty() {
            return Err(CreateUserError::InvalidPassword);
        }

        let salt = new_salt();
        let pwhash = hash_password(password, &salt);

        self.store
            .create_user(&User::new(username.into(), pwhash, salt))
            .await
            .map_err(|e| {
                match &e {
                    CreateUserError::AlreadyExists => warn!("{username}: already exists"),
                    CreateUserError::Store(e) => error!("{username}: couldn't create: {e}"),
                    _ => {}
                }
                e
            })?;

        info!("{username}: created");
        Ok(())
    }

    pub async fn verify_password(&self, username: &str, password: &str) -> Result<bool> {
        let Some(user) = self.store.find_user(username).await? else {
            return Ok(false);
        };

        Ok(hash_password(password, &user.salt) == user.pwhash)
    }

    pub async fn make_admin(&self, username: &str) -> Result<()> {
        self.store.set_admin(username).await
    }

    pub async fn is_admin(&self, username: Option<&str>) -> Result<bool> {
        let Some(username) = username else {
            return Ok(false);
        };

        Ok(self
            .store
            .find_user(username)
            .await?
            .map_or(false, |user| user.admin))
    }
}
