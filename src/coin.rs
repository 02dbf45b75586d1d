use std::{result, sync::Arc};

use log::{error, info, warn};
use warp::http;

use crate::api::{self, LoginSession, SessionCheck, SessionUser};
use crate::auth::SessionToken;
use crate::backend::{Store, StoreError};
use crate::credentials::{CreateUserError, CredentialStore};
use crate::gate::Caller;
use crate::ledger::{Ledger, Mismatch, TransferError};
use crate::session::SessionStore;
use crate::time::Timestamp;

pub struct TmsaCoin {
    store: Arc<dyn Store>,
    session_ttl: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Internal,
    Unauthorized,
    /// Bad input or an expected refusal; the reason goes back to the client.
    BadRequest(String),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn reason(&self) -> &str {
        match self {
            Self::Internal => "Internal error",
            Self::Unauthorized => "Unauthorized",
            Self::BadRequest(reason) => reason,
        }
    }
}

impl From<&Error> for http::StatusCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::Internal => http::StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthorized => http::StatusCode::UNAUTHORIZED,
            Error::BadRequest(_) => http::StatusCode::BAD_REQUEST,
        }
    }
}

impl warp::reject::Reject for Error {}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        error!("store failure: {e}");
        Self::Internal
    }
}

impl From<TransferError> for Error {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Store(e) => e.into(),
            e => Self::BadRequest(e.to_string()),
        }
    }
}

impl From<CreateUserError> for Error {
    fn from(e: CreateUserError) -> Self {
        match e {
            CreateUserError::Store(e) => e.into(),
            e => Self::BadRequest(e.to_string()),
        }
    }
}

impl TmsaCoin {
    pub fn new(store: Arc<dyn Store>, session_ttl: u64) -> Self {
        Self { store, session_ttl }
    }

    fn ledger(&self) -> Ledger<'_> {
        Ledger::new(&*self.store)
    }

    fn credentials(&self) -> CredentialStore<'_> {
        CredentialStore::new(&*self.store)
    }

    fn sessions(&self) -> SessionStore<'_> {
        SessionStore::new(&*self.store)
    }

    pub async fn caller(&self, token: Option<&SessionToken>) -> Result<Caller> {
        Ok(Caller::resolve(&*self.store, token, now()?).await?)
    }

    pub async fn new_account(&self, caller: &Caller, req: api::NewAccount) -> Result<()> {
        let api::NewAccount {
            username,
            password,
            admin,
            token: _,
        } = req;

        self.credentials().create_user(&username, &password).await?;

        if admin {
            match caller.user() {
                Some(by) if caller.is_admin() => {
                    self.credentials().make_admin(&username).await?;
                    info!("{username}: made admin by {by}");
                }
                by => warn!("{username}: admin requested by non-admin {by:?}, ignoring"),
            }
        }

        Ok(())
    }

    pub async fn login(&self, req: api::Login) -> Result<LoginSession> {
        let api::Login { username, password } = req;

        if !self
            .credentials()
            .verify_password(&username, &password)
            .await?
        {
            error!("failed login for user {username:?}");
            return Err(Error::Unauthorized);
        }

        let session = self
            .sessions()
            .create(&username, self.session_ttl, now()?)
            .await?;
        let admin = self.credentials().is_admin(Some(&username)).await?;

        info!("{username} login");
        Ok(LoginSession {
            token: session.token,
            max_age: self.session_ttl,
            user: SessionUser {
                name: username,
                admin,
            },
        })
    }

    pub async fn logout(&self, token: Option<&SessionToken>) -> Result<()> {
        let token = token.ok_or_else(|| Error::BadRequest("Must have token".into()))?;

        self.sessions().delete(token).await?;
        info!("logout of session {}", token.short());
        Ok(())
    }

    pub async fn mint(&self, caller: &Caller, req: api::Mint) -> Result<()> {
        if !caller.is_admin() {
            error!("mint refused for non-admin {:?}", caller.user());
            return Err(Error::Unauthorized);
        }

        self.ledger().mint(&req.recipient, req.amount).await?;
        Ok(())
    }

    pub async fn transfer(&self, caller: &Caller, req: api::Transfer) -> Result<()> {
        let Some(from) = caller.user() else {
            error!("transfer refused without a session");
            return Err(Error::Unauthorized);
        };

        self.ledger()
            .transfer(Some(from), &req.to, req.amount)
            .await
            .map_err(|e| {
                if !matches!(e, TransferError::Store(_)) {
                    info!("{from} -> {}, {}: {e}", req.to, req.amount);
                }
                e
            })?;
        Ok(())
    }

    pub async fn balance(&self, username: Option<&str>) -> Result<api::Balance> {
        let balance = self.ledger().balance(username).await?;
        Ok(api::Balance { balance })
    }

    pub async fn history(&self, caller: &Caller) -> Result<api::History> {
        let username = caller.user().ok_or(Error::Unauthorized)?;
        let transactions = self.ledger().history(username).await?;
        Ok(api::History { transactions })
    }

    pub async fn check_session(&self, token: Option<&SessionToken>) -> Result<SessionCheck> {
        let caller = self.caller(token).await?;

        Ok(match caller.user() {
            Some(user) => SessionCheck {
                valid: true,
                user: Some(user.into()),
                admin: Some(caller.is_admin()),
            },
            None => SessionCheck {
                valid: false,
                user: None,
                admin: None,
            },
        })
    }

    /// Grant admin to an existing user. Used at startup to seed the first admin.
    /// Their current session is dropped so the next login reports the flag.
    pub async fn promote(&self, username: &str) -> Result<()> {
        if self.store.find_user(username).await?.is_none() {
            warn!("can't make unknown user {username:?} an admin");
            return Ok(());
        }

        self.credentials().make_admin(username).await?;
        self.sessions().clear_user(username).await?;
        info!("{username}: admin");
        Ok(())
    }

    pub async fn audit(&self) -> Result<Vec<Mismatch>> {
        let mismatches = self.ledger().audit().await?;
        for m in &mismatches {
            warn!(
                "audit: {}: cached balance {}, transaction log says {}",
                m.username, m.cached, m.logged
            );
        }
        match mismatches.len() {
            0 => info!("audit: balances match the transaction log"),
            n => error!("audit: {n} balances disagree with the transaction log"),
        }
        Ok(mismatches)
    }

    pub async fn reap_sessions(&self) -> Result<u64> {
        Ok(self.sessions().reap(now()?).await?)
    }
}

fn now() -> Result<Timestamp> {
    Timestamp::now().map_err(|()| Error::Internal)
}
