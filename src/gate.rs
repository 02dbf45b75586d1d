use crate::auth::SessionToken;
use crate::backend::{Result, Store};
use crate::credentials::CredentialStore;
use crate::session::SessionStore;
use crate::time::Timestamp;

/// Who is making a request, as far as their token says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    user: Option<String>,
    admin: bool,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub async fn resolve(
        store: &dyn Store,
        token: Option<&SessionToken>,
        now: Timestamp,
    ) -> Result<Self> {
        let Some(token) = token else {
            return Ok(Self::anonymous());
        };

        let user = SessionStore::new(store).user(token, now).await?;
        let admin = CredentialStore::new(store).is_admin(user.as_deref()).await?;

        Ok(Self { user, admin })
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }
}
