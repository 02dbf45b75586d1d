use crate::transaction::Amount;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "backend-sql", derive(sqlx::FromRow))]
pub struct User {
    pub username: String,
    pub pwhash: String,
    pub salt: String,
    pub admin: bool,
    /// Cached net of the transaction log for this user.
    pub balance: Amount,
}

impl User {
    pub fn new(username: String, pwhash: String, salt: String) -> Self {
        Self {
            username,
            pwhash,
            salt,
            admin: false,
            balance: 0,
        }
    }
}
