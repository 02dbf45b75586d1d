//! Request and response bodies, one pair per route.
//!
//! Anything carrying a password deliberately has no `Debug`.

use serde::{Deserialize, Serialize};

use crate::auth::SessionToken;
use crate::transaction::{Amount, Transaction};

#[derive(Deserialize)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    /// Only honoured when the caller is already an admin.
    #[serde(default)]
    pub admin: bool,
    /// Left unparsed here: a malformed token is an invalid session, not a
    /// malformed request.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Mint {
    pub recipient: String,
    pub amount: Amount,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Transfer {
    pub to: String,
    pub amount: Amount,
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct Login {
    pub username: String,
    pub password: String,
}

/// Body of `logout` and `check_session`.
#[derive(Debug, Deserialize, Default)]
pub struct TokenOnly {
    pub token: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginReply {
    pub success: bool,
    pub session: LoginSession,
}

#[derive(Debug, Serialize)]
pub struct LoginSession {
    pub token: SessionToken,
    pub max_age: u64,
    pub user: SessionUser,
}

#[derive(Debug, Serialize)]
pub struct SessionUser {
    pub name: String,
    pub admin: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Balance {
    pub balance: Amount,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SessionCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct History {
    pub transactions: Vec<Transaction>,
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn outcomes() {
        assert_eq!(
            serde_json::to_value(Outcome::ok()).unwrap(),
            json!({ "success": true })
        );
        assert_eq!(
            serde_json::to_value(Outcome::failed("Insufficient balance")).unwrap(),
            json!({ "success": false, "error": "Insufficient balance" })
        );
    }

    #[test]
    fn new_account_defaults() {
        let req: NewAccount =
            serde_json::from_value(json!({ "username": "alice", "password": "pw1" })).unwrap();
        assert!(!req.admin);
        assert!(req.token.is_none());
    }

    #[test]
    fn tokens_are_taken_as_given() {
        let req: TokenOnly = serde_json::from_value(json!({ "token": "dead-beef" })).unwrap();
        assert_eq!(req.token.as_deref(), Some("dead-beef"));
    }

    #[test]
    fn amounts_must_be_whole() {
        assert!(serde_json::from_value::<Transfer>(json!({ "to": "bob", "amount": 1.5 })).is_err());
        assert!(serde_json::from_value::<Mint>(json!({ "recipient": "bob" })).is_err());
    }

    #[test]
    fn invalid_sessions_omit_user() {
        let check = SessionCheck {
            valid: false,
            user: None,
            admin: None,
        };
        assert_eq!(serde_json::to_value(check).unwrap(), json!({ "valid": false }));
    }
}
