use serde::Serialize;

pub type Amount = i64;
pub type TransactionId = i64;

/// An entry in the append-only log. No sender means the amount was minted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "backend-sql", derive(sqlx::FromRow))]
pub struct Transaction {
    pub id: TransactionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub recipient: String,
    pub amount: Amount,
}
