//! Balances and the transaction log.
//!
//! The store performs the balance check and both balance updates as a single
//! unit; this layer validates the request and reads the results back.

use std::collections::BTreeMap;

use log::info;
use thiserror::Error;

use crate::backend::{Result, Store, StoreError};
use crate::transaction::{Amount, Transaction, TransactionId};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Users must exist")]
    UnknownUser,

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Recipient balance limit exceeded")]
    BalanceOverflow,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A user whose cached balance disagrees with the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub username: String,
    pub cached: Amount,
    pub logged: Amount,
}

pub struct Ledger<'a> {
    store: &'a dyn Store,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Unknown and absent users (the mint source) hold nothing.
    pub async fn balance(&self, username: Option<&str>) -> Result<Amount> {
        let Some(username) = username else {
            return Ok(0);
        };

        Ok(self
            .store
            .find_user(username)
            .await?
            .map_or(0, |user| user.balance))
    }

    pub async fn transfer(
        &self,
        from: Option<&str>,
        to: &str,
        amount: Amount,
    ) -> std::result::Result<TransactionId, TransferError> {
        if amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }

        let id = self.store.transfer(from, to, amount).await?;

        match from {
            Some(from) => info!("tx {id}: {from} -> {to}, {amount}"),
            None => info!("tx {id}: minted {amount} for {to}"),
        }
        Ok(id)
    }

    pub async fn mint(
        &self,
        to: &str,
        amount: Amount,
    ) -> std::result::Result<TransactionId, TransferError> {
        self.transfer(None, to, amount).await
    }

    pub async fn history(&self, username: &str) -> Result<Vec<Transaction>> {
        self.store.transactions(Some(username)).await
    }

    /// Replay the whole log and compare against every cached balance.
    pub async fn audit(&self) -> Result<Vec<Mismatch>> {
        let mut logged = BTreeMap::<String, Amount>::new();

        for tx in self.store.transactions(None).await? {
            *logged.entry(tx.recipient.clone()).or_default() += tx.amount;
            if let Some(sender) = tx.sender {
                *logged.entry(sender).or_default() -= tx.amount;
            }
        }

        let mut mismatches = vec![];
        for user in self.store.users().await? {
            let expected = logged.remove(&user.username).unwrap_or(0);
            if expected != user.balance {
                mismatches.push(Mismatch {
                    username: user.username,
                    cached: user.balance,
                    logged: expected,
                });
            }
        }

        // the log mentions users that don't exist
        for (username, amount) in logged {
            mismatches.push(Mismatch {
                username,
                cached: 0,
                logged: amount,
            });
        }

        Ok(mismatches)
    }
}
