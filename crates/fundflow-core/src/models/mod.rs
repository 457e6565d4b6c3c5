use std::fmt::{self, Display};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod write;

/// Store-assigned account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(value: i64) -> Self {
        AccountId(value)
    }
}

/// Position of a record in the transfer log, strictly increasing.
pub type TransferId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub balance: Decimal,
}

/// An immutable entry in the transfer log.
///
/// `timestamp` never decreases from one record to the next in log order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub amount: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl TransferRecord {
    /// Picks the timestamp for a record appended after `previous`, holding it
    /// at `previous` if the wall clock has gone backwards.
    pub fn next_timestamp(previous: Option<OffsetDateTime>) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        match previous {
            Some(previous) if previous > now => previous,
            _ => now,
        }
    }
}
