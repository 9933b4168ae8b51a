use serde::{Deserialize, Serialize};

use super::{Coins, UserId};

pub type MerchId = i64;
pub type PurchaseId = i64;

/// An item from the shop catalogue. Prices are read-only to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merch {
    pub merch_id: MerchId,
    /// Descriptive label, e.g. "t-shirt"
    #[serde(rename = "type")]
    pub merch_type: String,
    /// Unit price in coins
    pub price: Coins,
}

/// A completed purchase. Immutable, append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub purchase_id: PurchaseId,
    pub user_id: UserId,
    pub merch_id: MerchId,
    /// Quantity bought, not a monetary value
    pub amount: i64,
}
