use serde::{Deserialize, Serialize};

use super::{Coins, UserId};

pub type OperationId = i64;

/// A completed coin transfer between two users.
/// One row is shared by the sender's and the receiver's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OperationId,
    pub from_user: UserId,
    pub to_user: UserId,
    pub amount: Coins,
}

impl Operation {
    /// Returns true if the user sent or received this transfer.
    pub fn involves(&self, user_id: UserId) -> bool {
        self.from_user == user_id || self.to_user == user_id
    }

    /// Signed effect of this transfer on the given user's balance.
    pub fn net_effect_for(&self, user_id: UserId) -> Coins {
        let mut net = 0;
        if self.to_user == user_id {
            net += self.amount;
        }
        if self.from_user == user_id {
            net -= self.amount;
        }
        net
    }
}
