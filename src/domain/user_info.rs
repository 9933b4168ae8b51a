use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Operation, Purchase, User, UserId};

/// A user joined with the transfers and purchases that explain their balance.
/// Built in memory by the snapshot cache, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user: User,
    /// Transfers where the user is sender or receiver
    pub operations: Vec<Operation>,
    /// Purchases made by the user
    pub purchases: Vec<Purchase>,
}

impl UserInfo {
    pub fn new(user: User) -> Self {
        Self {
            user,
            operations: Vec::new(),
            purchases: Vec::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user.user_id
    }
}

/// Raw result of the three full-table scans feeding a snapshot.
#[derive(Debug, Clone, Default)]
pub struct LedgerScan {
    pub users: Vec<User>,
    pub operations: Vec<Operation>,
    pub purchases: Vec<Purchase>,
}

/// Join the three scans into one [`UserInfo`] per scanned user.
///
/// History rows that reference a user missing from the user scan are dropped
/// for that side only. A transfer from a user to themselves is attached once.
pub fn join_user_infos(scan: LedgerScan) -> HashMap<UserId, UserInfo> {
    let LedgerScan {
        users,
        operations,
        purchases,
    } = scan;

    let mut infos: HashMap<UserId, UserInfo> = users
        .into_iter()
        .map(|user| (user.user_id, UserInfo::new(user)))
        .collect();

    for operation in operations {
        if operation.from_user != operation.to_user {
            if let Some(info) = infos.get_mut(&operation.from_user) {
                info.operations.push(operation.clone());
            }
        }
        if let Some(info) = infos.get_mut(&operation.to_user) {
            info.operations.push(operation);
        }
    }

    for purchase in purchases {
        if let Some(info) = infos.get_mut(&purchase.user_id) {
            info.purchases.push(purchase);
        }
    }

    infos
}
