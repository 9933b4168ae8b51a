use serde::{Deserialize, Serialize};

use super::Coins;

/// Store-assigned user identifier.
pub type UserId = i64;

/// A ledger participant.
///
/// The password is an opaque credential kept verbatim. It is never hashed
/// here and never serialized, so snapshots and exports do not leak it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Current balance. Only mutated by ledger operations under lock.
    pub balance: Coins,
}

/// Attributes for a user that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub name: String,
    pub password: String,
    pub balance: Coins,
}

impl NewUser {
    pub fn new(name: impl Into<String>, password: impl Into<String>, balance: Coins) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            balance,
        }
    }

    /// Attach the identifier the store assigned on insert.
    pub fn into_user(self, user_id: UserId) -> User {
        User {
            user_id,
            name: self.name,
            password: self.password,
            balance: self.balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_user_keeps_attributes() {
        let user = NewUser::new("Alice", "p", 1000).into_user(7);

        assert_eq!(user.user_id, 7);
        assert_eq!(user.name, "Alice");
        assert_eq!(user.password, "p");
        assert_eq!(user.balance, 1000);
    }

    #[test]
    fn test_password_not_serialized() {
        let user = NewUser::new("Bob", "secret", 10).into_user(1);
        let json = serde_json::to_string(&user).unwrap();

        assert!(!json.contains("secret"));
        assert!(json.contains("\"balance\":10"));
    }
}
