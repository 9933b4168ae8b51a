/// Balances and prices are whole coins. There are no fractional units.
pub type Coins = i64;

/// Total cost of `count` items at `price` each.
/// Returns `None` when the product does not fit in a [`Coins`] value.
pub fn total_cost(price: Coins, count: i64) -> Option<Coins> {
    price.checked_mul(count)
}

/// Amounts moved between users or quantities bought must be strictly positive.
pub fn is_positive_amount(amount: i64) -> bool {
    amount > 0
}
