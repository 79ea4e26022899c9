use bitcoin::Amount;

/// Render an amount as BTC with all eight decimals, for logs.
pub fn format_btc_amount(amount: Amount) -> String {
    format!("{:.8} BTC", amount.to_btc())
}
