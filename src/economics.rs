/// Economics module: payment and loyalty amounts exchanged with the settlement contract
use crate::error::{ReservationError, Result};

/// Fractional digits of contract token amounts.
pub const TOKEN_DECIMALS: u32 = 7;

/// Loyalty grant the contract sends when a visit completes (100 whole tokens).
pub const CONTRACT_LOYALTY_GRANT: i128 = 100 * 10i128.pow(TOKEN_DECIMALS);

/// One loyalty token per 100 units of currency spent.
pub fn calculate_loyalty_tokens(amount: u64) -> u64 {
    amount / 100
}

/// Convert a decimal amount string ("12.5") into contract base units.
pub fn to_base_units(amount: &str) -> Result<i128> {
    let invalid = || ReservationError::InvalidInput(format!("Invalid amount '{}'", amount));
    let amount = amount.trim();
    let (whole, frac) = amount.split_once('.').unwrap_or((amount, ""));

    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > TOKEN_DECIMALS as usize {
        return Err(ReservationError::InvalidInput(format!(
            "Amount '{}' has more than {} decimal places",
            amount, TOKEN_DECIMALS
        )));
    }

    let whole: i128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let padded = format!("{:0<width$}", frac, width = TOKEN_DECIMALS as usize);
    let frac: i128 = padded.parse().map_err(|_| invalid())?;

    whole
        .checked_mul(10i128.pow(TOKEN_DECIMALS))
        .and_then(|w| w.checked_add(frac))
        .filter(|units| *units > 0)
        .ok_or_else(|| ReservationError::InvalidInput(format!("Amount '{}' out of range", amount)))
}

/// Render base units back into a decimal string without trailing zeros.
pub fn format_base_units(units: i128) -> String {
    let scale = 10i128.pow(TOKEN_DECIMALS);
    let whole = units / scale;
    let frac = (units % scale).abs();
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac, width = TOKEN_DECIMALS as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
