//! Fixed-Point Money and Multipliers
//!
//! All balance arithmetic uses integers. Floats exist only at the JSON
//! boundary, where amounts are converted once and never fed back into
//! settlement math.
//!
//! ## Formats
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Amount      i64, 9 decimal places (nano-units)             │
//! │              1.00 TON  = 1_000_000_000                      │
//! │              0.10 TON  =   100_000_000                      │
//! │                                                             │
//! │  Multiplier  u64, hundredths                                │
//! │              1.00x = 100   2.35x = 235   10000x = 1_000_000 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

/// Monetary amount in nano-units (9 decimal places).
pub type Amount = i64;

/// Number of decimal places carried by [`Amount`].
pub const AMOUNT_DECIMALS: u32 = 9;

/// 1.0 as an [`Amount`].
pub const AMOUNT_ONE: Amount = 1_000_000_000;

/// Crash multiplier in hundredths.
pub type Multiplier = u64;

/// 1.00x, the lowest multiplier a round can crash at.
pub const MULTIPLIER_ONE: Multiplier = 100;

/// Convert a display value to an [`Amount`], rounding to the nearest unit.
///
/// Returns `None` for NaN, infinities and values outside the `i64` range.
///
/// # Example
/// ```
/// use crash_wager::core::amount::{to_amount, AMOUNT_ONE};
/// assert_eq!(to_amount(0.1), Some(AMOUNT_ONE / 10));
/// assert_eq!(to_amount(f64::NAN), None);
/// ```
pub fn to_amount(value: f64) -> Option<Amount> {
    if !value.is_finite() {
        return None;
    }
    let scaled = (value * AMOUNT_ONE as f64).round();
    if scaled < i64::MIN as f64 || scaled > i64::MAX as f64 {
        return None;
    }
    Some(scaled as Amount)
}

/// Convert an [`Amount`] to a float for display and JSON output.
#[inline]
pub fn to_float(amount: Amount) -> f64 {
    amount as f64 / AMOUNT_ONE as f64
}

/// Parse a decimal string such as `"1.08"` exactly, without going through `f64`.
///
/// At most [`AMOUNT_DECIMALS`] fractional digits are accepted.
pub fn parse_amount(s: &str) -> Option<Amount> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.len() > AMOUNT_DECIMALS as usize {
        return None;
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: i64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac: i64 = if frac_part.is_empty() { 0 } else { frac_part.parse().ok()? };
    for _ in frac_part.len()..AMOUNT_DECIMALS as usize {
        frac *= 10;
    }

    let value = whole.checked_mul(AMOUNT_ONE)?.checked_add(frac)?;
    Some(if negative { -value } else { value })
}

/// Render an [`Amount`] as a decimal string with trailing zeros trimmed.
pub fn format_amount(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let one = AMOUNT_ONE as u64;
    let whole = abs / one;
    let frac = abs % one;
    if frac == 0 {
        return format!("{}{}", sign, whole);
    }
    let frac = format!("{:09}", frac);
    format!("{}{}.{}", sign, whole, frac.trim_end_matches('0'))
}

/// Payout for `stake` locked in at `multiplier`: `floor(stake * multiplier / 100)`.
///
/// Returns `None` on overflow or a negative stake.
#[inline]
pub fn apply_multiplier(stake: Amount, multiplier: Multiplier) -> Option<Amount> {
    if stake < 0 {
        return None;
    }
    let wide = (stake as i128).checked_mul(multiplier as i128)? / MULTIPLIER_ONE as i128;
    Amount::try_from(wide).ok()
}

/// Convert a multiplier to a float for display.
#[inline]
pub fn multiplier_to_float(multiplier: Multiplier) -> f64 {
    multiplier as f64 / MULTIPLIER_ONE as f64
}

// =============================================================================
// TESTS
// =============================================================================
