//! Parsing of monetary amounts in free text ("£350,000", "400k", "$1.2m").

use std::sync::LazyLock;

use regex::Regex;

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([£$€])?\s?(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)(?:\s?([km])\b)?")
        .expect("Invalid amount regex")
});

/// Amounts below this are treated as counts (bedrooms, floors), not money.
pub const MIN_AMOUNT: u64 = 100;

/// One amount found in text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Amount {
    /// Byte offset of the match, including any currency symbol.
    pub start: usize,
    /// The matched text.
    pub text: String,
    pub value: u64,
    pub has_currency: bool,
}

/// Every amount in `text` of at least [`MIN_AMOUNT`].
pub fn amounts_in(text: &str) -> Vec<Amount> {
    AMOUNT_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let digits = caps.get(2)?.as_str().replace(',', "");
            let mut value: f64 = digits.parse().ok()?;
            match caps.get(3).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(ref s) if s == "k" => value *= 1_000.0,
                Some(ref s) if s == "m" => value *= 1_000_000.0,
                _ => {}
            }
            let value = value.round() as u64;
            (value >= MIN_AMOUNT).then(|| Amount {
                start: whole.start(),
                text: whole.as_str().trim().to_string(),
                value,
                has_currency: caps.get(1).is_some(),
            })
        })
        .collect()
}

/// Amounts written with a currency symbol, the form prices take in replies.
pub fn currency_amounts(text: &str) -> Vec<Amount> {
    amounts_in(text).into_iter().filter(|a| a.has_currency).collect()
}
