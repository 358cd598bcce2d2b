//! Input validation for input nodes.
//!
//! Each validator returns the canonical value to store, or `None` when the
//! reply does not satisfy the node's rule (the engine then re-prompts
//! without advancing).

use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;

/// Accepted date shapes, tried in order.
pub const DATE_FORMATS: [&str; 4] = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y", "%d/%m/%y"];

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap())
}

/// Numeric input; comma accepted as decimal separator, optional bounds.
pub fn number(raw: &str, min: Option<f64>, max: Option<f64>) -> Option<String> {
    let normalized = raw.trim().replace(',', ".");
    let value = normalized.parse::<f64>().ok().filter(|n| n.is_finite())?;
    if min.is_some_and(|m| value < m) || max.is_some_and(|m| value > m) {
        return None;
    }
    // `42.0` and `42` both store as "42"; fractional values keep their digits.
    Some(format!("{}", value))
}

/// Email input.
pub fn email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    email_re().is_match(trimmed).then(|| trimmed.to_string())
}

/// Phone input: strip everything but digits, require 10 or 11 of them.
pub fn phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (10..=11).contains(&digits.len()).then_some(digits)
}

/// Date input: one of [`DATE_FORMATS`], with a strict round-trip so only an
/// exactly-shaped value passes (no `5/1/2024` for `%d/%m/%Y`).
pub fn date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, format) {
            if parsed.format(format).to_string() == trimmed {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Free-text input with optional length bounds.
pub fn text(raw: &str, min_length: Option<usize>, max_length: Option<usize>) -> Option<String> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if min_length.is_some_and(|m| len < m) || max_length.is_some_and(|m| len > m) {
        return None;
    }
    Some(trimmed.to_string())
}

/// Default re-prompt per input kind, used when the node carries none.
pub fn default_error_message(tag: &str) -> &'static str {
    match tag {
        "input_number" => "Please reply with a number.",
        "input_email" => "That doesn't look like a valid e-mail. Please try again.",
        "input_phone" => "Please reply with a phone number including the area code.",
        "input_date" => "Please reply with a date like 31/12/2025.",
        _ => "Sorry, I couldn't understand that. Please try again.",
    }
}
