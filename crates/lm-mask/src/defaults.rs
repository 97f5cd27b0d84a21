//! Built-in GDPR pattern table.

pub const MASK_EMAIL: &str = "[EMAIL]";
pub const MASK_SSN: &str = "[SSN]";
pub const MASK_HETU: &str = "[HETU]";
pub const MASK_IBAN: &str = "[IBAN]";
pub const MASK_CARD: &str = "[CARD]";
pub const MASK_PHONE: &str = "[PHONE]";
pub const MASK_IP: &str = "[IP]";

/// Email addresses.
pub const EMAIL: &str = r"/[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}/";
/// US social security numbers (`123-45-6789`).
pub const US_SSN: &str = r"/\b\d{3}-\d{2}-\d{4}\b/";
/// Finnish personal identity codes (`131052-308T`).
pub const FINNISH_HETU: &str = r"/\b\d{6}[-+A-FU-Y]\d{3}[0-9A-Y]\b/";
/// International bank account numbers, with or without grouping spaces.
pub const IBAN: &str = r"/\b[A-Z]{2}\d{2}(?:\s?[A-Z0-9]{4}){2,7}(?:\s?[A-Z0-9]{1,4})?\b/";
/// 16-digit card numbers, optionally grouped by spaces or dashes.
pub const CREDIT_CARD: &str = r"/\b(?:\d{4}[ \-]?){3}\d{4}\b/";
/// International phone numbers (`+358 40 1234567`).
pub const PHONE: &str = r"/\+\d{1,3}[\s.\-]?\(?\d{1,4}\)?[\s.\-]?\d{3,4}[\s.\-]?\d{3,4}\b/";
/// IPv4 addresses.
pub const IPV4: &str = r"/\b(?:\d{1,3}\.){3}\d{1,3}\b/";

/// The default `(pattern, replacement)` chain, most specific first.
pub fn gdpr_patterns() -> Vec<(&'static str, &'static str)> {
    vec![
        (EMAIL, MASK_EMAIL),
        (IBAN, MASK_IBAN),
        (CREDIT_CARD, MASK_CARD),
        (FINNISH_HETU, MASK_HETU),
        (US_SSN, MASK_SSN),
        (PHONE, MASK_PHONE),
        (IPV4, MASK_IP),
    ]
}
