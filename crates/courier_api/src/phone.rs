//! North-American phone normalization. The canonical `+1XXXXXXXXXX` form is
//! the join key between contacts and conversations, so every phone field is
//! normalized through here before any write.

/// Normalize a raw phone string to canonical `+1XXXXXXXXXX` form.
///
/// Formatting characters (spaces, parens, dashes, dots) are stripped first;
/// the remainder must then be exactly `+1` plus 10 digits, `1` plus 10
/// digits, or 10 bare digits. Anything else is invalid.
pub fn normalize(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();

    if let Some(digits) = cleaned.strip_prefix("+1")
        && is_digits(digits, 10)
    {
        return Some(format!("+1{digits}"));
    }

    if let Some(digits) = cleaned.strip_prefix('1')
        && is_digits(digits, 10)
    {
        return Some(format!("+1{digits}"));
    }

    if is_digits(&cleaned, 10) {
        return Some(format!("+1{cleaned}"));
    }

    None
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_digit())
}
