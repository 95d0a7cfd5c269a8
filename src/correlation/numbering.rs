//! PBX numbering-plan heuristics.

/// Whether `number` looks like an externally dialable DID rather than an
/// internal extension: a `7` followed by nine more characters.
///
/// This matches the current PBX numbering plan only. It is not validated
/// against any canonical source and should not be generalised here.
pub fn is_did(number: &str) -> bool {
    number.starts_with('7') && number.chars().count() == 10
}

/// Optional-aware variant: a missing number is never a DID.
pub fn is_did_opt(number: Option<&str>) -> bool {
    number.map(is_did).unwrap_or(false)
}
