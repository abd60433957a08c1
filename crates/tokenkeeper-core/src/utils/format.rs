/// Characters of a token kept at the front when masking
const MASK_PREFIX_LEN: usize = 16;

/// Characters of a token kept at the end when masking
const MASK_SUFFIX_LEN: usize = 8;

/// Mask a bearer token for display and audit logs.
/// Keeps the first 16 and last 8 characters; tokens too short to mask
/// without exposing the whole value are hidden entirely.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= MASK_PREFIX_LEN + MASK_SUFFIX_LEN {
        return "...".to_string();
    }
    let prefix: String = chars[..MASK_PREFIX_LEN].iter().collect();
    let suffix: String = chars[chars.len() - MASK_SUFFIX_LEN..].iter().collect();
    format!("{}...{}", prefix, suffix)
}

/// Format remaining seconds as a countdown, e.g. "14m 5s".
/// Zero or negative input renders as "Expired".
pub fn format_countdown(seconds_remaining: i64) -> String {
    if seconds_remaining <= 0 {
        return "Expired".to_string();
    }
    let mins = seconds_remaining / 60;
    let secs = seconds_remaining % 60;
    format!("{}m {}s", mins, secs)
}

/// Format an epoch-seconds timestamp for display
pub fn format_timestamp(epoch_secs: i64) -> String {
    match chrono::DateTime::from_timestamp(epoch_secs, 0) {
        Some(dt) => dt.format("%b %d, %Y %H:%M:%S UTC").to_string(),
        None => epoch_secs.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token() {
        let token = "abcdefghijklmnopqrstuvwxyz0123456789";
        assert_eq!(mask_token(token), "abcdefghijklmnop...23456789");
        // Too short to mask safely
        assert_eq!(mask_token("short"), "...");
        assert_eq!(mask_token(""), "...");
        assert_eq!(mask_token("abcdefghijklmnopqrstuvwx"), "..."); // exactly 24
    }

    #[test]
    fn test_format_countdown() {
        assert_eq!(format_countdown(905), "15m 5s");
        assert_eq!(format_countdown(59), "0m 59s");
        assert_eq!(format_countdown(0), "Expired");
        assert_eq!(format_countdown(-30), "Expired");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "Jan 01, 1970 00:00:00 UTC");
    }
}
