use once_cell::sync::Lazy;
use regex::Regex;

static MAC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[0-9A-Fa-f]{2}(?:[:-][0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{12})$")
        .expect("MAC regex is valid")
});

/// Canonical upper-case colon form, or None when the input is not a MAC address
pub fn normalize_mac(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if !MAC_PATTERN.is_match(raw) {
        return None;
    }
    let hex: Vec<char> = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    Some(
        hex.chunks(2)
            .map(|pair| pair.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(":"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_spellings() {
        for raw in ["aa:bb:cc:dd:ee:ff", "AA-BB-CC-DD-EE-FF", "aabbccddeeff", " AA:BB:CC:DD:EE:FF "] {
            assert_eq!(normalize_mac(raw).as_deref(), Some("AA:BB:CC:DD:EE:FF"), "{}", raw);
        }
    }

    #[test]
    fn rejects_malformed() {
        for raw in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FG", "AABBCCDDEEF", "AA::BB:CC:DD:EE:FF", "hello"] {
            assert_eq!(normalize_mac(raw), None, "{}", raw);
        }
    }
}
