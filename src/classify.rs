//! Tracking number classification.
//!
//! Pure functions: normalize a raw barcode swipe into carrier + tracking
//! number, and split concatenated multi-label swipes (two labels scanned in
//! one pass arrive as a single string).

use crate::model::Carrier;

/// One classified tracking token from a raw scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub carrier: Carrier,
    pub number: String,
}

/// Classify a raw scan into one or more tracking tokens.
///
/// The raw string is trimmed, uppercased and stripped of known barcode
/// envelopes, then checked for concatenated labels. Unrecognizable input
/// yields a single `Carrier::Unknown` token rather than an error.
pub fn classify(raw: &str) -> Vec<Token> {
    let normalized = normalize(raw);
    split_concatenated(&normalized)
        .into_iter()
        .map(|number| Token {
            carrier: detect_carrier(&number),
            number,
        })
        .collect()
}

/// Detect carrier from tracking number shape.
pub fn detect_carrier(tracking: &str) -> Carrier {
    let tracking = tracking.trim().to_ascii_uppercase();

    // UPS: 1Z + 16 alphanumeric = 18 chars
    if tracking.starts_with("1Z") && tracking.len() == 18 {
        return Carrier::Ups;
    }

    // Canada Post: 16-digit PIN, commonly with a 2016 prefix; 13-char
    // international format like RR123456789CA.
    if tracking.starts_with("2016") || (tracking.len() == 16 && is_digits(&tracking)) {
        return Carrier::CanadaPost;
    }
    if tracking.len() == 13
        && tracking.ends_with("CA")
        && tracking[..2].chars().all(|c| c.is_ascii_alphabetic())
        && is_digits(&tracking[2..11])
    {
        return Carrier::CanadaPost;
    }

    // Purolator: 12 digits. This shape overlaps FedEx's 12-digit format;
    // domestic volume makes Purolator the right default for it.
    if tracking.len() == 12 && is_digits(&tracking) {
        return Carrier::Purolator;
    }

    // DHL: 10-11 digits
    if (tracking.len() == 10 || tracking.len() == 11) && is_digits(&tracking) {
        return Carrier::Dhl;
    }

    // FedEx: 15 digits (12-digit shapes already matched Purolator above)
    if tracking.len() == 15 && is_digits(&tracking) {
        return Carrier::Fedex;
    }

    // USPS: LA prefix or 20-30 char alphanumeric
    if tracking.starts_with("LA")
        || ((20..=30).contains(&tracking.len()) && tracking.chars().all(|c| c.is_ascii_alphanumeric()))
    {
        return Carrier::Usps;
    }

    Carrier::Unknown
}

/// Strip known barcode envelopes down to the embedded tracking number.
///
/// Scanners return the full label barcode for some carriers; the tracking
/// number is a fixed-offset payload inside it:
/// - Canada Post 28-char barcode: chars 7..23 are the 16-digit PIN
/// - Canada Post 22-char variant: chars 3..19
/// - Purolator 34-char barcode: chars 11..23 are the 12-digit PIN
pub fn normalize(raw: &str) -> String {
    let code = raw.trim().to_ascii_uppercase();

    if code.len() == 28 && is_digits(&code) {
        let payload = &code[7..23];
        if is_digits(payload) {
            return payload.to_string();
        }
    }
    if code.len() == 22 && is_digits(&code) {
        let payload = &code[3..19];
        if is_digits(payload) {
            return payload.to_string();
        }
    }
    if code.len() == 34 && is_digits(&code) {
        let payload = &code[11..23];
        if is_digits(payload) {
            return payload.to_string();
        }
    }

    code
}

/// Detect and split concatenated tracking numbers.
///
/// A split is only accepted when the total length is an exact multiple of a
/// single-label length and every equal-length segment independently matches
/// the same carrier format. Anything else stays a single token: a false
/// split is worse than an unknown scan.
pub fn split_concatenated(tracking: &str) -> Vec<String> {
    let tracking = tracking.trim();

    // Too short to hold two labels of any known format.
    if tracking.len() < 18 {
        return vec![tracking.to_string()];
    }

    // UPS: N 18-char segments, each starting with 1Z.
    if tracking.len() % 18 == 0 && tracking.starts_with("1Z") {
        let segments: Vec<&str> = chunk(tracking, 18);
        if segments.len() >= 2 && segments.iter().all(|s| is_valid_ups(s)) {
            return segments.iter().map(|s| s.to_string()).collect();
        }
    }

    // Canada Post: N 16-digit segments.
    if tracking.len() % 16 == 0 && tracking.len() >= 32 && is_digits(tracking) {
        let segments: Vec<&str> = chunk(tracking, 16);
        if segments.iter().all(|s| detect_carrier(s) == Carrier::CanadaPost) {
            return segments.iter().map(|s| s.to_string()).collect();
        }
    }

    // FedEx/Purolator: N 12-digit segments.
    if tracking.len() % 12 == 0 && tracking.len() >= 24 && is_digits(tracking) {
        let segments: Vec<&str> = chunk(tracking, 12);
        let first = detect_carrier(segments[0]);
        if first != Carrier::Unknown && segments.iter().all(|s| detect_carrier(s) == first) {
            return segments.iter().map(|s| s.to_string()).collect();
        }
    }

    // Fallback: multiple 1Z markers embedded in a longer string. Take the
    // non-overlapping valid 18-char UPS candidates if two or more exist.
    if tracking.matches("1Z").count() >= 2 {
        let bytes = tracking.as_bytes();
        let mut found: Vec<String> = Vec::new();
        let mut pos = 0usize;
        while pos + 18 <= bytes.len() {
            if &tracking[pos..pos + 2] == "1Z" && is_valid_ups(&tracking[pos..pos + 18]) {
                found.push(tracking[pos..pos + 18].to_string());
                pos += 18;
            } else {
                pos += 1;
            }
        }
        if found.len() >= 2 {
            return found;
        }
    }

    vec![tracking.to_string()]
}

/// UPS shape check: 1Z + 16 alphanumeric.
fn is_valid_ups(tracking: &str) -> bool {
    tracking.len() == 18
        && tracking.starts_with("1Z")
        && tracking[2..].chars().all(|c| c.is_ascii_alphanumeric())
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn chunk(s: &str, size: usize) -> Vec<&str> {
    (0..s.len() / size).map(|i| &s[i * size..(i + 1) * size]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_fixed_formats() {
        assert_eq!(detect_carrier("1ZAC50886738062302"), Carrier::Ups);
        assert_eq!(detect_carrier("2016987654321098"), Carrier::CanadaPost);
        assert_eq!(detect_carrier("7311123456789012"), Carrier::CanadaPost);
        assert_eq!(detect_carrier("RR123456789CA"), Carrier::CanadaPost);
        assert_eq!(detect_carrier("123456789012"), Carrier::Purolator);
        assert_eq!(detect_carrier("1234567890"), Carrier::Dhl);
        assert_eq!(detect_carrier("123456789012345"), Carrier::Fedex);
        assert_eq!(detect_carrier("LA123456789012345678"), Carrier::Usps);
        assert_eq!(detect_carrier("nonsense"), Carrier::Unknown);
    }

    #[test]
    fn strips_canada_post_envelope() {
        // 28-char barcode wraps the 16-digit PIN at offset 7.
        let raw = "1234567201698765432109812345";
        assert_eq!(normalize(raw), "2016987654321098");
        assert_eq!(detect_carrier(&normalize(raw)), Carrier::CanadaPost);
    }

    #[test]
    fn strips_purolator_envelope() {
        let raw = "0123456789912345678901212345678901";
        assert_eq!(raw.len(), 34);
        assert_eq!(normalize(raw), "123456789012");
    }

    #[test]
    fn splits_two_ups_labels() {
        let raw = "1ZAC508867380623021ZAC50882034286504";
        let tokens = classify(raw);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].number, "1ZAC50886738062302");
        assert_eq!(tokens[1].number, "1ZAC50882034286504");
        assert!(tokens.iter().all(|t| t.carrier == Carrier::Ups));
    }

    #[test]
    fn splits_three_ups_labels() {
        let raw = "1ZAC508867380623021ZAC508820342865041ZAC50880000000000";
        let tokens = classify(raw);
        assert_eq!(tokens.len(), 3);
        assert!(tokens.iter().all(|t| t.carrier == Carrier::Ups));
    }

    #[test]
    fn splits_two_canada_post_pins() {
        let raw = "20169876543210982016123456789012";
        let tokens = classify(raw);
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.carrier == Carrier::CanadaPost));
    }

    #[test]
    fn rejects_uneven_concatenation() {
        // 34 chars: two UPS-looking prefixes but not 2x18. Must stay whole.
        let raw = "1Z999AA101234567841Z888BB209876543";
        let tokens = classify(raw);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].carrier, Carrier::Unknown);
    }

    #[test]
    fn rejects_mixed_segment_split() {
        // 36 chars, starts with 1Z, but second half is not UPS-shaped
        // (contains a character outside the alphanumeric payload).
        let raw = "1ZAC508867380623021Z!C50882034286504";
        let tokens = classify(raw);
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn single_labels_pass_through() {
        assert_eq!(classify("1ZAC50886738062302").len(), 1);
        assert_eq!(classify("2016987654321098").len(), 1);
        assert_eq!(classify("1234567890").len(), 1);
    }

    #[test]
    fn scattered_ups_numbers_are_recovered() {
        // Garbage between two valid UPS numbers.
        let raw = "1ZAC50886738062302XX1ZAC50882034286504";
        let splits = split_concatenated(raw);
        assert_eq!(splits.len(), 2);
        assert!(splits.iter().all(|s| is_valid_ups(s)));
    }
}
