//! PO Box detection and carrier compatibility.

use crate::model::Carrier;
use once_cell::sync::Lazy;
use regex::Regex;

static PO_BOX_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bP\.?\s*O\.?\s+BOX\b",     // P.O. Box, PO Box, P O Box
        r"(?i)\bPO\s+BOX\b",              // PO BOX
        r"(?i)\bP\.O\.B\.?\b",            // P.O.B, P.O.B.
        r"(?i)\bPOB\b",                   // POB
        r"(?i)\bPOST\s+OFFICE\s+BOX\b",   // POST OFFICE BOX
        r"(?i)\bBOX\s+\d+\b",             // Box 123 (only when followed by a number)
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid PO box pattern"))
    .collect()
});

/// Whether an address line contains a PO Box in any of its common spellings.
pub fn is_po_box(address_line: &str) -> bool {
    if address_line.trim().is_empty() {
        return false;
    }
    let normalized = address_line.split_whitespace().collect::<Vec<_>>().join(" ");
    PO_BOX_PATTERNS.iter().any(|re| re.is_match(&normalized))
}

/// Whether `carrier` can deliver to `address`.
///
/// Canada Post and USPS deliver to PO Boxes; UPS, DHL, FedEx and Purolator
/// do not. Carriers outside both sets are treated as compatible: blocking a
/// deliverable parcel costs more than a late rejection at the carrier.
pub fn is_deliverable(address: &str, carrier: Carrier) -> bool {
    if !is_po_box(address) {
        return true;
    }
    match carrier {
        Carrier::CanadaPost | Carrier::Usps => true,
        Carrier::Ups | Carrier::Dhl | Carrier::Fedex | Carrier::Purolator => false,
        _ => true,
    }
}

/// Operator-facing message for an incompatible PO Box destination.
pub fn po_box_conflict_message(carrier: Carrier) -> String {
    format!(
        "PO Box destination - {} cannot deliver to PO Box addresses. Use Canada Post instead.",
        carrier.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn po_box_variants_detected() {
        for addr in [
            "PO Box 456",
            "P.O. Box 789",
            "P O Box 123",
            "POB 456",
            "Post Office Box 789",
            "Box 123 Main St",
            "555 P.O.B. 123",
            "po box 9",
        ] {
            assert!(is_po_box(addr), "expected PO Box: {addr}");
        }
    }

    #[test]
    fn street_addresses_pass() {
        for addr in ["123 Main Street", "123 Boxwood Ave", "", "   "] {
            assert!(!is_po_box(addr), "false positive: {addr}");
        }
    }

    #[test]
    fn compatibility_by_carrier() {
        let addr = "PO Box 456";
        for carrier in [Carrier::Ups, Carrier::Dhl, Carrier::Fedex, Carrier::Purolator] {
            assert!(!is_deliverable(addr, carrier), "{carrier:?} should reject");
        }
        for carrier in [Carrier::CanadaPost, Carrier::Usps] {
            assert!(is_deliverable(addr, carrier), "{carrier:?} should accept");
        }
        // Unrecognized carriers fail open.
        assert!(is_deliverable(addr, Carrier::Unknown));
    }

    #[test]
    fn non_po_box_ok_for_everyone() {
        assert!(is_deliverable("123 Main Street", Carrier::Ups));
        assert!(is_deliverable("123 Main Street", Carrier::CanadaPost));
    }
}
