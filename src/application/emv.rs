//! EMV tag decoding for chip, contactless and cardholder-verification features.

use crate::domain::features::{FeatureSet, UNKNOWN};
use std::collections::BTreeMap;

/// Tags the gateway understands, with their EMV Book names.
const TAG_DICTIONARY: &[(&str, &str)] = &[
    ("4F", "Application Identifier (AID)"),
    ("50", "Application Label"),
    ("57", "Track 2 Equivalent Data"),
    ("5A", "Application PAN"),
    ("5F2A", "Transaction Currency Code"),
    ("5F34", "PAN Sequence Number"),
    ("82", "Application Interchange Profile"),
    ("84", "Dedicated File Name"),
    ("8A", "Authorisation Response Code"),
    ("95", "Terminal Verification Results"),
    ("9A", "Transaction Date"),
    ("9C", "Transaction Type"),
    ("9F02", "Amount, Authorised"),
    ("9F03", "Amount, Other"),
    ("9F10", "Issuer Application Data"),
    ("9F1A", "Terminal Country Code"),
    ("9F26", "Application Cryptogram"),
    ("9F27", "Cryptogram Information Data"),
    ("9F33", "Terminal Capabilities"),
    ("9F34", "CVM Results"),
    ("9F35", "Terminal Type"),
    ("9F36", "Application Transaction Counter"),
    ("9F37", "Unpredictable Number"),
    ("9F39", "POS Entry Mode"),
    ("9F6E", "Form Factor Indicator"),
    ("9F7A", "VLP Terminal Support Indicator"),
];

/// POS entry mode for contactless chip reads.
const POS_ENTRY_CONTACTLESS: &str = "07";

pub fn tag_name(tag: &str) -> Option<&'static str> {
    TAG_DICTIONARY
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(tag))
        .map(|(_, name)| *name)
}

fn bytes(tags: &BTreeMap<String, String>, tag: &str) -> Option<Vec<u8>> {
    tags.get(tag).and_then(|value| hex::decode(value).ok())
}

/// Decodes the transaction's EMV tags into features.
///
/// Tags are expected upper-case with hex values. Malformed values decode to
/// the unknown sentinel rather than failing the extraction.
pub fn decode(tags: &BTreeMap<String, String>, features: &mut FeatureSet) {
    let chip = tags.contains_key("9F7A") || tags.contains_key("95");
    let contactless = tags.contains_key("9F6E")
        || tags.get("9F39").map(String::as_str) == Some(POS_ENTRY_CONTACTLESS);

    // First byte of CVM Results: bit 7 is "fail if unsuccessful", the low six
    // bits are the method code.
    let cvm_method = bytes(tags, "9F34")
        .and_then(|b| b.first().copied())
        .map_or(UNKNOWN, |b| i64::from(b & 0x3F));

    let aip_flags = bytes(tags, "82")
        .filter(|b| b.len() == 2)
        .map_or(UNKNOWN, |b| i64::from(u16::from_be_bytes([b[0], b[1]])));

    let aid = tags
        .get("4F")
        .filter(|v| hex::decode(v).is_ok())
        .cloned()
        .unwrap_or_default();

    let known = tags.keys().filter(|tag| tag_name(tag).is_some()).count();

    features.insert("is_chip_present", chip);
    features.insert("is_contactless", contactless);
    features.insert("cvm_method", cvm_method);
    features.insert("aip_flags", aip_flags);
    features.insert("aid", aid);
    features.insert("approval_code_present", tags.contains_key("8A"));
    features.insert("emv_known_tags", known as i64);
    features.insert("emv_unknown_tags", (tags.len() - known) as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_chip_read_with_signature() {
        let mut features = FeatureSet::new();
        decode(
            &tags(&[
                ("95", "0000008000"),
                ("9F34", "1E0300"),
                ("82", "1980"),
                ("4F", "A0000000031010"),
                ("8A", "3030"),
            ]),
            &mut features,
        );

        assert_eq!(features.get_bool("is_chip_present"), Some(true));
        assert_eq!(features.get_bool("is_contactless"), Some(false));
        assert_eq!(features.get_i64("cvm_method"), Some(0x1E));
        assert_eq!(features.get_i64("aip_flags"), Some(0x1980));
        assert_eq!(features.get_bool("approval_code_present"), Some(true));
        assert_eq!(features.get_i64("emv_known_tags"), Some(5));
    }

    #[test]
    fn test_contactless_from_entry_mode_or_form_factor() {
        let mut features = FeatureSet::new();
        decode(&tags(&[("9F39", "07")]), &mut features);
        assert_eq!(features.get_bool("is_contactless"), Some(true));

        let mut features = FeatureSet::new();
        decode(&tags(&[("9F6E", "20700000")]), &mut features);
        assert_eq!(features.get_bool("is_contactless"), Some(true));
    }

    #[test]
    fn test_missing_and_malformed_tags_use_sentinels() {
        let mut features = FeatureSet::new();
        decode(&tags(&[("9F34", "zz"), ("82", "19"), ("DF01", "00")]), &mut features);

        assert_eq!(features.get_i64("cvm_method"), Some(UNKNOWN));
        assert_eq!(features.get_i64("aip_flags"), Some(UNKNOWN));
        assert_eq!(features.get_text("aid"), Some(""));
        assert_eq!(features.get_i64("emv_unknown_tags"), Some(1));
    }

    #[test]
    fn test_dictionary_lookup_is_case_insensitive() {
        assert_eq!(tag_name("9f34"), Some("CVM Results"));
        assert_eq!(tag_name("FFFF"), None);
    }
}
