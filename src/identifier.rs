// ============================================================================
// IDENTIFIER NORMALIZER
// ============================================================================
// Appliance metric keys are free text ("Avg time spent by getETLStreams() in
// ETL(0&raquo;1) (s/run)"). Channels need stable, bare names. Both functions
// here are pure and total: the same key yields the same name in every process.
// ============================================================================

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64;

use crate::FALLBACK_ATTRIBUTE_PREFIX;

/// Ordered textual substitutions applied before parameterizing.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("&raquo;", " to "),
    ("\u{bb}", " to "),
    ("/", " per "),
    ("ETL", " ETL "),
];

static UNWANTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[^a-z0-9\-_]+").expect("static regex"));
static REPEATED_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").expect("static regex"));
static CAMEL_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|_)(.)").expect("static regex"));
static ACRONYM_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").expect("static regex"));
static WORD_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z\d])([A-Z])").expect("static regex"));

/// Map an appliance metric key to a channel name.
///
/// ```
/// use archstats::normalize;
/// assert_eq!(
///     normalize("Avg time spent by getETLStreams() in ETL(0&raquo;1) (s/run)"),
///     "AvgTimeSpentByGetEtlStreamsInEtl0To1SPerRun",
/// );
/// ```
pub fn normalize(raw_key: &str) -> String {
    let mut key = raw_key.to_string();
    for (from, to) in SUBSTITUTIONS {
        key = key.replace(from, to);
    }

    camelize(&parameterize(&key).replace('-', "_"))
}

/// Derive the bare attribute name used as a document field for a channel.
///
/// Structural separators are folded into underscores. If the result still is
/// not a valid identifier, a name is synthesized from a seed-independent
/// content hash so restores keep matching across restarts.
pub fn to_attribute_name(channel_name: &str) -> String {
    let attr = underscore(channel_name).replace(':', "_");
    if is_identifier(&attr) {
        return attr;
    }

    let fallback = fallback_attribute_name(channel_name);
    warn!(
        target: "archstats::identifier",
        attribute = %attr,
        fallback = %fallback,
        "Invalid identifier, using content hash"
    );
    fallback
}

/// The hashed replacement name for `channel_name`.
pub fn fallback_attribute_name(channel_name: &str) -> String {
    format!("{}{:016x}", FALLBACK_ATTRIBUTE_PREFIX, xxh3_64(channel_name.as_bytes()))
}

/// ASCII-only, separator-collapsed, lowercase token.
fn parameterize(text: &str) -> String {
    let ascii: String = text.chars().filter(char::is_ascii).collect();
    let separated = UNWANTED.replace_all(&ascii, "-");
    let collapsed = REPEATED_SEPARATOR.replace_all(&separated, "-");
    let collapsed: &str = &collapsed;
    collapsed
        .strip_prefix('-')
        .unwrap_or(collapsed)
        .trim_end_matches('-')
        .to_lowercase()
}

fn camelize(text: &str) -> String {
    CAMEL_BOUNDARY
        .replace_all(text, |caps: &regex::Captures<'_>| caps[1].to_uppercase())
        .into_owned()
}

fn underscore(text: &str) -> String {
    let text = ACRONYM_BOUNDARY.replace_all(text, "${1}_${2}");
    let text = WORD_BOUNDARY.replace_all(&text, "${1}_${2}");
    text.replace('-', "_").to_lowercase()
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("Avg time spent by getETLStreams() in ETL(0&raquo;1) (s/run)", "AvgTimeSpentByGetEtlStreamsInEtl0To1SPerRun")]
    #[case("Total PV count", "TotalPvCount")]
    #[case("Data Rate in (GB/day)", "DataRateInGbPerDay")]
    #[case("eventrate", "Eventrate")]
    #[case("Event rate", "EventRate")]
    #[case("eventRate", "Eventrate")]
    #[case("Estimated bytes transferred in ETL(MB)", "EstimatedBytesTransferredInEtlMb")]
    #[case("  --weird__key--  ", "Weird_key")]
    #[case("", "")]
    fn test_normalize(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize(raw), expected);
    }

    #[test]
    fn test_normalize_drops_non_ascii() {
        assert_eq!(normalize("Latency (µs)"), "LatencyS");
        assert_eq!(normalize("ETL(0\u{bb}1)"), "Etl0To1");
    }

    #[rstest]
    #[case("TotalPvCount", "total_pv_count")]
    #[case("appliance0:ConnectedPvCount", "appliance0_connected_pv_count")]
    #[case("HTTPServerUp", "http_server_up")]
    fn test_attribute_names(#[case] channel: &str, #[case] expected: &str) {
        assert_eq!(to_attribute_name(channel), expected);
    }

    #[test]
    fn test_attribute_fallback_is_stable() {
        let first = to_attribute_name("0appliance:Status");
        let second = to_attribute_name("0appliance:Status");
        assert!(first.starts_with(FALLBACK_ATTRIBUTE_PREFIX));
        assert_eq!(first, second);
        // xxh3 is unseeded: the value is fixed for every process
        assert_eq!(first, format!("json_{:016x}", xxh3_64(b"0appliance:Status")));
        assert_ne!(first, to_attribute_name("1appliance:Status"));
    }

    #[test]
    fn test_empty_channel_name_gets_fallback() {
        assert!(to_attribute_name("").starts_with(FALLBACK_ATTRIBUTE_PREFIX));
    }

    proptest! {
        #[test]
        fn prop_normalize_is_deterministic_and_bare(key in ".{0,64}") {
            let name = normalize(&key);
            prop_assert_eq!(&name, &normalize(&key));
            prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }

        #[test]
        fn prop_attribute_names_are_identifiers(key in ".{0,64}", instance in "[a-z0-9]{0,8}") {
            let channel = format!("{}:{}", instance, normalize(&key));
            prop_assert!(is_identifier(&to_attribute_name(&channel)));
        }
    }
}
