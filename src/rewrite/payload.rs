//! Payload-aware replacement of one column value.
//!
//! A value is PHP-serialized, JSON, or plain text. Structured payloads are
//! parsed and only their string leaves are rewritten, recursively, so length
//! prefixes stay correct and bytes outside changed leaves are untouched.

use serde::de::IgnoredAny;

use super::php;

/// Recursion limit for payloads nested inside string leaves.
const MAX_NESTING: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Serialized,
    Json,
    Text,
}

#[derive(Debug, Clone)]
struct Rule {
    from: Vec<u8>,
    to: Vec<u8>,
}

/// Single-pass multi-pattern replacer.
///
/// At each position the longest matching `from` wins. A `to` that itself
/// contains some `from` is copied through untouched wherever it already
/// appears, so a second pass finds nothing to change.
#[derive(Debug, Clone)]
pub struct Replacer {
    rules: Vec<Rule>,
    protected: Vec<Vec<u8>>,
}

fn escape_slashes(s: &str) -> String {
    s.replace('/', "\\/")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Replacer {
    /// Build from `(from, to)` pairs. Pairs containing `/` also get their
    /// JSON-escaped form (`https:\/\/host`). Empty and identity pairs are
    /// dropped.
    pub fn new<S: AsRef<str>>(pairs: &[(S, S)]) -> Self {
        let mut rules: Vec<Rule> = Vec::new();
        let mut push = |from: String, to: String| {
            if from.is_empty() || from == to || rules.iter().any(|r| r.from == from.as_bytes()) {
                return;
            }
            rules.push(Rule {
                from: from.into_bytes(),
                to: to.into_bytes(),
            });
        };
        for (from, to) in pairs {
            let (from, to) = (from.as_ref(), to.as_ref());
            push(from.to_string(), to.to_string());
            if from.contains('/') {
                push(escape_slashes(from), escape_slashes(to));
            }
        }
        rules.sort_by(|a, b| b.from.len().cmp(&a.from.len()));

        let mut protected: Vec<Vec<u8>> = rules
            .iter()
            .filter(|r| rules.iter().any(|o| find(&r.to, &o.from).is_some()))
            .map(|r| r.to.clone())
            .collect();
        protected.sort_by(|a, b| b.len().cmp(&a.len()));
        protected.dedup();

        Self { rules, protected }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every byte sequence whose presence makes a value a candidate.
    pub fn needles(&self) -> Vec<Vec<u8>> {
        self.rules.iter().map(|r| r.from.clone()).collect()
    }

    pub fn matches(&self, input: &[u8]) -> bool {
        self.rules.iter().any(|r| find(input, &r.from).is_some())
    }

    /// Plain byte substitution. `None` when nothing changed.
    pub fn replace(&self, input: &[u8]) -> Option<Vec<u8>> {
        if !self.matches(input) {
            return None;
        }
        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        let mut changed = false;
        'scan: while i < input.len() {
            let rest = &input[i..];
            for p in &self.protected {
                if rest.starts_with(p) {
                    out.extend_from_slice(p);
                    i += p.len();
                    continue 'scan;
                }
            }
            for rule in &self.rules {
                if rest.starts_with(&rule.from) {
                    out.extend_from_slice(&rule.to);
                    i += rule.from.len();
                    changed = true;
                    continue 'scan;
                }
            }
            out.push(input[i]);
            i += 1;
        }
        changed.then_some(out)
    }
}

/// Result of rewriting one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub value: Vec<u8>,
    pub kind: PayloadKind,
    /// Structured payloads that failed to parse and were replaced as text.
    pub fallbacks: Vec<String>,
}

pub fn detect(input: &[u8]) -> PayloadKind {
    if php::looks_serialized(input) {
        PayloadKind::Serialized
    } else if looks_json(input) {
        PayloadKind::Json
    } else {
        PayloadKind::Text
    }
}

fn looks_json(input: &[u8]) -> bool {
    let trimmed = input.trim_ascii();
    matches!(trimmed.first(), Some(b'{' | b'['))
        && serde_json::from_slice::<IgnoredAny>(trimmed).is_ok()
}

/// Rewrite one column value. `None` when the value would not change.
pub fn rewrite(replacer: &Replacer, input: &[u8]) -> Option<Rewritten> {
    let mut fallbacks = Vec::new();
    let kind = detect(input);
    let value = rewrite_bytes(replacer, input, 0, &mut fallbacks)?;
    Some(Rewritten {
        value,
        kind,
        fallbacks,
    })
}

fn rewrite_bytes(
    replacer: &Replacer,
    input: &[u8],
    depth: usize,
    fallbacks: &mut Vec<String>,
) -> Option<Vec<u8>> {
    if !replacer.matches(input) {
        return None;
    }
    if depth >= MAX_NESTING {
        return replacer.replace(input);
    }
    match detect(input) {
        PayloadKind::Serialized => match php::parse(input) {
            Ok(mut value) => {
                let changed = value
                    .map_strings(&mut |leaf| rewrite_bytes(replacer, leaf, depth + 1, fallbacks));
                (changed > 0).then(|| php::emit(&value))
            }
            Err(e) => {
                fallbacks.push(e.to_string());
                replacer.replace(input)
            }
        },
        PayloadKind::Json => rewrite_json(replacer, input, depth, fallbacks),
        PayloadKind::Text => replacer.replace(input),
    }
}

/// Rewrite the string literals of a valid JSON document in place.
fn rewrite_json(
    replacer: &Replacer,
    input: &[u8],
    depth: usize,
    fallbacks: &mut Vec<String>,
) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut changed = false;
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'"' {
            out.push(input[i]);
            i += 1;
            continue;
        }
        let mut end = i + 1;
        while end < input.len() && input[end] != b'"' {
            end += if input[end] == b'\\' { 2 } else { 1 };
        }
        let literal = &input[i..(end + 1).min(input.len())];
        i = end + 1;

        let decoded: String = match serde_json::from_slice(literal) {
            Ok(s) => s,
            Err(_) => {
                out.extend_from_slice(literal);
                continue;
            }
        };
        match rewrite_bytes(replacer, decoded.as_bytes(), depth + 1, fallbacks)
            .and_then(|b| String::from_utf8(b).ok())
        {
            Some(new) => {
                out.extend_from_slice(encode_json_string(&new, literal).as_bytes());
                changed = true;
            }
            None => out.extend_from_slice(literal),
        }
    }
    changed.then_some(out)
}

/// Encode a string literal in the escaping style of `original`: escaped
/// slashes and `\uXXXX` for non-ASCII when the original used them.
fn encode_json_string(value: &str, original: &[u8]) -> String {
    let mut encoded = serde_json::Value::String(value.to_string()).to_string();
    if find(original, b"\\/").is_some() {
        encoded = encoded.replace('/', "\\/");
    }
    if original.is_ascii() && find(original, b"\\u").is_some() && !encoded.is_ascii() {
        let mut ascii = String::with_capacity(encoded.len());
        for c in encoded.chars() {
            if c.is_ascii() {
                ascii.push(c);
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    ascii.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
        encoded = ascii;
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::php::{PhpValue, emit, parse};
    use proptest::prelude::*;

    const FROM: &str = "https://example.wpengine.com";
    const TO: &str = "https://mysite.ddev.site";

    fn replacer() -> Replacer {
        Replacer::new(&[(FROM, TO)])
    }

    fn apply(input: &str) -> String {
        rewrite(&replacer(), input.as_bytes())
            .map(|r| String::from_utf8(r.value).unwrap())
            .unwrap_or_else(|| input.to_string())
    }

    #[test]
    fn serialized_lengths_are_recomputed() {
        assert_eq!(
            apply(r#"a:1:{s:3:"url";s:28:"https://example.wpengine.com";}"#),
            r#"a:1:{s:3:"url";s:24:"https://mysite.ddev.site";}"#
        );
    }

    #[test]
    fn nested_serialized_string_is_rewritten_inside_out() {
        let inner = r#"a:1:{i:0;s:28:"https://example.wpengine.com";}"#;
        let outer = format!(r#"a:1:{{s:5:"inner";s:{}:"{}";}}"#, inner.len(), inner);
        let rewritten = apply(&outer);
        let new_inner = r#"a:1:{i:0;s:24:"https://mysite.ddev.site";}"#;
        assert_eq!(
            rewritten,
            format!(r#"a:1:{{s:5:"inner";s:{}:"{}";}}"#, new_inner.len(), new_inner)
        );
    }

    #[test]
    fn json_keeps_escaping_style_and_untouched_bytes() {
        let input = r#"{"home": "https:\/\/example.wpengine.com\/about", "name": "Café", "n": 1.50}"#;
        assert_eq!(
            apply(input),
            r#"{"home": "https:\/\/mysite.ddev.site\/about", "name": "Café", "n": 1.50}"#
        );

        let plain = r#"[{"url":"https://example.wpengine.com/x","title":"café https://example.wpengine.com"}]"#;
        assert_eq!(
            apply(plain),
            r#"[{"url":"https://mysite.ddev.site/x","title":"café https://mysite.ddev.site"}]"#
        );
    }

    #[test]
    fn text_replacement_is_byte_exact() {
        let input = "<a href=\"https://example.wpengine.com/caf\u{e9}\">caf\u{e9}</a>";
        assert_eq!(
            apply(input),
            "<a href=\"https://mysite.ddev.site/caf\u{e9}\">caf\u{e9}</a>"
        );
        // Escaped form inside inline script text.
        assert_eq!(
            apply(r#"var u = "https:\/\/example.wpengine.com";"#),
            r#"var u = "https:\/\/mysite.ddev.site";"#
        );
        assert!(rewrite(&replacer(), b"nothing to see").is_none());
    }

    #[test]
    fn malformed_serialized_falls_back_to_text() {
        let input = br#"a:1:{s:3:"url";s:99:"https://example.wpengine.com";}"#;
        let result = rewrite(&replacer(), input).unwrap();
        assert_eq!(result.kind, PayloadKind::Serialized);
        assert_eq!(result.fallbacks.len(), 1);
        assert_eq!(
            result.value,
            br#"a:1:{s:3:"url";s:99:"https://mysite.ddev.site";}"#.to_vec()
        );
    }

    #[test]
    fn target_containing_source_is_idempotent() {
        let r = Replacer::new(&[("https://example.com", "https://example.com.ddev.site")]);
        let once = r.replace(b"see https://example.com/page").unwrap();
        assert_eq!(once, b"see https://example.com.ddev.site/page".to_vec());
        assert!(r.replace(&once).is_none());
    }

    #[test]
    fn longest_source_wins_in_one_pass() {
        let r = Replacer::new(&[
            ("https://example.com", "https://example.ddev.site"),
            ("https://example.com/shop", "https://shop.ddev.site"),
        ]);
        assert_eq!(
            r.replace(b"https://example.com/shop/cart and https://example.com/")
                .unwrap(),
            b"https://shop.ddev.site/cart and https://example.ddev.site/".to_vec()
        );
    }

    fn leaf() -> impl Strategy<Value = PhpValue> {
        prop_oneof![
            Just(PhpValue::Null),
            any::<bool>().prop_map(PhpValue::Bool),
            any::<i64>().prop_map(PhpValue::Int),
            "[ -~]{0,16}".prop_map(|s| PhpValue::Str(s.into_bytes())),
            "[a-z ]{0,6}(https://example\\.wpengine\\.com)?(/[a-z\u{e9}]{0,6})?"
                .prop_map(|s| PhpValue::Str(s.into_bytes())),
        ]
    }

    fn tree() -> impl Strategy<Value = PhpValue> {
        leaf().prop_recursive(4, 48, 6, |inner| {
            prop::collection::vec(
                (
                    prop_oneof![
                        any::<i64>().prop_map(PhpValue::Int),
                        "[a-z_]{1,8}".prop_map(|s| PhpValue::Str(s.into_bytes())),
                    ],
                    inner,
                ),
                0..6,
            )
            .prop_map(PhpValue::Array)
        })
    }

    /// Plain replacement on every leaf, without nested-payload handling.
    fn walk_replaced(value: &PhpValue) -> PhpValue {
        let mut expected = value.clone();
        expected.map_strings(&mut |s| replacer().replace(s));
        expected
    }

    proptest! {
        #[test]
        fn serialized_rewrite_matches_leaf_walk(value in tree()) {
            let original = emit(&value);
            let rewritten = rewrite(&replacer(), &original)
                .map(|r| r.value)
                .unwrap_or_else(|| original.clone());
            let reparsed = parse(&rewritten).unwrap();
            prop_assert_eq!(&reparsed, &walk_replaced(&value));
            prop_assert_eq!(emit(&reparsed), rewritten.clone());
            prop_assert!(rewrite(&replacer(), &rewritten).is_none());
            prop_assert!(find(&rewritten, FROM.as_bytes()).is_none());
        }

        #[test]
        fn text_rewrite_is_idempotent(text in "([a-z ]{0,8}(https://example\\.wpengine\\.com|https://mysite\\.ddev\\.site)?){0,6}") {
            let r = Replacer::new(&[(FROM, TO)]);
            let once = r.replace(text.as_bytes()).unwrap_or_else(|| text.clone().into_bytes());
            prop_assert!(r.replace(&once).is_none());
        }
    }
}
