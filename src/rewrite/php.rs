//! PHP `serialize()` format: parser, emitter and string-leaf walker.
//!
//! Values are kept as a tagged tree so string leaves can be rewritten and
//! their byte-length prefixes recomputed on emit. Strings are raw bytes;
//! nothing is decoded or re-encoded.

use std::fmt;
use std::sync::LazyLock;

use regex::bytes::Regex;

const MAX_DEPTH: usize = 128;

static PREFIX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:N;|b:[01];|i:-?\d+;|d:[-+0-9.EeINFA]+;|s:\d+:"|a:\d+:\{|O:\d+:"|C:\d+:"|E:\d+:")"#,
    )
    .ok()
});

/// Whether the payload starts like a serialized value. A payload that
/// passes this check but fails to parse is malformed, not plain text.
pub fn looks_serialized(bytes: &[u8]) -> bool {
    PREFIX.as_ref().is_some_and(|re| re.is_match(bytes))
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhpValue {
    Null,
    Bool(bool),
    Int(i64),
    /// Kept verbatim so re-emitting never changes precision.
    Float(String),
    Str(Vec<u8>),
    Array(Vec<(PhpValue, PhpValue)>),
    Object {
        class: Vec<u8>,
        fields: Vec<(PhpValue, PhpValue)>,
    },
    /// `C:` payloads produced by `Serializable::serialize`. Opaque.
    Custom { class: Vec<u8>, data: Vec<u8> },
    /// `E:` enum case, `Class:Case`.
    Enum(Vec<u8>),
    /// `r:` or `R:` back-reference.
    Ref { strong: bool, index: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhpError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for PhpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed serialized data at byte {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for PhpError {}

type ParseResult<T> = std::result::Result<T, PhpError>;

/// Parse a complete serialized payload. Trailing bytes are an error.
pub fn parse(input: &[u8]) -> ParseResult<PhpValue> {
    let mut parser = Parser { input, pos: 0 };
    let value = parser.value(0)?;
    if parser.pos != input.len() {
        return Err(parser.error("trailing bytes after value"));
    }
    Ok(value)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> PhpError {
        PhpError {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn expect(&mut self, byte: u8) -> ParseResult<()> {
        if self.input.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    /// Bytes up to (not including) `end`, consuming the terminator.
    fn until(&mut self, end: u8) -> ParseResult<&'a [u8]> {
        let rest = &self.input[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == end)
            .ok_or_else(|| self.error(&format!("missing '{}'", end as char)))?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn take(&mut self, len: usize) -> ParseResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|e| *e <= self.input.len())
            .ok_or_else(|| self.error("length prefix runs past the end"))?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn int(&mut self, end: u8) -> ParseResult<i64> {
        let start = self.pos;
        let digits = self.until(end)?;
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(PhpError {
                offset: start,
                message: "invalid integer".into(),
            })
    }

    fn length(&mut self, end: u8) -> ParseResult<usize> {
        let start = self.pos;
        let n = self.int(end)?;
        usize::try_from(n).map_err(|_| PhpError {
            offset: start,
            message: "negative length".into(),
        })
    }

    /// `<len>:"<bytes>"`
    fn quoted(&mut self) -> ParseResult<&'a [u8]> {
        let len = self.length(b':')?;
        self.expect(b'"')?;
        let bytes = self.take(len)?;
        self.expect(b'"')?;
        Ok(bytes)
    }

    fn entries(&mut self, depth: usize) -> ParseResult<Vec<(PhpValue, PhpValue)>> {
        let count = self.length(b':')?;
        self.expect(b'{')?;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key = self.value(depth + 1)?;
            if !matches!(key, PhpValue::Int(_) | PhpValue::Str(_)) {
                return Err(self.error("array key must be an integer or string"));
            }
            let value = self.value(depth + 1)?;
            entries.push((key, value));
        }
        self.expect(b'}')?;
        Ok(entries)
    }

    fn value(&mut self, depth: usize) -> ParseResult<PhpValue> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        let tag = *self
            .input
            .get(self.pos)
            .ok_or_else(|| self.error("unexpected end of input"))?;
        self.pos += 1;
        if tag == b'N' {
            self.expect(b';')?;
            return Ok(PhpValue::Null);
        }
        self.expect(b':')?;
        let value = match tag {
            b'b' => match self.until(b';')? {
                b"0" => PhpValue::Bool(false),
                b"1" => PhpValue::Bool(true),
                _ => return Err(self.error("invalid boolean")),
            },
            b'i' => PhpValue::Int(self.int(b';')?),
            b'd' => {
                let raw = self.until(b';')?;
                let text = std::str::from_utf8(raw).map_err(|_| self.error("invalid float"))?;
                PhpValue::Float(text.to_string())
            }
            b's' => {
                let bytes = self.quoted()?.to_vec();
                self.expect(b';')?;
                PhpValue::Str(bytes)
            }
            b'a' => PhpValue::Array(self.entries(depth)?),
            b'O' => {
                let class = self.quoted()?.to_vec();
                self.expect(b':')?;
                PhpValue::Object {
                    class,
                    fields: self.entries(depth)?,
                }
            }
            b'C' => {
                let class = self.quoted()?.to_vec();
                self.expect(b':')?;
                let len = self.length(b':')?;
                self.expect(b'{')?;
                let data = self.take(len)?.to_vec();
                self.expect(b'}')?;
                PhpValue::Custom { class, data }
            }
            b'E' => {
                let name = self.quoted()?.to_vec();
                self.expect(b';')?;
                PhpValue::Enum(name)
            }
            b'r' | b'R' => PhpValue::Ref {
                strong: tag == b'R',
                index: self.int(b';')?,
            },
            _ => {
                self.pos -= 2;
                return Err(self.error("unknown type tag"));
            }
        };
        Ok(value)
    }
}

fn emit_quoted(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.extend_from_slice(b":\"");
    out.extend_from_slice(bytes);
    out.push(b'"');
}

fn emit_entries(out: &mut Vec<u8>, entries: &[(PhpValue, PhpValue)]) {
    out.extend_from_slice(entries.len().to_string().as_bytes());
    out.extend_from_slice(b":{");
    for (k, v) in entries {
        emit_into(out, k);
        emit_into(out, v);
    }
    out.push(b'}');
}

fn emit_into(out: &mut Vec<u8>, value: &PhpValue) {
    match value {
        PhpValue::Null => out.extend_from_slice(b"N;"),
        PhpValue::Bool(b) => out.extend_from_slice(if *b { b"b:1;" } else { b"b:0;" }),
        PhpValue::Int(i) => {
            out.extend_from_slice(b"i:");
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b';');
        }
        PhpValue::Float(raw) => {
            out.extend_from_slice(b"d:");
            out.extend_from_slice(raw.as_bytes());
            out.push(b';');
        }
        PhpValue::Str(bytes) => {
            out.extend_from_slice(b"s:");
            emit_quoted(out, bytes);
            out.push(b';');
        }
        PhpValue::Array(entries) => {
            out.extend_from_slice(b"a:");
            emit_entries(out, entries);
        }
        PhpValue::Object { class, fields } => {
            out.extend_from_slice(b"O:");
            emit_quoted(out, class);
            out.push(b':');
            emit_entries(out, fields);
        }
        PhpValue::Custom { class, data } => {
            out.extend_from_slice(b"C:");
            emit_quoted(out, class);
            out.push(b':');
            out.extend_from_slice(data.len().to_string().as_bytes());
            out.extend_from_slice(b":{");
            out.extend_from_slice(data);
            out.push(b'}');
        }
        PhpValue::Enum(name) => {
            out.extend_from_slice(b"E:");
            emit_quoted(out, name);
            out.push(b';');
        }
        PhpValue::Ref { strong, index } => {
            out.extend_from_slice(if *strong { b"R:" } else { b"r:" });
            out.extend_from_slice(index.to_string().as_bytes());
            out.push(b';');
        }
    }
}

pub fn emit(value: &PhpValue) -> Vec<u8> {
    let mut out = Vec::new();
    emit_into(&mut out, value);
    out
}

impl PhpValue {
    /// Apply `f` to every string leaf, array key and property name
    /// included. `f` returns `None` to leave a leaf unchanged. Returns how
    /// many leaves changed.
    pub fn map_strings(&mut self, f: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>) -> usize {
        match self {
            PhpValue::Str(bytes) => match f(bytes) {
                Some(new) if new != *bytes => {
                    *bytes = new;
                    1
                }
                _ => 0,
            },
            PhpValue::Array(entries) | PhpValue::Object { fields: entries, .. } => {
                let mut changed = 0;
                for (k, v) in entries.iter_mut() {
                    changed += k.map_strings(f);
                    changed += v.map_strings(f);
                }
                changed
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_reemits_wordpress_option() {
        let raw = br#"a:3:{s:3:"url";s:28:"https://example.wpengine.com";i:7;b:1;s:5:"ratio";d:0.5;}"#;
        let value = parse(raw).unwrap();
        assert_eq!(emit(&value), raw.to_vec());
        let PhpValue::Array(entries) = &value else {
            panic!("expected array");
        };
        assert_eq!(entries[0].1, PhpValue::Str(b"https://example.wpengine.com".to_vec()));
        assert_eq!(entries[1], (PhpValue::Int(7), PhpValue::Bool(true)));
    }

    #[test]
    fn length_prefix_is_recomputed() {
        let raw = br#"a:1:{s:3:"url";s:28:"https://example.wpengine.com";}"#;
        let mut value = parse(raw).unwrap();
        let changed = value.map_strings(&mut |s| {
            (s == b"https://example.wpengine.com").then(|| b"https://mysite.ddev.site".to_vec())
        });
        assert_eq!(changed, 1);
        assert_eq!(
            emit(&value),
            br#"a:1:{s:3:"url";s:24:"https://mysite.ddev.site";}"#.to_vec()
        );
    }

    #[test]
    fn objects_refs_and_multibyte_strings() {
        let raw = "O:8:\"stdClass\":2:{s:4:\"name\";s:5:\"caf\u{e9}\";s:4:\"self\";r:1;}";
        let value = parse(raw.as_bytes()).unwrap();
        assert_eq!(emit(&value), raw.as_bytes());

        let custom = br#"C:11:"ArrayObject":21:{x:i:0;a:0:{};m:a:0:{}}"#;
        assert_eq!(emit(&parse(custom).unwrap()), custom.to_vec());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        // Length says 30, body is 28 bytes.
        assert!(parse(br#"s:30:"https://example.wpengine.com";"#).is_err());
        assert!(parse(b"a:2:{i:0;s:1:\"a\";}").is_err());
        assert!(parse(b"i:12;extra").is_err());
        assert!(parse(b"x:1;").is_err());
        assert!(parse(b"s:-1:\"\";").is_err());
    }

    #[test]
    fn detection_requires_a_real_prefix() {
        assert!(looks_serialized(br#"a:1:{s:1:"a";i:1;}"#));
        assert!(looks_serialized(b"b:0;"));
        assert!(looks_serialized(b"N;"));
        assert!(!looks_serialized(b"a: list of things"));
        assert!(!looks_serialized(b"https://example.com"));
    }
}
