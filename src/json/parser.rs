//! Recursive-descent JSON parser.
//!
//! # Grammar
//! At each level the productions are tried in this order: string, number,
//! array, object, constant. Anything else is an `UnknownString` error.
//!
//! # Strings
//! The fast path copies bytes straight through. A `\u` escape, or a string
//! that mixes well-formed UTF-8 sequences with stray high bytes, rewinds the
//! cursor to the opening quote and rescans the whole string through the
//! UTF-16 aware path. The two scanning modes are never mixed within one
//! pass.

use std::str::FromStr;

use bigdecimal::BigDecimal;

use crate::json::cursor::Cursor;
use crate::json::value::{JsonPair, JsonValue};

/// Numeric error taxonomy, as reported in [`JsonError`] text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonErrorCode {
    Empty = 1,
    ExtraText,
    UnknownString,
    IllString,
    ArrayElement,
    NoString,
    StringEnding,
    ObjNameSep,
    ObjectElement,
    IncompatibleEncoding,
    Unicode4Chars,
    NestingDepth,
}

impl JsonErrorCode {
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// First error hit while parsing. Parsing stops there.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ERROR [{}] on line [{}] {}", .code.number(), .line, .text)]
pub struct JsonError {
    pub code: JsonErrorCode,
    pub line: usize,
    pub text: String,
}

/// Result of a successful parse.
#[derive(Debug)]
pub struct Parsed {
    pub value: JsonValue,
    /// True if the text has more line breaks than containers.
    pub whitespace: bool,
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Arrays and objects nested deeper than this are refused.
pub const MAX_NESTING_DEPTH: usize = 512;

/// Parse a complete JSON text.
///
/// Empty or whitespace-only input yields `null` without an error.
pub fn parse(bytes: &[u8]) -> Result<Parsed, JsonError> {
    parse_with_depth(bytes, MAX_NESTING_DEPTH)
}

/// Parse with an explicit limit on array/object nesting.
pub fn parse_with_depth(bytes: &[u8], max_depth: usize) -> Result<Parsed, JsonError> {
    let mut parser = Parser::new(bytes, max_depth);
    parser.skip_bom()?;
    parser.cursor.skip_whitespace();
    if parser.cursor.is_at_end() {
        return Ok(Parsed {
            value: JsonValue::Null,
            whitespace: false,
        });
    }

    let value = parser.parse_level()?;
    parser.cursor.skip_whitespace();
    if !parser.cursor.is_at_end() {
        return Err(parser.error(JsonErrorCode::ExtraText, "Extra text after end of JSON value"));
    }

    let lines = parser.cursor.line() - 1;
    Ok(Parsed {
        value,
        whitespace: lines > parser.containers,
    })
}

struct Parser<'a> {
    cursor: Cursor<'a>,
    containers: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(bytes: &'a [u8], max_depth: usize) -> Self {
        Self {
            cursor: Cursor::new(bytes),
            containers: 0,
            depth: 0,
            max_depth,
        }
    }

    fn error(&self, code: JsonErrorCode, text: impl Into<String>) -> JsonError {
        JsonError {
            code,
            line: self.cursor.line(),
            text: text.into(),
        }
    }

    fn skip_bom(&mut self) -> Result<(), JsonError> {
        let head = self.cursor.remaining();
        if head.starts_with(UTF8_BOM) {
            self.cursor.skip(UTF8_BOM.len());
            return Ok(());
        }
        let foreign = head.starts_with(&[0xFE, 0xFF])
            || head.starts_with(&[0xFF, 0xFE])
            || head.starts_with(&[0x00, 0x00, 0xFE, 0xFF]);
        if foreign {
            return Err(self.error(
                JsonErrorCode::IncompatibleEncoding,
                "Only UTF-8 byte order marks are supported",
            ));
        }
        Ok(())
    }

    fn parse_level(&mut self) -> Result<JsonValue, JsonError> {
        self.cursor.skip_whitespace();
        match self.cursor.peek() {
            None => Err(self.error(JsonErrorCode::Empty, "Unexpected end of JSON text")),
            Some(b'"') => self.parse_string().map(JsonValue::String),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(b'[') => self.nested(Self::parse_array),
            Some(b'{') => self.nested(Self::parse_object),
            Some(_) => match self.parse_constant() {
                Some(value) => Ok(value),
                None => Err(self.error(JsonErrorCode::UnknownString, "Unknown token in JSON text")),
            },
        }
    }

    fn parse_constant(&mut self) -> Option<JsonValue> {
        let (word, value): (&[u8], JsonValue) = if self.cursor.starts_with_ignore_case(b"null") {
            (b"null", JsonValue::Null)
        } else if self.cursor.starts_with_ignore_case(b"true") {
            (b"true", JsonValue::Bool(true))
        } else if self.cursor.starts_with_ignore_case(b"false") {
            (b"false", JsonValue::Bool(false))
        } else {
            return None;
        };
        self.cursor.skip(word.len());
        Some(value)
    }

    fn parse_string(&mut self) -> Result<String, JsonError> {
        let start = self.cursor.position();
        self.cursor.advance();

        let mut bytes = Vec::new();
        let mut utf8_seen = false;
        let mut legacy_seen = false;

        loop {
            let Some(byte) = self.cursor.advance() else {
                return Err(self.error(JsonErrorCode::StringEnding, "String not terminated"));
            };
            match byte {
                b'"' => break,
                b'\\' => match self.cursor.advance() {
                    Some(b'u') => {
                        self.cursor.rewind(start);
                        return self.parse_unicode_string();
                    }
                    Some(escape) => bytes.push(self.simple_escape(escape)?),
                    None => {
                        return Err(self.error(JsonErrorCode::StringEnding, "String not terminated"))
                    }
                },
                0x80..=0xFF => {
                    let len = utf8_sequence_len(byte, self.cursor.remaining());
                    if len > 0 {
                        utf8_seen = true;
                        bytes.push(byte);
                        for _ in 0..len {
                            if let Some(next) = self.cursor.advance() {
                                bytes.push(next);
                            }
                        }
                    } else {
                        legacy_seen = true;
                        bytes.push(byte);
                    }
                    if utf8_seen && legacy_seen {
                        self.cursor.rewind(start);
                        return self.parse_unicode_string();
                    }
                }
                _ => bytes.push(byte),
            }
        }

        if legacy_seen {
            return Ok(bytes.iter().map(|&b| char::from(b)).collect());
        }
        String::from_utf8(bytes)
            .map_err(|_| self.error(JsonErrorCode::IllString, "Invalid UTF-8 in string"))
    }

    /// Second pass over a string that needs UTF-16 handling.
    fn parse_unicode_string(&mut self) -> Result<String, JsonError> {
        self.cursor.advance();
        let mut units: Vec<u16> = Vec::new();

        loop {
            let Some(byte) = self.cursor.advance() else {
                return Err(self.error(JsonErrorCode::StringEnding, "String not terminated"));
            };
            match byte {
                b'"' => break,
                b'\\' => match self.cursor.advance() {
                    Some(b'u') => units.push(self.unicode_char()?),
                    Some(escape) => units.push(u16::from(self.simple_escape(escape)?)),
                    None => {
                        return Err(self.error(JsonErrorCode::StringEnding, "String not terminated"))
                    }
                },
                0x80..=0xFF => {
                    let ch = self.utf8_char(byte);
                    let mut buffer = [0u16; 2];
                    units.extend_from_slice(ch.encode_utf16(&mut buffer));
                }
                _ => units.push(u16::from(byte)),
            }
        }

        String::from_utf16(&units)
            .map_err(|_| self.error(JsonErrorCode::IllString, "Unpaired UTF-16 surrogate in string"))
    }

    fn simple_escape(&self, escape: u8) -> Result<u8, JsonError> {
        match escape {
            b'"' => Ok(b'"'),
            b'\\' => Ok(b'\\'),
            b'/' => Ok(b'/'),
            b'b' => Ok(0x08),
            b'f' => Ok(0x0C),
            b'n' => Ok(b'\n'),
            b'r' => Ok(b'\r'),
            b't' => Ok(b'\t'),
            _ => Err(self.error(JsonErrorCode::IllString, "Illegal escape sequence in string")),
        }
    }

    /// Four hex digits after `\u`.
    fn unicode_char(&mut self) -> Result<u16, JsonError> {
        let mut unit: u16 = 0;
        for _ in 0..4 {
            let digit = self
                .cursor
                .peek()
                .and_then(|b| char::from(b).to_digit(16))
                .ok_or_else(|| {
                    self.error(JsonErrorCode::Unicode4Chars, "Unicode escape needs 4 hex digits")
                })?;
            self.cursor.advance();
            unit = (unit << 4) | digit as u16;
        }
        Ok(unit)
    }

    /// Decode a UTF-8 sequence starting with `lead`. A byte that does not
    /// start a well-formed sequence is taken as a Latin-1 character.
    fn utf8_char(&mut self, lead: u8) -> char {
        let len = utf8_sequence_len(lead, self.cursor.remaining());
        if len == 0 {
            return char::from(lead);
        }
        let mut code = u32::from(lead) & (0x7F >> (len + 1));
        for _ in 0..len {
            if let Some(next) = self.cursor.advance() {
                code = (code << 6) | u32::from(next & 0x3F);
            }
        }
        char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
    }

    fn parse_number(&mut self) -> Result<JsonValue, JsonError> {
        let start = self.cursor.position();
        if self.cursor.peek() == Some(b'-') {
            self.cursor.advance();
        }
        if self.skip_digits() == 0 {
            return Err(self.error(JsonErrorCode::UnknownString, "Digits expected in number"));
        }

        let mut decimal = false;
        if self.cursor.peek() == Some(b'.') {
            decimal = true;
            self.cursor.advance();
            self.skip_digits();
        }
        if let Some(b'e' | b'E') = self.cursor.peek() {
            decimal = true;
            self.cursor.advance();
            if let Some(b'+' | b'-') = self.cursor.peek() {
                self.cursor.advance();
            }
            if self.skip_digits() == 0 {
                return Err(self.error(JsonErrorCode::UnknownString, "Digits expected in exponent"));
            }
        }

        // The slice only holds ASCII digits, signs, '.' and 'e'.
        let text = String::from_utf8_lossy(self.cursor.slice(start)).into_owned();
        if !decimal {
            if let Ok(number) = text.parse::<i32>() {
                return Ok(JsonValue::Int(number));
            }
        }
        BigDecimal::from_str(&text)
            .map(JsonValue::Decimal)
            .map_err(|_| self.error(JsonErrorCode::UnknownString, format!("Invalid number: {text}")))
    }

    fn skip_digits(&mut self) -> usize {
        let mut count = 0;
        while let Some(b'0'..=b'9') = self.cursor.peek() {
            self.cursor.advance();
            count += 1;
        }
        count
    }

    /// Run a container production one nesting level down.
    fn nested(
        &mut self,
        production: fn(&mut Self) -> Result<JsonValue, JsonError>,
    ) -> Result<JsonValue, JsonError> {
        if self.depth >= self.max_depth {
            return Err(self.error(
                JsonErrorCode::NestingDepth,
                format!("Nesting deeper than {} levels", self.max_depth),
            ));
        }
        self.depth += 1;
        let value = production(self);
        self.depth -= 1;
        value
    }

    fn parse_array(&mut self) -> Result<JsonValue, JsonError> {
        self.cursor.advance();
        self.containers += 1;
        let mut items = Vec::new();

        self.cursor.skip_whitespace();
        if self.cursor.peek() == Some(b']') {
            self.cursor.advance();
            return Ok(JsonValue::Array(items));
        }

        loop {
            items.push(self.parse_level()?);
            self.cursor.skip_whitespace();
            match self.cursor.advance() {
                Some(b',') => continue,
                Some(b']') => break,
                None => return Err(self.error(JsonErrorCode::Empty, "Array not terminated")),
                Some(_) => {
                    return Err(self.error(
                        JsonErrorCode::ArrayElement,
                        "Expected ',' or ']' after array element",
                    ))
                }
            }
        }
        Ok(JsonValue::Array(items))
    }

    fn parse_object(&mut self) -> Result<JsonValue, JsonError> {
        self.cursor.advance();
        self.containers += 1;
        let mut pairs = Vec::new();

        self.cursor.skip_whitespace();
        if self.cursor.peek() == Some(b'}') {
            self.cursor.advance();
            return Ok(JsonValue::Object(pairs));
        }

        loop {
            self.cursor.skip_whitespace();
            if self.cursor.peek() != Some(b'"') {
                return Err(self.error(JsonErrorCode::NoString, "Object member name expected"));
            }
            let name = self.parse_string()?;

            self.cursor.skip_whitespace();
            if self.cursor.advance() != Some(b':') {
                return Err(self.error(
                    JsonErrorCode::ObjNameSep,
                    "Expected ':' between member name and value",
                ));
            }

            let value = self.parse_level()?;
            pairs.push(JsonPair { name, value });

            self.cursor.skip_whitespace();
            match self.cursor.advance() {
                Some(b',') => continue,
                Some(b'}') => break,
                None => return Err(self.error(JsonErrorCode::Empty, "Object not terminated")),
                Some(_) => {
                    return Err(self.error(
                        JsonErrorCode::ObjectElement,
                        "Expected ',' or '}' after object member",
                    ))
                }
            }
        }
        Ok(JsonValue::Object(pairs))
    }
}

/// Number of continuation bytes if `lead` starts a well-formed UTF-8
/// sequence whose continuation bytes are present in `rest`, else 0.
fn utf8_sequence_len(lead: u8, rest: &[u8]) -> usize {
    let len = match lead {
        0xC2..=0xDF => 1,
        0xE0..=0xEF => 2,
        0xF0..=0xF4 => 3,
        _ => return 0,
    };
    if rest.len() < len || !rest[..len].iter().all(|b| b & 0xC0 == 0x80) {
        return 0;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> JsonValue {
        match parse(text.as_bytes()) {
            Ok(parsed) => parsed.value,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    fn parse_err(bytes: &[u8]) -> JsonError {
        match parse(bytes) {
            Ok(parsed) => panic!("expected error, got {:?}", parsed.value),
            Err(e) => e,
        }
    }

    #[test]
    fn test_empty_input_is_not_an_error() {
        assert_eq!(parse_ok(""), JsonValue::Null);
        assert_eq!(parse_ok("  \n\t "), JsonValue::Null);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_ok("42"), JsonValue::Int(42));
        assert_eq!(parse_ok("-7"), JsonValue::Int(-7));
        assert_eq!(parse_ok("007"), JsonValue::Int(7));
        assert_eq!(
            parse_ok("2147483648"),
            JsonValue::Decimal(BigDecimal::from_str("2147483648").unwrap())
        );
        assert_eq!(
            parse_ok("1.5e2"),
            JsonValue::Decimal(BigDecimal::from_str("150").unwrap())
        );
        assert_eq!(
            parse_ok("2.5E-1"),
            JsonValue::Decimal(BigDecimal::from_str("0.25").unwrap())
        );
    }

    #[test]
    fn test_constants_case_insensitive() {
        assert_eq!(parse_ok("TRUE"), JsonValue::Bool(true));
        assert_eq!(parse_ok("False"), JsonValue::Bool(false));
        assert_eq!(parse_ok("Null"), JsonValue::Null);
    }

    #[test]
    fn test_object_order_preserved() {
        let value = parse_ok(r#"{"b":1,"a":2,"b":3}"#);
        let names: Vec<&str> = value
            .as_object()
            .unwrap()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a", "b"]);
    }

    #[test]
    fn test_escapes() {
        let value = parse_ok(r#""a\"b\\c\/d\n\t""#);
        assert_eq!(value.as_str(), Some("a\"b\\c/d\n\t"));
    }

    #[test]
    fn test_unicode_escape_restart() {
        let value = parse_ok(r#""caf\u00e9 \u20ac""#);
        assert_eq!(value.as_str(), Some("café €"));
    }

    #[test]
    fn test_surrogate_pair() {
        let value = parse_ok(r#""\ud83d\ude00""#);
        assert_eq!(value.as_str(), Some("😀"));
    }

    #[test]
    fn test_raw_utf8_mixed_with_escape() {
        let value = parse_ok("\"ü and \\u00fc\"");
        assert_eq!(value.as_str(), Some("ü and ü"));
    }

    #[test]
    fn test_latin1_bytes() {
        let parsed = parse(b"\"caf\xe9\"").unwrap();
        assert_eq!(parsed.value.as_str(), Some("café"));
    }

    #[test]
    fn test_mixed_utf8_and_latin1_rescans() {
        let parsed = parse(b"\"\xc3\xbc \xfc\"").unwrap();
        assert_eq!(parsed.value.as_str(), Some("ü ü"));
    }

    #[test]
    fn test_bom_handling() {
        let parsed = parse(b"\xEF\xBB\xBF[1]").unwrap();
        assert_eq!(parsed.value, JsonValue::Array(vec![JsonValue::Int(1)]));
        let error = parse_err(b"\xFF\xFE[1]");
        assert_eq!(error.code, JsonErrorCode::IncompatibleEncoding);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(parse_err(b"[1] x").code, JsonErrorCode::ExtraText);
        assert_eq!(parse_err(b"[1 2]").code, JsonErrorCode::ArrayElement);
        assert_eq!(parse_err(b"{1:2}").code, JsonErrorCode::NoString);
        assert_eq!(parse_err(b"{\"a\" 2}").code, JsonErrorCode::ObjNameSep);
        assert_eq!(parse_err(b"{\"a\":2 \"b\"}").code, JsonErrorCode::ObjectElement);
        assert_eq!(parse_err(b"\"abc").code, JsonErrorCode::StringEnding);
        assert_eq!(parse_err(b"\"\\u12\"").code, JsonErrorCode::Unicode4Chars);
        assert_eq!(parse_err(b"\"\\q\"").code, JsonErrorCode::IllString);
        assert_eq!(parse_err(b"wrong").code, JsonErrorCode::UnknownString);
        assert_eq!(parse_err(b"{\"a\":").code, JsonErrorCode::Empty);
    }

    #[test]
    fn test_error_line_and_text() {
        let error = parse_err(b"{\n\"a\": 1,\n\"b\" 2\n}");
        assert_eq!(error.line, 3);
        assert_eq!(
            error.to_string(),
            "ERROR [8] on line [3] Expected ':' between member name and value"
        );
    }

    #[test]
    fn test_deep_nesting_is_refused() {
        let error = parse_err("[".repeat(200_000).as_bytes());
        assert_eq!(error.code, JsonErrorCode::NestingDepth);
        assert_eq!(error.to_string(), "ERROR [12] on line [1] Nesting deeper than 512 levels");

        let objects = "{\"a\":".repeat(MAX_NESTING_DEPTH + 1);
        assert_eq!(parse_err(objects.as_bytes()).code, JsonErrorCode::NestingDepth);
    }

    #[test]
    fn test_nesting_at_the_limit() {
        let text = format!("{}{}", "[".repeat(MAX_NESTING_DEPTH), "]".repeat(MAX_NESTING_DEPTH));
        assert!(parse(text.as_bytes()).is_ok());

        assert!(parse_with_depth(b"[[{\"a\":[]}]]", 4).is_ok());
        let error = parse_with_depth(b"[[{\"a\":[]}]]", 3).unwrap_err();
        assert_eq!(error.code, JsonErrorCode::NestingDepth);
    }

    #[test]
    fn test_whitespace_flag() {
        let compact = parse(br#"{"a":[1,2]}"#).unwrap();
        assert!(!compact.whitespace);
        let pretty = parse(b"{\n  \"a\": [\n    1,\n    2\n  ]\n}").unwrap();
        assert!(pretty.whitespace);
    }
}
