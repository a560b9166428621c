//! JSON text output.

use std::fmt::Write;

use crate::json::value::JsonValue;

const INDENT: &str = "  ";

/// Render a value as JSON text.
///
/// Decimals always carry a `.` or an exponent so they read back as
/// decimals, and integers never do.
pub fn to_json_string(value: &JsonValue, pretty: bool) -> String {
    let mut out = String::new();
    write_value(&mut out, value, pretty, 0);
    out
}

fn write_value(out: &mut String, value: &JsonValue, pretty: bool, depth: usize) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Int(n) => {
            let _ = write!(out, "{n}");
        }
        JsonValue::Decimal(d) => {
            let text = d.to_string();
            out.push_str(&text);
            if !text.contains(['.', 'e', 'E']) {
                out.push_str(".0");
            }
        }
        JsonValue::String(s) => write_string(out, s),
        JsonValue::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline(out, pretty, depth + 1);
                write_value(out, item, pretty, depth + 1);
            }
            newline(out, pretty, depth);
            out.push(']');
        }
        JsonValue::Object(pairs) => {
            if pairs.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push('{');
            for (i, pair) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline(out, pretty, depth + 1);
                write_string(out, &pair.name);
                out.push(':');
                if pretty {
                    out.push(' ');
                }
                write_value(out, &pair.value, pretty, depth + 1);
            }
            newline(out, pretty, depth);
            out.push('}');
        }
    }
}

fn newline(out: &mut String, pretty: bool, depth: usize) {
    if pretty {
        out.push('\n');
        for _ in 0..depth {
            out.push_str(INDENT);
        }
    }
}

/// Write a quoted, escaped JSON string.
pub fn write_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::value::JsonMessage;

    fn round_trip(text: &str) {
        let first = JsonMessage::parse(text);
        assert!(first.is_valid(), "{text}: {:?}", first.error());
        for pretty in [false, true] {
            let rendered = to_json_string(first.value(), pretty);
            let second = JsonMessage::parse(&rendered);
            assert!(second.is_valid(), "{rendered}: {:?}", second.error());
            assert_eq!(first.value(), second.value(), "round trip of {text}");
            for (a, b) in kinds(first.value()).iter().zip(kinds(second.value()).iter()) {
                assert_eq!(a, b);
            }
        }
    }

    fn kinds(value: &JsonValue) -> Vec<crate::json::value::JsonKind> {
        let mut out = vec![value.kind()];
        match value {
            JsonValue::Array(items) => items.iter().for_each(|v| out.extend(kinds(v))),
            JsonValue::Object(pairs) => pairs.iter().for_each(|p| out.extend(kinds(&p.value))),
            _ => {}
        }
        out
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        round_trip(r#"{"z":1,"a":[true,false,null],"m":{"x":"y"}}"#);
        round_trip(r#"[1, 2.5, -3, 1e3, 4294967296, "t\"e\\x\nt"]"#);
        round_trip(r#"{"dup":1,"dup":2}"#);
        round_trip(r#""\u0001 é 😀""#);
        round_trip("[]");
        round_trip("{}");
    }

    #[test]
    fn test_integer_stays_integer() {
        let message = JsonMessage::parse("[10, 10.0]");
        let text = to_json_string(message.value(), false);
        assert_eq!(text, "[10,10.0]");
    }

    #[test]
    fn test_pretty_output() {
        let message = JsonMessage::parse(r#"{"a":[1]}"#);
        assert_eq!(
            to_json_string(message.value(), true),
            "{\n  \"a\": [\n    1\n  ]\n}"
        );
    }
}
