//! Built-in codecs for Date, Map, Set, RegExp and Error.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};

use super::{ChildEncoder, TypeCodec};
use crate::error::{Error, Result};
use crate::serialize::TypeSchema;
use crate::value::{read, ErrorValue, RegExpValue, Value};

/// Stack traces are cut to this many lines when they cross the boundary.
pub const MAX_STACK_LINES: usize = 50;

const TRUNCATION_MARKER: &str = "... (truncated)";

/// Keep the first [`MAX_STACK_LINES`] lines of a stack trace.
pub(crate) fn truncate_stack(stack: &str) -> String {
    let lines: Vec<&str> = stack.lines().collect();
    if lines.len() <= MAX_STACK_LINES {
        return stack.to_string();
    }
    let mut truncated = lines[..MAX_STACK_LINES].join("\n");
    truncated.push('\n');
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

fn string_field(codec: &str, form: &Value, key: &str) -> Result<String> {
    match form.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::codec(
            codec,
            format!("field `{key}` must be a string, got {}", other.type_of()),
        )),
        None => Err(Error::codec(codec, format!("missing field `{key}`"))),
    }
}

fn array_field(codec: &str, form: &Value, key: &str) -> Result<Vec<Value>> {
    match form.get(key) {
        Some(Value::Array(items)) => {
            let snapshot = read(&items).clone();
            Ok(snapshot)
        }
        Some(other) => Err(Error::codec(
            codec,
            format!("field `{key}` must be an array, got {}", other.type_of()),
        )),
        None => Err(Error::codec(codec, format!("missing field `{key}`"))),
    }
}

/// `YYYY-MM-DDTHH:MM:SS.sssZ`, switching to a signed six-digit year outside 0000-9999.
fn iso_string(at: &DateTime<Utc>) -> String {
    let rest = at.format("-%m-%dT%H:%M:%S%.3fZ");
    match at.year() {
        year @ 0..=9999 => format!("{year:04}{rest}"),
        year if year < 0 => format!("-{:06}{rest}", year.unsigned_abs()),
        year => format!("+{year:06}{rest}"),
    }
}

fn parse_iso(iso: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(iso) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Expanded years: sign plus six digits.
    let (year, rest) = match iso.as_bytes().first()? {
        b'+' | b'-' => (iso.get(..7)?, iso.get(7..)?),
        _ => (iso.get(..4)?, iso.get(4..)?),
    };
    let year: i32 = year.parse().ok()?;
    let (month, rest) = rest.strip_prefix('-')?.split_once('-')?;
    let (day, time) = rest.split_once('T')?;
    let date = NaiveDate::from_ymd_opt(year, month.parse().ok()?, day.parse().ok()?)?;
    let time = NaiveTime::parse_from_str(time.strip_suffix('Z')?, "%H:%M:%S%.f").ok()?;
    Some(date.and_time(time).and_utc())
}

/// Date ⇄ ISO-8601 string with millisecond precision.
pub struct DateCodec;

impl TypeCodec for DateCodec {
    fn type_name(&self) -> &str {
        "Date"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Date(_))
    }

    fn encode(&self, value: &Value, _children: &mut dyn ChildEncoder) -> Result<Value> {
        match value {
            Value::Date(at) => Ok(Value::String(iso_string(at))),
            other => Err(Error::codec("Date", format!("expected a Date, got {}", other.constructor_name()))),
        }
    }

    fn decode(&self, form: &Value) -> Result<Value> {
        let Value::String(iso) = form else {
            return Err(Error::codec("Date", "serialized date must be a string"));
        };
        let parsed = parse_iso(iso)
            .ok_or_else(|| Error::codec("Date", format!("invalid date `{iso}`")))?;
        Ok(Value::date(parsed))
    }

    fn schema(&self, value: &Value) -> TypeSchema {
        match value {
            Value::Date(at) => TypeSchema::Date {
                epoch_ms: at.timestamp_millis(),
            },
            _ => TypeSchema::Opaque,
        }
    }
}

/// Map ⇄ `{entries: [[k, v], ...], size}`.
pub struct MapCodec;

impl TypeCodec for MapCodec {
    fn type_name(&self) -> &str {
        "Map"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Map(_))
    }

    fn encode(&self, value: &Value, children: &mut dyn ChildEncoder) -> Result<Value> {
        let Value::Map(entries) = value else {
            return Err(Error::codec("Map", format!("expected a Map, got {}", value.constructor_name())));
        };
        // Release the lock before recursing; a child may refer back to this map.
        let entries = read(entries).clone();
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, val) in &entries {
            let key = children.encode_child(key)?;
            let val = children.encode_child(val)?;
            encoded.push(Value::array(vec![key, val]));
        }
        Ok(Value::object([
            ("entries", Value::array(encoded)),
            ("size", Value::from(entries.len())),
        ]))
    }

    fn decode(&self, form: &Value) -> Result<Value> {
        let map = Value::map([]);
        for (idx, entry) in array_field("Map", form, "entries")?.iter().enumerate() {
            match (entry.len(), entry.index(0), entry.index(1)) {
                (Some(2), Some(key), Some(val)) => {
                    map.map_insert(key, val);
                }
                _ => {
                    return Err(Error::codec(
                        "Map",
                        format!("entry {idx} is not a [key, value] pair"),
                    ));
                }
            }
        }
        Ok(map)
    }

    fn schema(&self, value: &Value) -> TypeSchema {
        TypeSchema::Map {
            size: value.len().unwrap_or(0),
        }
    }
}

/// Set ⇄ `{values: [...], size}`.
pub struct SetCodec;

impl TypeCodec for SetCodec {
    fn type_name(&self) -> &str {
        "Set"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Set(_))
    }

    fn encode(&self, value: &Value, children: &mut dyn ChildEncoder) -> Result<Value> {
        let Value::Set(members) = value else {
            return Err(Error::codec("Set", format!("expected a Set, got {}", value.constructor_name())));
        };
        let members = read(members).clone();
        let encoded = members
            .iter()
            .map(|member| children.encode_child(member))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::object([
            ("values", Value::array(encoded)),
            ("size", Value::from(members.len())),
        ]))
    }

    fn decode(&self, form: &Value) -> Result<Value> {
        Ok(Value::set(array_field("Set", form, "values")?))
    }

    fn schema(&self, value: &Value) -> TypeSchema {
        TypeSchema::Set {
            size: value.len().unwrap_or(0),
        }
    }
}

const REGEXP_FLAGS: &str = "dgimsuvy";

fn validate_flags(flags: &str) -> Result<()> {
    let mut seen = String::with_capacity(flags.len());
    for flag in flags.chars() {
        if !REGEXP_FLAGS.contains(flag) || seen.contains(flag) {
            return Err(Error::codec(
                "RegExp",
                format!("invalid flags supplied to RegExp: `{flags}`"),
            ));
        }
        seen.push(flag);
    }
    if seen.contains('u') && seen.contains('v') {
        return Err(Error::codec("RegExp", "flags `u` and `v` are mutually exclusive"));
    }
    Ok(())
}

/// RegExp ⇄ `{source, flags, lastIndex}`.
///
/// `lastIndex` is written but decode always starts a fresh cursor at 0.
pub struct RegExpCodec;

impl TypeCodec for RegExpCodec {
    fn type_name(&self) -> &str {
        "RegExp"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::RegExp(_))
    }

    fn encode(&self, value: &Value, _children: &mut dyn ChildEncoder) -> Result<Value> {
        let Value::RegExp(re) = value else {
            return Err(Error::codec("RegExp", format!("expected a RegExp, got {}", value.constructor_name())));
        };
        Ok(Value::object([
            ("source", Value::from(re.source.as_str())),
            ("flags", Value::from(re.flags.as_str())),
            ("lastIndex", Value::from(re.last_index)),
        ]))
    }

    fn decode(&self, form: &Value) -> Result<Value> {
        let source = string_field("RegExp", form, "source")?;
        let flags = string_field("RegExp", form, "flags")?;
        validate_flags(&flags)?;
        Ok(Value::RegExp(RegExpValue::new(source, flags)))
    }

    fn schema(&self, value: &Value) -> TypeSchema {
        match value {
            Value::RegExp(re) => TypeSchema::RegExp {
                source: re.source.clone(),
                flags: re.flags.clone(),
            },
            _ => TypeSchema::Opaque,
        }
    }
}

/// Error ⇄ `{message, name, stack, cause}` with the stack cut to [`MAX_STACK_LINES`].
pub struct ErrorCodec;

impl TypeCodec for ErrorCodec {
    fn type_name(&self) -> &str {
        "Error"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Error(_))
    }

    fn encode(&self, value: &Value, children: &mut dyn ChildEncoder) -> Result<Value> {
        let Value::Error(err) = value else {
            return Err(Error::codec("Error", format!("expected an Error, got {}", value.constructor_name())));
        };
        let stack = match &err.stack {
            Some(stack) => Value::String(truncate_stack(stack)),
            None => Value::Undefined,
        };
        let cause = match &err.cause {
            Some(cause) => children.encode_child(cause)?,
            None => Value::Undefined,
        };
        Ok(Value::object([
            ("message", Value::from(err.message.as_str())),
            ("name", Value::from(err.name.as_str())),
            ("stack", stack),
            ("cause", cause),
        ]))
    }

    fn decode(&self, form: &Value) -> Result<Value> {
        let message = match form.get("message") {
            Some(Value::String(message)) => message,
            _ => String::new(),
        };
        let mut err = ErrorValue::generic(message);
        if let Some(Value::String(name)) = form.get("name") {
            err.name = name;
        }
        if let Some(Value::String(stack)) = form.get("stack") {
            err.stack = Some(stack);
        }
        match form.get("cause") {
            None | Some(Value::Undefined) => {}
            Some(cause) => err.cause = Some(cause),
        }
        Ok(Value::error(err))
    }

    fn schema(&self, value: &Value) -> TypeSchema {
        match value {
            Value::Error(err) => TypeSchema::Error {
                name: err.name.clone(),
            },
            _ => TypeSchema::Opaque,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Child encoder that passes values through untouched.
    struct Identity;

    impl ChildEncoder for Identity {
        fn encode_child(&mut self, value: &Value) -> Result<Value> {
            Ok(value.clone())
        }
    }

    #[test]
    fn test_date_encodes_iso_millis() {
        let date = Value::date_from_millis(1_700_000_000_123).unwrap();
        let encoded = DateCodec.encode(&date, &mut Identity).unwrap();
        assert_eq!(encoded, Value::from("2023-11-14T22:13:20.123Z"));
        assert_eq!(DateCodec.decode(&encoded).unwrap(), date);
    }

    #[test]
    fn test_date_expanded_years() {
        let cases = [
            (253_402_300_800_000, "+010000-01-01T00:00:00.000Z"),
            (-62_198_755_200_000, "-000001-01-01T00:00:00.000Z"),
            (-62_167_219_200_000, "0000-01-01T00:00:00.000Z"),
            (253_402_300_799_999, "9999-12-31T23:59:59.999Z"),
        ];
        for (millis, iso) in cases {
            let date = Value::date_from_millis(millis).unwrap();
            let encoded = DateCodec.encode(&date, &mut Identity).unwrap();
            assert_eq!(encoded, Value::from(iso));
            assert_eq!(DateCodec.decode(&encoded).unwrap(), date);
        }
    }

    #[test]
    fn test_date_accepts_offsets() {
        let decoded = DateCodec
            .decode(&Value::from("2023-11-15T00:13:20.123+02:00"))
            .unwrap();
        assert_eq!(decoded, Value::date_from_millis(1_700_000_000_123).unwrap());
    }

    #[test]
    fn test_date_rejects_garbage() {
        for garbage in ["yesterday", "+10000-01-01T00:00:00.000Z", "2023-02-30T00:00:00.000Z"] {
            let err = DateCodec.decode(&Value::from(garbage)).unwrap_err();
            assert!(matches!(err, Error::Codec { .. }), "{garbage}");
        }
    }

    #[test]
    fn test_map_form() {
        let map = Value::map([(Value::from("a"), Value::from(1))]);
        let encoded = MapCodec.encode(&map, &mut Identity).unwrap();
        assert_eq!(encoded.get("size"), Some(Value::from(1)));
        let entries = encoded.get("entries").unwrap();
        assert_eq!(
            entries,
            Value::array(vec![Value::array(vec![Value::from("a"), Value::from(1)])])
        );
    }

    #[test]
    fn test_map_decode_rejects_bad_entry() {
        let form = Value::object([
            ("entries", Value::array(vec![Value::array(vec![Value::from(1)])])),
            ("size", Value::from(1)),
        ]);
        assert!(MapCodec.decode(&form).is_err());
    }

    #[test]
    fn test_set_form_keeps_order() {
        let set = Value::set([Value::from(3), Value::from(1), Value::from(2)]);
        let encoded = SetCodec.encode(&set, &mut Identity).unwrap();
        assert_eq!(
            encoded.get("values"),
            Some(Value::array(vec![Value::from(3), Value::from(1), Value::from(2)]))
        );
        assert_eq!(encoded.get("size"), Some(Value::from(3)));
    }

    #[test]
    fn test_regexp_last_index_is_not_restored() {
        let mut re = RegExpValue::new("ab+c", "gi");
        re.last_index = 7;
        let encoded = RegExpCodec
            .encode(&Value::RegExp(re), &mut Identity)
            .unwrap();
        assert_eq!(encoded.get("lastIndex"), Some(Value::from(7)));

        let Value::RegExp(decoded) = RegExpCodec.decode(&encoded).unwrap() else {
            panic!("expected a RegExp");
        };
        assert_eq!(decoded.source, "ab+c");
        assert_eq!(decoded.flags, "gi");
        assert_eq!(decoded.last_index, 0);
    }

    #[test]
    fn test_regexp_flag_validation() {
        assert!(validate_flags("gimsuy").is_ok());
        assert!(validate_flags("gg").is_err());
        assert!(validate_flags("x").is_err());
        assert!(validate_flags("uv").is_err());
    }

    #[test]
    fn test_error_stack_truncation() {
        let stack: Vec<String> = (0..80).map(|i| format!("    at frame{i}")).collect();
        let truncated = truncate_stack(&stack.join("\n"));
        let lines: Vec<&str> = truncated.lines().collect();
        assert_eq!(lines.len(), MAX_STACK_LINES + 1);
        assert_eq!(lines[MAX_STACK_LINES - 1], "    at frame49");
        assert_eq!(lines[MAX_STACK_LINES], "... (truncated)");
    }

    #[test]
    fn test_short_stack_is_untouched() {
        assert_eq!(truncate_stack("Error: x\n    at y"), "Error: x\n    at y");
    }

    #[test]
    fn test_error_form_and_decode() {
        let err = ErrorValue::new("RangeError", "out of range")
            .with_stack("RangeError: out of range\n    at f")
            .with_cause(Value::from("root"));
        let encoded = ErrorCodec
            .encode(&Value::error(err.clone()), &mut Identity)
            .unwrap();
        assert_eq!(encoded.get("name"), Some(Value::from("RangeError")));
        assert_eq!(encoded.get("cause"), Some(Value::from("root")));

        assert_eq!(ErrorCodec.decode(&encoded).unwrap(), Value::error(err));
    }

    #[test]
    fn test_error_without_stack_or_cause() {
        let encoded = ErrorCodec
            .encode(&Value::error(ErrorValue::generic("plain")), &mut Identity)
            .unwrap();
        assert_eq!(encoded.get("stack"), Some(Value::Undefined));
        let Value::Error(decoded) = ErrorCodec.decode(&encoded).unwrap() else {
            panic!("expected an Error");
        };
        assert_eq!(decoded.name, "Error");
        assert!(decoded.stack.is_none());
        assert!(decoded.cause.is_none());
    }
}
