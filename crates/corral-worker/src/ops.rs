//! Built-in operations, selected by `data.op`.

use std::thread;
use std::time::Duration;

use corral_core::{ErrorValue, Value};

/// Exit code requested by an `exit` task, if `data` is one.
pub fn exit_code(data: &Value) -> Option<i32> {
    if op(data).as_deref() != Some("exit") {
        return None;
    }
    Some(data.get("code").and_then(|c| c.as_f64()).unwrap_or(0.0) as i32)
}

/// Run one task. The error side is the thrown value.
pub fn dispatch(data: Value) -> Result<Value, Value> {
    match op(&data).as_deref() {
        Some("echo") => Ok(field(&data, "value")),
        Some("sleep") => {
            let ms = data.get("ms").and_then(|v| v.as_f64()).unwrap_or(0.0);
            thread::sleep(Duration::from_millis(ms.max(0.0) as u64));
            Ok(field(&data, "value"))
        }
        Some("sum") => sum(&data),
        Some("fail") => {
            let name = data
                .get("name")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "Error".to_string());
            let message = data
                .get("message")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            Err(Value::error(ErrorValue::new(name, message)))
        }
        _ => Ok(data),
    }
}

fn op(data: &Value) -> Option<String> {
    data.get("op").and_then(|op| op.as_str().map(str::to_string))
}

fn field(data: &Value, key: &str) -> Value {
    data.get(key).unwrap_or(Value::Undefined)
}

fn sum(data: &Value) -> Result<Value, Value> {
    let values = data.get("values").unwrap_or(Value::Undefined);
    let Some(len) = values.len() else {
        return Err(type_error("sum expects `values` to be an array"));
    };
    let mut total = 0.0;
    for idx in 0..len {
        match values.index(idx).and_then(|v| v.as_f64()) {
            Some(n) => total += n,
            None => return Err(type_error(&format!("values[{idx}] is not a number"))),
        }
    }
    Ok(Value::from(total))
}

fn type_error(message: &str) -> Value {
    Value::error(ErrorValue::new("TypeError", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(op: &str, fields: Vec<(&str, Value)>) -> Value {
        let data = Value::object([("op", Value::from(op))]);
        for (key, value) in fields {
            data.set_property(key, value);
        }
        data
    }

    #[test]
    fn test_echo() {
        let data = task("echo", vec![("value", Value::from("hello"))]);
        assert_eq!(dispatch(data), Ok(Value::from("hello")));
    }

    #[test]
    fn test_sum() {
        let values = Value::array(vec![Value::from(1), Value::from(2.5), Value::from(-0.5)]);
        assert_eq!(dispatch(task("sum", vec![("values", values)])), Ok(Value::from(3.0)));
    }

    #[test]
    fn test_sum_rejects_non_numbers() {
        let values = Value::array(vec![Value::from(1), Value::from("two")]);
        let Err(Value::Error(err)) = dispatch(task("sum", vec![("values", values)])) else {
            panic!("expected a thrown error");
        };
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "values[1] is not a number");
    }

    #[test]
    fn test_fail() {
        let data = task(
            "fail",
            vec![("name", Value::from("RangeError")), ("message", Value::from("too big"))],
        );
        assert_eq!(
            dispatch(data),
            Err(Value::error(ErrorValue::new("RangeError", "too big")))
        );
    }

    #[test]
    fn test_sleep_returns_value() {
        let data = task("sleep", vec![("ms", Value::from(1)), ("value", Value::from(7))]);
        assert_eq!(dispatch(data), Ok(Value::from(7)));
    }

    #[test]
    fn test_unknown_op_echoes_data() {
        let data = Value::object([("anything", Value::from(true))]);
        assert_eq!(dispatch(data.clone()), Ok(data));
        assert_eq!(dispatch(Value::from(5)), Ok(Value::from(5)));
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(&task("exit", vec![("code", Value::from(3))])), Some(3));
        assert_eq!(exit_code(&task("exit", vec![])), Some(0));
        assert_eq!(exit_code(&task("echo", vec![])), None);
    }
}
