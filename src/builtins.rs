// Native functions exposed in the global namespace (spec §4.3 / §2.4).

use crate::value::Value;

/// Seconds since the process's native-function clock started, as an
/// `f64` matching the book's `clock()` native (spec: "a single native
/// function `clock()`"). Backed by `chrono`, the teacher's time crate, so
/// wall-clock handling stays in the same dependency as `OpCode`-level
/// tracing timestamps elsewhere in the crate.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    let now = chrono::Utc::now();
    let millis = now.timestamp_millis() as f64;
    Ok(Value::Number(millis / 1000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_number() {
        let result = clock(&[]).unwrap();
        assert!(matches!(result, Value::Number(_)));
    }
}
