//! The value operator algebra
//!
//! Every operator is a total function over values: type mismatches and
//! numeric failures come back as error values, never as panics. Error
//! operands propagate (left first) and the `secret` flag of every operand is
//! merged into the result.

use bigdecimal::{BigDecimal, Zero};
use regex::Regex;
use verdict_core::{Value, ValueKind, ValueMetadata};

/// Significant digits kept by division; everything else is exact.
const DIVISION_PRECISION: u64 = 34;

fn merged(l: &Value, r: &Value) -> ValueMetadata {
    ValueMetadata::merged(l.metadata(), r.metadata())
}

/// Left-biased error propagation with merged metadata.
fn propagate(l: &Value, r: &Value) -> Option<Value> {
    if l.is_error() {
        return Some(l.clone().merge_metadata(r.metadata()));
    }
    if r.is_error() {
        return Some(r.clone().merge_metadata(l.metadata()));
    }
    None
}

fn type_mismatch(op: &str, l: &Value, r: &Value) -> Value {
    Value::error(format!(
        "type mismatch: cannot apply '{op}' to {} and {}",
        l.type_name(),
        r.type_name()
    ))
    .with_metadata(merged(l, r))
}

/// Unquoted text form used by `+` concatenation.
fn text_form(v: &Value) -> String {
    match v.kind() {
        ValueKind::Text(s) => s.clone(),
        _ => v.to_string(),
    }
}

// ============================================================================
// ARITHMETIC
// ============================================================================

pub fn add(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    match (l.kind(), r.kind()) {
        (ValueKind::Number(a), ValueKind::Number(b)) => {
            Value::number(a + b).with_metadata(merged(l, r))
        }
        (ValueKind::Text(a), _) => {
            Value::text(format!("{a}{}", text_form(r))).with_metadata(merged(l, r))
        }
        _ => type_mismatch("+", l, r),
    }
}

pub fn subtract(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    match (l.kind(), r.kind()) {
        (ValueKind::Number(a), ValueKind::Number(b)) => {
            Value::number(a - b).with_metadata(merged(l, r))
        }
        _ => type_mismatch("-", l, r),
    }
}

pub fn multiply(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    match (l.kind(), r.kind()) {
        (ValueKind::Number(a), ValueKind::Number(b)) => {
            Value::number(a * b).with_metadata(merged(l, r))
        }
        _ => type_mismatch("*", l, r),
    }
}

pub fn divide(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    match (l.kind(), r.kind()) {
        (ValueKind::Number(a), ValueKind::Number(b)) => {
            if b.is_zero() {
                return Value::error("division by zero").with_metadata(merged(l, r));
            }
            Value::number((a / b).with_prec(DIVISION_PRECISION)).with_metadata(merged(l, r))
        }
        _ => type_mismatch("/", l, r),
    }
}

/// Euclidean modulo: the result is non-negative whenever the divisor is
/// positive.
pub fn modulo(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    match (l.kind(), r.kind()) {
        (ValueKind::Number(a), ValueKind::Number(b)) => {
            if b.is_zero() {
                return Value::error("modulo by zero").with_metadata(merged(l, r));
            }
            let remainder = a.clone() % b.clone();
            let remainder = if remainder < BigDecimal::zero() {
                remainder + b.abs()
            } else {
                remainder
            };
            Value::number(remainder).with_metadata(merged(l, r))
        }
        _ => type_mismatch("%", l, r),
    }
}

pub fn negate(v: &Value) -> Value {
    if v.is_error() {
        return v.clone();
    }
    match v.kind() {
        ValueKind::Number(n) => Value::number(-n.clone()).with_metadata(v.metadata()),
        _ => Value::error(format!("type mismatch: cannot negate {}", v.type_name()))
            .with_metadata(v.metadata()),
    }
}

/// Unary `+`: validates the operand is numeric.
pub fn affirm(v: &Value) -> Value {
    if v.is_error() {
        return v.clone();
    }
    match v.kind() {
        ValueKind::Number(_) => v.clone(),
        _ => Value::error(format!(
            "type mismatch: unary '+' expects a number, got {}",
            v.type_name()
        ))
        .with_metadata(v.metadata()),
    }
}

// ============================================================================
// BOOLEAN
// ============================================================================

pub fn not(v: &Value) -> Value {
    if v.is_error() {
        return v.clone();
    }
    match v.kind() {
        ValueKind::Bool(b) => Value::boolean(!b).with_metadata(v.metadata()),
        _ => Value::error(format!(
            "type mismatch: '!' expects a boolean, got {}",
            v.type_name()
        ))
        .with_metadata(v.metadata()),
    }
}

/// Lazy conjunction: a false left operand wins without looking right.
pub fn and_lazy(l: &Value, rhs: impl FnOnce() -> Value) -> Value {
    if l.is_error() {
        return l.clone();
    }
    match l.as_boolean() {
        None => Value::error(format!(
            "type mismatch: '&&' expects booleans, got {}",
            l.type_name()
        ))
        .with_metadata(l.metadata()),
        Some(false) => Value::boolean(false).with_metadata(l.metadata()),
        Some(true) => {
            let r = rhs();
            if r.is_error() {
                return r.merge_metadata(l.metadata());
            }
            match r.as_boolean() {
                Some(b) => Value::boolean(b).with_metadata(merged(l, &r)),
                None => type_mismatch("&&", l, &r),
            }
        }
    }
}

/// Lazy disjunction: a true left operand wins without looking right.
pub fn or_lazy(l: &Value, rhs: impl FnOnce() -> Value) -> Value {
    if l.is_error() {
        return l.clone();
    }
    match l.as_boolean() {
        None => Value::error(format!(
            "type mismatch: '||' expects booleans, got {}",
            l.type_name()
        ))
        .with_metadata(l.metadata()),
        Some(true) => Value::boolean(true).with_metadata(l.metadata()),
        Some(false) => {
            let r = rhs();
            if r.is_error() {
                return r.merge_metadata(l.metadata());
            }
            match r.as_boolean() {
                Some(b) => Value::boolean(b).with_metadata(merged(l, &r)),
                None => type_mismatch("||", l, &r),
            }
        }
    }
}

// ============================================================================
// COMPARISON
// ============================================================================

macro_rules! numeric_comparison {
    ($name:ident, $op:tt, $symbol:literal) => {
        pub fn $name(l: &Value, r: &Value) -> Value {
            if let Some(e) = propagate(l, r) {
                return e;
            }
            match (l.kind(), r.kind()) {
                (ValueKind::Number(a), ValueKind::Number(b)) => {
                    Value::boolean(a $op b).with_metadata(merged(l, r))
                }
                _ => type_mismatch($symbol, l, r),
            }
        }
    };
}

numeric_comparison!(less_than, <, "<");
numeric_comparison!(less_or_equal, <=, "<=");
numeric_comparison!(greater_than, >, ">");
numeric_comparison!(greater_or_equal, >=, ">=");

/// Structural equality, metadata-blind.
pub fn equal(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    Value::boolean(l == r).with_metadata(merged(l, r))
}

pub fn not_equal(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    Value::boolean(l != r).with_metadata(merged(l, r))
}

/// `in`: element membership in arrays, value membership in objects,
/// substring containment between texts.
pub fn membership(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    match (l.kind(), r.kind()) {
        (_, ValueKind::Array(items)) => {
            Value::boolean(items.contains(l)).with_metadata(merged(l, r))
        }
        (_, ValueKind::Object(members)) => {
            Value::boolean(members.values().any(|v| v == l)).with_metadata(merged(l, r))
        }
        (ValueKind::Text(needle), ValueKind::Text(hay)) => {
            Value::boolean(hay.contains(needle.as_str())).with_metadata(merged(l, r))
        }
        _ => type_mismatch("in", l, r),
    }
}

/// `=~` with a pattern compiled at evaluation time.
pub fn regex_match(l: &Value, r: &Value) -> Value {
    if let Some(e) = propagate(l, r) {
        return e;
    }
    let (ValueKind::Text(_), ValueKind::Text(pattern)) = (l.kind(), r.kind()) else {
        return type_mismatch("=~", l, r);
    };
    match Regex::new(pattern) {
        Ok(regex) => regex_match_compiled(l, &regex, r.metadata()),
        Err(_) => {
            Value::error(format!("invalid regular expression: {pattern:?}"))
                .with_metadata(merged(l, r))
        }
    }
}

/// `=~` with a pattern compiled once at document compile time.
pub fn regex_match_compiled(l: &Value, pattern: &Regex, pattern_meta: ValueMetadata) -> Value {
    if l.is_error() {
        return l.clone().merge_metadata(pattern_meta);
    }
    match l.kind() {
        ValueKind::Text(s) => Value::boolean(pattern.is_match(s))
            .with_metadata(ValueMetadata::merged(l.metadata(), pattern_meta)),
        _ => Value::error(format!(
            "type mismatch: '=~' expects text, got {}",
            l.type_name()
        ))
        .with_metadata(ValueMetadata::merged(l.metadata(), pattern_meta)),
    }
}

// ============================================================================
// STEPS
// ============================================================================

/// `base.key`: member access. A missing member is `undefined`.
pub fn key_step(base: &Value, key: &str) -> Value {
    if base.is_error() {
        return base.clone();
    }
    match base.kind() {
        ValueKind::Object(members) => members
            .get(key)
            .cloned()
            .map(|v| v.merge_metadata(base.metadata()))
            .unwrap_or_else(|| Value::undefined().with_metadata(base.metadata())),
        _ => Value::error(format!(
            "type mismatch: cannot access key '{key}' on {}",
            base.type_name()
        ))
        .with_metadata(base.metadata()),
    }
}

/// `base[index]`: array indexing (negative counts from the end) or member
/// access by text key.
pub fn index_step(base: &Value, index: &Value) -> Value {
    if let Some(e) = propagate(base, index) {
        return e;
    }
    match (base.kind(), index.kind()) {
        (ValueKind::Array(items), ValueKind::Number(n)) => {
            if !n.is_integer() {
                return Value::error("array index must be an integer")
                    .with_metadata(merged(base, index));
            }
            let raw = match bigdecimal::ToPrimitive::to_i64(n) {
                Some(i) => i,
                None => {
                    return Value::error("array index out of range")
                        .with_metadata(merged(base, index))
                }
            };
            let len = items.len() as i64;
            let resolved = if raw < 0 { raw + len } else { raw };
            if resolved < 0 || resolved >= len {
                return Value::error(format!("index {raw} out of bounds for length {len}"))
                    .with_metadata(merged(base, index));
            }
            items[resolved as usize]
                .clone()
                .merge_metadata(merged(base, index))
        }
        (ValueKind::Object(_), ValueKind::Text(key)) => {
            key_step(base, key).merge_metadata(index.metadata())
        }
        _ => type_mismatch("[]", base, index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn num(s: &str) -> Value {
        Value::number(BigDecimal::from_str(s).unwrap())
    }

    #[test]
    fn test_exact_decimal_addition() {
        assert_eq!(add(&num("0.1"), &num("0.2")), num("0.3"));
    }

    #[test]
    fn test_text_concatenation() {
        assert_eq!(
            add(&Value::text("v"), &Value::from(2)),
            Value::text("v2")
        );
        assert_eq!(
            add(&Value::text("a"), &Value::text("b")),
            Value::text("ab")
        );
    }

    #[test]
    fn test_number_plus_text_is_type_error() {
        let result = add(&Value::from(1), &Value::text("x"));
        assert!(result.is_error());
    }

    #[test]
    fn test_division_by_zero_is_error_value() {
        let result = divide(&num("1"), &num("0"));
        assert_eq!(result.error_message(), Some("division by zero"));
    }

    #[test]
    fn test_division_precision() {
        let result = divide(&num("1"), &num("3"));
        let digits: String = result
            .as_number()
            .unwrap()
            .to_string()
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        let significant = digits.trim_start_matches('0');
        assert_eq!(significant.len(), 34);
    }

    #[test]
    fn test_division_round_trips_within_precision() {
        let n = num("7");
        let twice = multiply(&n, &num("2"));
        assert_eq!(divide(&twice, &num("2")), n);
    }

    #[test]
    fn test_euclidean_modulo_is_non_negative() {
        assert_eq!(modulo(&num("-7"), &num("3")), num("2"));
        assert_eq!(modulo(&num("7"), &num("3")), num("1"));
    }

    #[test]
    fn test_modulo_by_zero_is_error_value() {
        assert!(modulo(&num("1"), &num("0")).is_error());
    }

    #[test]
    fn test_comparison_type_mismatch() {
        let result = less_than(&Value::text("a"), &num("5"));
        assert_eq!(
            result.error_message(),
            Some("type mismatch: cannot apply '<' to text and number")
        );
    }

    #[test]
    fn test_membership_in_array_object_and_text() {
        let array = Value::array(vec![Value::from(1), Value::from(2)]);
        assert_eq!(membership(&Value::from(2), &array), Value::boolean(true));

        let object = Value::object(
            [("a".to_string(), Value::text("x"))].into_iter().collect(),
        );
        assert_eq!(
            membership(&Value::text("x"), &object),
            Value::boolean(true)
        );

        assert_eq!(
            membership(&Value::text("ell"), &Value::text("hello")),
            Value::boolean(true)
        );
    }

    #[test]
    fn test_lazy_and_ignores_rhs_error_when_false() {
        let result = and_lazy(&Value::boolean(false), || Value::error("boom"));
        assert_eq!(result, Value::boolean(false));
    }

    #[test]
    fn test_lazy_or_ignores_rhs_error_when_true() {
        let result = or_lazy(&Value::boolean(true), || Value::error("boom"));
        assert_eq!(result, Value::boolean(true));
    }

    #[test]
    fn test_error_operand_propagates_left_first() {
        let result = add(&Value::error("left"), &Value::error("right"));
        assert_eq!(result.error_message(), Some("left"));
    }

    #[test]
    fn test_secret_flag_survives_every_operator() {
        let secret = num("2").mark_secret();
        assert!(add(&secret, &num("1")).is_secret());
        assert!(less_than(&num("1"), &secret).is_secret());
        assert!(equal(&secret, &num("2")).is_secret());
        assert!(divide(&secret, &num("2")).is_secret());
    }

    #[test]
    fn test_key_step_missing_member_is_undefined() {
        let object = Value::object(
            [("a".to_string(), Value::from(1))].into_iter().collect(),
        );
        assert!(key_step(&object, "b").is_undefined());
        assert_eq!(key_step(&object, "a"), Value::from(1));
    }

    #[test]
    fn test_index_step_negative_counts_from_end() {
        let array = Value::array(vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(index_step(&array, &num("-1")), Value::from(3));
        assert!(index_step(&array, &num("3")).is_error());
    }

    #[test]
    fn test_regex_match() {
        assert_eq!(
            regex_match(&Value::text("alice"), &Value::text("^a.*e$")),
            Value::boolean(true)
        );
        assert!(regex_match(&Value::text("x"), &Value::text("(")).is_error());
        assert!(regex_match(&num("1"), &Value::text(".*")).is_error());
    }
}
