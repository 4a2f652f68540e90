//! The `standard.*` function library
//!
//! A small default library registered into every
//! [`FunctionBroker::with_standard_library`] broker. Covers the common text
//! and conversion helpers policies reach for, and exercises both fixed and
//! variadic registration paths.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use verdict_core::{RegistrationError, Value, ValueKind};

use crate::functions::{FunctionBroker, FunctionSpecification, ParameterValidator};

/// Register the standard library into the given broker.
pub fn register_standard_library(broker: &FunctionBroker) -> Result<(), RegistrationError> {
    broker.register(
        FunctionSpecification::new("standard.length", 1, |args: &[Value]| length(&args[0]))
            .with_validators(vec![ParameterValidator::any()]),
    )?;
    broker.register(
        FunctionSpecification::new("standard.to_text", 1, |args: &[Value]| to_text(&args[0]))
            .with_validators(vec![ParameterValidator::any()]),
    )?;
    broker.register(
        FunctionSpecification::new("standard.to_number", 1, |args: &[Value]| to_number(&args[0]))
            .with_validators(vec![ParameterValidator::any()]),
    )?;
    broker.register(
        FunctionSpecification::new("standard.upper", 1, |args: &[Value]| {
            Value::text(args[0].as_text().unwrap_or_default().to_uppercase())
        })
        .with_validators(vec![ParameterValidator::text()]),
    )?;
    broker.register(
        FunctionSpecification::new("standard.lower", 1, |args: &[Value]| {
            Value::text(args[0].as_text().unwrap_or_default().to_lowercase())
        })
        .with_validators(vec![ParameterValidator::text()]),
    )?;
    broker.register(
        FunctionSpecification::new("standard.concat", -1, |args: &[Value]| {
            let mut joined = String::new();
            for arg in args {
                joined.push_str(arg.as_text().unwrap_or_default());
            }
            Value::text(joined)
        })
        .with_validators(vec![ParameterValidator::text()]),
    )?;
    Ok(())
}

fn length(value: &Value) -> Value {
    match value.kind() {
        ValueKind::Text(s) => Value::from(s.chars().count() as i64),
        ValueKind::Array(items) => Value::from(items.len() as i64),
        ValueKind::Object(members) => Value::from(members.len() as i64),
        _ => Value::error(format!(
            "standard.length: expected text, array, or object, got {}",
            value.type_name()
        )),
    }
}

fn to_text(value: &Value) -> Value {
    match value.kind() {
        ValueKind::Text(s) => Value::text(s.clone()),
        ValueKind::Number(n) => Value::text(n.normalized().to_string()),
        ValueKind::Bool(b) => Value::text(b.to_string()),
        ValueKind::Null => Value::text("null"),
        _ => Value::error(format!(
            "standard.to_text: cannot convert {}",
            value.type_name()
        )),
    }
}

fn to_number(value: &Value) -> Value {
    match value.kind() {
        ValueKind::Number(_) => value.clone(),
        ValueKind::Text(s) => match BigDecimal::from_str(s.trim()) {
            Ok(n) => Value::number(n),
            Err(_) => Value::error(format!("standard.to_number: cannot parse {s:?}")),
        },
        _ => Value::error(format!(
            "standard.to_number: cannot convert {}",
            value.type_name()
        )),
    }
}
