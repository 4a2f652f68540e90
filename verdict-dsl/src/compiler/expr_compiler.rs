//! Expression compilation with constant folding
//!
//! Compiles AST expressions bottom-up. An expression folds to a constant iff
//! every subexpression is constant; operators that fail numerically fold to
//! an error value instead of raising. Anything touching the subscription,
//! variables, or the relative node is marked subscription-scoped and left for
//! evaluation time; attribute finders compile to stream expressions.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use futures_util::StreamExt;
use regex::Regex;
use verdict_broker::{combine_latest, once_value, AttributeFinderInvocation, ValueStream};
use verdict_core::{SourceLocation, Value, ValueKind};

use crate::parser::ast::{BinaryOperator, Expr, ExprKind, UnaryOperator};

use super::context::CompilationContext;
use super::expression::{CompiledExpression, EvaluationContext, PureExpression, StreamExpression};
use super::operators;
use super::CompilerError;

type ValueOp = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;
type ContextOp = Arc<dyn Fn(&EvaluationContext, &[Value]) -> Value + Send + Sync>;

/// Compile one expression against the current scopes.
pub fn compile_expression(
    ctx: &CompilationContext,
    expr: &Expr,
) -> Result<CompiledExpression, CompilerError> {
    let location = expr.location.clone();
    match &expr.kind {
        ExprKind::Null => Ok(CompiledExpression::Constant(Value::null())),
        ExprKind::Undefined => Ok(CompiledExpression::Constant(Value::undefined())),
        ExprKind::Bool(b) => Ok(CompiledExpression::Constant(Value::boolean(*b))),
        ExprKind::Text(s) => Ok(CompiledExpression::Constant(Value::text(s.clone()))),
        ExprKind::Number(text) => match BigDecimal::from_str(text) {
            Ok(n) => Ok(CompiledExpression::Constant(Value::number(n))),
            Err(_) => Err(CompilerError::InvalidNumber {
                text: text.clone(),
                location: Some(location),
            }),
        },

        ExprKind::Array(items) => {
            let parts = items
                .iter()
                .map(|item| compile_expression(ctx, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(combine_many(
                parts,
                Arc::new(|values| build_array(values)),
                location,
            ))
        }

        ExprKind::Object(members) => {
            let keys: Vec<String> = members.iter().map(|(k, _)| k.clone()).collect();
            let parts = members
                .iter()
                .map(|(_, v)| compile_expression(ctx, v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(combine_many(
                parts,
                Arc::new(move |values| build_object(&keys, values)),
                location,
            ))
        }

        ExprKind::Identifier(name) => Ok(compile_identifier(ctx, name)),

        ExprKind::RelativeNode => {
            Ok(CompiledExpression::Pure(PureExpression::new(
                true,
                move |ectx: &EvaluationContext| {
                    ectx.relative_node.clone().unwrap_or_else(|| {
                        Value::error_at("no relative node in scope", location.clone())
                    })
                },
            )))
        }

        ExprKind::UnaryOp { op, operand } => {
            let part = compile_expression(ctx, operand)?;
            let f: fn(&Value) -> Value = match op {
                UnaryOperator::Not => operators::not,
                UnaryOperator::Neg => operators::negate,
                UnaryOperator::Plus => operators::affirm,
            };
            Ok(combine_many(
                vec![part],
                Arc::new(move |values| f(&values[0])),
                location,
            ))
        }

        ExprKind::BinaryOp { op, lhs, rhs } => compile_binary(ctx, *op, lhs, rhs, location),

        ExprKind::KeyStep { base, key } => {
            let part = compile_expression(ctx, base)?;
            let key = key.clone();
            Ok(combine_many(
                vec![part],
                Arc::new(move |values| operators::key_step(&values[0], &key)),
                location,
            ))
        }

        ExprKind::IndexStep { base, index } => {
            let base = compile_expression(ctx, base)?;
            let index = compile_expression(ctx, index)?;
            Ok(combine_many(
                vec![base, index],
                Arc::new(|values| operators::index_step(&values[0], &values[1])),
                location,
            ))
        }

        ExprKind::FunctionCall { name, args } => {
            compile_function_call(ctx, name, args, location)
        }

        ExprKind::AttributeFinder { entity, name, args } => {
            compile_attribute_finder(ctx, entity.as_deref(), name, args, location)
        }

        ExprKind::SubTemplate { base, template } => {
            compile_subtemplate(ctx, base, template, location)
        }
    }
}

// ============================================================================
// LIFTING
// ============================================================================

/// Combine compiled parts under a pure n-ary operator, folding when every
/// part is constant and lifting to combine-latest when any part streams.
fn combine_many(parts: Vec<CompiledExpression>, op: ValueOp, location: SourceLocation) -> CompiledExpression {
    if parts.iter().all(|p| p.constant_value().is_some()) {
        let values: Vec<Value> = parts
            .iter()
            .filter_map(|p| p.constant_value().cloned())
            .collect();
        return CompiledExpression::Constant(op(&values).with_location(&location));
    }
    if parts.iter().any(CompiledExpression::is_stream) {
        CompiledExpression::Stream(StreamExpression::new(move |ectx: &EvaluationContext| {
            let streams: Vec<ValueStream> = parts.iter().map(|p| p.open_stream(ectx)).collect();
            let op = Arc::clone(&op);
            let location = location.clone();
            Box::pin(
                combine_latest(streams).map(move |values| op(&values).with_location(&location)),
            )
        }))
    } else {
        let scoped = parts.iter().any(CompiledExpression::subscription_scoped);
        CompiledExpression::Pure(PureExpression::new(scoped, move |ectx: &EvaluationContext| {
            let values: Vec<Value> = parts.iter().map(|p| p.evaluate(ectx)).collect();
            op(&values).with_location(&location)
        }))
    }
}

/// Like [`combine_many`] for operators that need the evaluation context
/// (function invocation). Never folds; callers fold the constant case first.
fn combine_many_with_ctx(
    parts: Vec<CompiledExpression>,
    op: ContextOp,
    location: SourceLocation,
) -> CompiledExpression {
    if parts.iter().any(CompiledExpression::is_stream) {
        CompiledExpression::Stream(StreamExpression::new(move |ectx: &EvaluationContext| {
            let streams: Vec<ValueStream> = parts.iter().map(|p| p.open_stream(ectx)).collect();
            let op = Arc::clone(&op);
            let location = location.clone();
            let ectx = ectx.clone();
            Box::pin(
                combine_latest(streams)
                    .map(move |values| op(&ectx, &values).with_location(&location)),
            )
        }))
    } else {
        CompiledExpression::Pure(PureExpression::new(true, move |ectx: &EvaluationContext| {
            let values: Vec<Value> = parts.iter().map(|p| p.evaluate(ectx)).collect();
            op(ectx, &values).with_location(&location)
        }))
    }
}

/// Errors short-circuit; undefined elements are dropped.
fn build_array(values: &[Value]) -> Value {
    let mut items = Vec::with_capacity(values.len());
    for v in values {
        if v.is_error() {
            return v.clone();
        }
        if v.is_undefined() {
            continue;
        }
        items.push(v.clone());
    }
    Value::array(items)
}

/// Errors short-circuit; undefined members are omitted.
fn build_object(keys: &[String], values: &[Value]) -> Value {
    let mut members = BTreeMap::new();
    for (key, v) in keys.iter().zip(values) {
        if v.is_error() {
            return v.clone();
        }
        if v.is_undefined() {
            continue;
        }
        members.insert(key.clone(), v.clone());
    }
    Value::object(members)
}

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Resolution order: policy-local scope, document scope, the four
/// subscription components, then PDP-configuration variables at runtime.
fn compile_identifier(ctx: &CompilationContext, name: &str) -> CompiledExpression {
    if let Some(bound) = ctx.lookup_variable(name) {
        return bound.clone();
    }
    match name {
        "subject" => subscription_component(|ectx| ectx.subscription.subject.clone()),
        "action" => subscription_component(|ectx| ectx.subscription.action.clone()),
        "resource" => subscription_component(|ectx| ectx.subscription.resource.clone()),
        "environment" => subscription_component(|ectx| ectx.subscription.environment.clone()),
        _ => {
            let name = name.to_string();
            CompiledExpression::Pure(PureExpression::new(true, move |ectx: &EvaluationContext| {
                ectx.variable(&name)
                    .cloned()
                    .unwrap_or_else(Value::undefined)
            }))
        }
    }
}

fn subscription_component(
    select: impl Fn(&EvaluationContext) -> Value + Send + Sync + 'static,
) -> CompiledExpression {
    CompiledExpression::Pure(PureExpression::new(true, select))
}

// ============================================================================
// BINARY OPERATORS
// ============================================================================

fn compile_binary(
    ctx: &CompilationContext,
    op: BinaryOperator,
    lhs: &Expr,
    rhs: &Expr,
    location: SourceLocation,
) -> Result<CompiledExpression, CompilerError> {
    let left = compile_expression(ctx, lhs)?;
    let right = compile_expression(ctx, rhs)?;

    match op {
        BinaryOperator::And => Ok(combine_and(left, right, location)),
        BinaryOperator::Or => Ok(combine_or(left, right, location)),
        BinaryOperator::Regex => compile_regex(left, right, location),
        _ => {
            let f: fn(&Value, &Value) -> Value = match op {
                BinaryOperator::Add => operators::add,
                BinaryOperator::Sub => operators::subtract,
                BinaryOperator::Mul => operators::multiply,
                BinaryOperator::Div => operators::divide,
                BinaryOperator::Mod => operators::modulo,
                BinaryOperator::Lt => operators::less_than,
                BinaryOperator::Le => operators::less_or_equal,
                BinaryOperator::Gt => operators::greater_than,
                BinaryOperator::Ge => operators::greater_or_equal,
                BinaryOperator::Eq => operators::equal,
                BinaryOperator::Ne => operators::not_equal,
                BinaryOperator::In => operators::membership,
                BinaryOperator::And | BinaryOperator::Or | BinaryOperator::Regex => {
                    unreachable!("handled above")
                }
            };
            Ok(combine_many(
                vec![left, right],
                Arc::new(move |values| f(&values[0], &values[1])),
                location,
            ))
        }
    }
}

pub(crate) fn combine_and(
    lhs: CompiledExpression,
    rhs: CompiledExpression,
    location: SourceLocation,
) -> CompiledExpression {
    if let (Some(a), Some(b)) = (lhs.constant_value(), rhs.constant_value()) {
        let b = b.clone();
        return CompiledExpression::Constant(
            operators::and_lazy(a, move || b).with_location(&location),
        );
    }
    if lhs.is_stream() || rhs.is_stream() {
        return combine_many(
            vec![lhs, rhs],
            Arc::new(|values| {
                let rhs = values[1].clone();
                operators::and_lazy(&values[0], move || rhs)
            }),
            location,
        );
    }
    let scoped = lhs.subscription_scoped() || rhs.subscription_scoped();
    CompiledExpression::Pure(PureExpression::new(scoped, move |ectx: &EvaluationContext| {
        let left = lhs.evaluate(ectx);
        operators::and_lazy(&left, || rhs.evaluate(ectx)).with_location(&location)
    }))
}

fn combine_or(
    lhs: CompiledExpression,
    rhs: CompiledExpression,
    location: SourceLocation,
) -> CompiledExpression {
    if let (Some(a), Some(b)) = (lhs.constant_value(), rhs.constant_value()) {
        let b = b.clone();
        return CompiledExpression::Constant(
            operators::or_lazy(a, move || b).with_location(&location),
        );
    }
    if lhs.is_stream() || rhs.is_stream() {
        return combine_many(
            vec![lhs, rhs],
            Arc::new(|values| {
                let rhs = values[1].clone();
                operators::or_lazy(&values[0], move || rhs)
            }),
            location,
        );
    }
    let scoped = lhs.subscription_scoped() || rhs.subscription_scoped();
    CompiledExpression::Pure(PureExpression::new(scoped, move |ectx: &EvaluationContext| {
        let left = lhs.evaluate(ectx);
        operators::or_lazy(&left, || rhs.evaluate(ectx)).with_location(&location)
    }))
}

/// A constant pattern is validated and compiled once, at document compile
/// time; a dynamic pattern is compiled per evaluation.
fn compile_regex(
    lhs: CompiledExpression,
    rhs: CompiledExpression,
    location: SourceLocation,
) -> Result<CompiledExpression, CompilerError> {
    if let Some(pattern_value) = rhs.constant_value() {
        let ValueKind::Text(pattern) = pattern_value.kind() else {
            return Err(CompilerError::RegexPatternNotText {
                actual: pattern_value.type_name().to_string(),
                location: Some(location),
            });
        };
        let regex = Regex::new(pattern).map_err(|e| CompilerError::InvalidRegex {
            reason: e.to_string(),
            location: Some(location.clone()),
        })?;
        let regex = Arc::new(regex);
        let pattern_meta = pattern_value.metadata();
        return Ok(combine_many(
            vec![lhs],
            Arc::new(move |values| {
                operators::regex_match_compiled(&values[0], &regex, pattern_meta)
            }),
            location,
        ));
    }
    Ok(combine_many(
        vec![lhs, rhs],
        Arc::new(|values| operators::regex_match(&values[0], &values[1])),
        location,
    ))
}

// ============================================================================
// FUNCTIONS AND ATTRIBUTES
// ============================================================================

fn compile_function_call(
    ctx: &CompilationContext,
    name: &str,
    args: &[Expr],
    location: SourceLocation,
) -> Result<CompiledExpression, CompilerError> {
    let fqn = ctx.resolve_name(name);
    let parts = args
        .iter()
        .map(|arg| compile_expression(ctx, arg))
        .collect::<Result<Vec<_>, _>>()?;

    if parts.iter().all(|p| p.constant_value().is_some()) {
        let values: Vec<Value> = parts
            .iter()
            .filter_map(|p| p.constant_value().cloned())
            .collect();
        let folded = ctx.function_broker().invoke(&fqn, &values);
        return Ok(CompiledExpression::Constant(folded.with_location(&location)));
    }

    Ok(combine_many_with_ctx(
        parts,
        Arc::new(move |ectx, values| ectx.function_broker.invoke(&fqn, values)),
        location,
    ))
}

fn compile_attribute_finder(
    ctx: &CompilationContext,
    entity: Option<&Expr>,
    name: &str,
    args: &[Expr],
    location: SourceLocation,
) -> Result<CompiledExpression, CompilerError> {
    let fqn = ctx.resolve_name(name);
    let entity_part = entity
        .map(|e| compile_expression(ctx, e))
        .transpose()?;
    if entity_part.as_ref().is_some_and(CompiledExpression::is_stream) {
        return Err(CompilerError::StreamNotAllowed {
            context: "an attribute finder entity".to_string(),
            location: Some(location),
        });
    }
    let arg_parts = args
        .iter()
        .map(|arg| compile_expression(ctx, arg))
        .collect::<Result<Vec<_>, _>>()?;
    if arg_parts.iter().any(CompiledExpression::is_stream) {
        return Err(CompilerError::StreamNotAllowed {
            context: "attribute finder arguments".to_string(),
            location: Some(location),
        });
    }

    Ok(CompiledExpression::Stream(StreamExpression::new(
        move |ectx: &EvaluationContext| {
            let entity_value = match &entity_part {
                None => None,
                Some(part) => {
                    let v = part.evaluate(ectx);
                    if v.is_error() {
                        return once_value(v.with_location(&location));
                    }
                    Some(v)
                }
            };
            let mut arguments = Vec::with_capacity(arg_parts.len());
            for part in &arg_parts {
                let v = part.evaluate(ectx);
                if v.is_error() {
                    return once_value(v.with_location(&location));
                }
                arguments.push(v);
            }
            let invocation = AttributeFinderInvocation {
                pdp_config_id: ectx.pdp_config_id.to_string(),
                fqn: fqn.clone(),
                entity: entity_value,
                arguments,
                variables: (*ectx.variables).clone(),
                settings: ectx.attribute_settings.clone(),
                fresh: false,
            };
            ectx.attribute_broker.attribute_stream(&invocation)
        },
    )))
}

// ============================================================================
// SUBTEMPLATES
// ============================================================================

fn compile_subtemplate(
    ctx: &CompilationContext,
    base: &Expr,
    template: &Expr,
    location: SourceLocation,
) -> Result<CompiledExpression, CompilerError> {
    let base = compile_expression(ctx, base)?;
    let template = compile_expression(ctx, template)?;
    if template.is_stream() {
        return Err(CompilerError::StreamNotAllowed {
            context: "a subtemplate".to_string(),
            location: Some(location),
        });
    }

    if let (Some(b), Some(t)) = (base.constant_value(), template.constant_value()) {
        return Ok(CompiledExpression::Constant(
            apply_constant_template(b, t).with_location(&location),
        ));
    }

    if base.is_stream() {
        return Ok(CompiledExpression::Stream(StreamExpression::new(
            move |ectx: &EvaluationContext| {
                let template = template.clone();
                let ectx_inner = ectx.clone();
                let location = location.clone();
                Box::pin(base.open_stream(ectx).map(move |v| {
                    apply_template(&v, &template, &ectx_inner).with_location(&location)
                }))
            },
        )));
    }

    Ok(CompiledExpression::Pure(PureExpression::new(
        true,
        move |ectx: &EvaluationContext| {
            let v = base.evaluate(ectx);
            apply_template(&v, &template, ectx).with_location(&location)
        },
    )))
}

/// Apply a template to a value, binding `@` to each array element (an empty
/// array stays empty) or to the value itself.
fn apply_template(value: &Value, template: &CompiledExpression, ctx: &EvaluationContext) -> Value {
    if value.is_error() {
        return value.clone();
    }
    match value.kind() {
        ValueKind::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let mapped = template.evaluate(&ctx.with_relative_node(item.clone()));
                if mapped.is_error() {
                    return mapped;
                }
                if mapped.is_undefined() {
                    continue;
                }
                out.push(mapped);
            }
            Value::array(out).merge_metadata(value.metadata())
        }
        _ => template.evaluate(&ctx.with_relative_node(value.clone())),
    }
}

/// Fully constant case: the template cannot reference `@`, so each element
/// maps to the same value.
fn apply_constant_template(value: &Value, template: &Value) -> Value {
    if value.is_error() {
        return value.clone();
    }
    if template.is_error() {
        return template.clone();
    }
    match value.kind() {
        ValueKind::Array(items) => {
            if template.is_undefined() {
                Value::array(Vec::new()).merge_metadata(value.metadata())
            } else {
                Value::array(vec![template.clone(); items.len()])
                    .merge_metadata(value.metadata())
            }
        }
        _ => template.clone(),
    }
}
