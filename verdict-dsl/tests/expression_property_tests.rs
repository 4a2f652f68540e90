//! Property-Based Tests for the Expression Algebra
//!
//! Property: arithmetic over the decimal value model obeys the ring
//! identities within division precision, the secret flag is sticky across
//! every operator, and compiling the same source twice yields the same
//! evaluation result for a fixed subscription.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use proptest::prelude::*;
use verdict_broker::{AttributeBroker, FunctionBroker};
use verdict_core::{AuthorizationSubscription, Value};
use verdict_dsl::operators;
use verdict_dsl::{CompilationContext, DocumentCompiler, EvaluationContext};

fn num(n: i64) -> Value {
    Value::number(BigDecimal::from(n))
}

fn eval_context(subject: i64) -> EvaluationContext {
    EvaluationContext::new(
        AuthorizationSubscription::new(
            serde_json::json!(subject),
            serde_json::Value::Null,
            serde_json::Value::Null,
            serde_json::Value::Null,
        )
        .to_values(),
        Arc::new(AttributeBroker::new()),
        Arc::new(FunctionBroker::with_standard_library()),
    )
}

proptest! {
    #[test]
    fn prop_additive_identity(n in any::<i64>()) {
        prop_assert_eq!(operators::add(&num(n), &num(0)), num(n));
        prop_assert_eq!(operators::subtract(&num(n), &num(n)), num(0));
    }

    #[test]
    fn prop_double_and_halve_round_trips(n in any::<i64>()) {
        let doubled = operators::multiply(&num(n), &num(2));
        prop_assert_eq!(operators::divide(&doubled, &num(2)), num(n));
    }

    #[test]
    fn prop_addition_is_commutative(a in any::<i64>(), b in any::<i64>()) {
        prop_assert_eq!(
            operators::add(&num(a), &num(b)),
            operators::add(&num(b), &num(a))
        );
    }

    #[test]
    fn prop_euclidean_modulo_range(a in any::<i64>(), b in 1i64..10_000) {
        let result = operators::modulo(&num(a), &num(b));
        let r = result.as_number().expect("modulo of numbers is a number");
        prop_assert!(*r >= BigDecimal::from(0));
        prop_assert!(*r < BigDecimal::from(b));
    }

    #[test]
    fn prop_secret_operand_taints_result(a in any::<i64>(), b in any::<i64>()) {
        let secret = num(a).mark_secret();
        prop_assert!(operators::add(&secret, &num(b)).is_secret());
        prop_assert!(operators::multiply(&num(b), &secret).is_secret());
        prop_assert!(operators::equal(&secret, &num(b)).is_secret());
        prop_assert!(operators::less_than(&secret, &num(b)).is_secret());
    }

    #[test]
    fn prop_comparison_totality(a in any::<i64>(), b in any::<i64>()) {
        let lt = operators::less_than(&num(a), &num(b));
        let ge = operators::greater_or_equal(&num(a), &num(b));
        prop_assert_eq!(lt.as_boolean(), ge.as_boolean().map(|x| !x));
    }

    #[test]
    fn prop_compilation_is_deterministic(subject in any::<i64>(), threshold in any::<i32>()) {
        let source = format!("policy \"P\" permit subject > {threshold}");
        let function_broker = Arc::new(FunctionBroker::with_standard_library());
        let attribute_broker = Arc::new(AttributeBroker::new());
        let ctx = eval_context(subject);

        let mut results = Vec::new();
        for _ in 0..2 {
            let mut compilation = CompilationContext::new(
                Arc::clone(&function_broker),
                Arc::clone(&attribute_broker),
            );
            let document = DocumentCompiler::new(&mut compilation)
                .compile(Some("P"), &source)
                .expect("compiles");
            let policy = match document.body {
                verdict_dsl::CompiledBody::Policy(p) => p,
                _ => unreachable!("source is a single policy"),
            };
            results.push(policy.target.evaluate(&ctx));
        }
        prop_assert_eq!(results[0].clone(), results[1].clone());
        prop_assert_eq!(
            results[0].as_boolean(),
            Some(subject > i64::from(threshold))
        );
    }
}
