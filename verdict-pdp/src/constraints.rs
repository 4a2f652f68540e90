//! Constraint enforcement bundles
//!
//! Maps a decision's obligations and advice onto registered handler
//! providers. Obligations are fail-closed: an obligation no provider claims,
//! or whose handler fails, degrades the decision to `DENY`. Advice is
//! best-effort: failures are logged and swallowed.
//!
//! Execution order within a bundle: runnables, then consumers, then deferred
//! handlers. A deferred handler resolving `false` also degrades to `DENY`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::warn;
use verdict_core::{AuthorizationDecision, ConstraintError};

/// What a handler gets to see while running.
#[derive(Debug, Clone)]
pub struct ConstraintContext {
    pub decision: AuthorizationDecision,
    pub constraint: serde_json::Value,
}

/// Fire-and-forget side effect, run before the decision is handed out.
pub trait RunnableConstraintHandlerProvider: Send + Sync {
    fn is_responsible(&self, constraint: &serde_json::Value) -> bool;
    fn handler(&self, constraint: &serde_json::Value) -> Box<dyn Fn() + Send + Sync>;
}

/// Side effect with access to the decision context.
pub trait ConsumerConstraintHandlerProvider: Send + Sync {
    fn is_responsible(&self, constraint: &serde_json::Value) -> bool;
    fn handler(
        &self,
        constraint: &serde_json::Value,
    ) -> Box<dyn Fn(&ConstraintContext) + Send + Sync>;
}

/// Asynchronous handler returning a success signal; a falsy resolution of an
/// obligation handler degrades the decision to `DENY`.
pub trait DeferredConstraintHandlerProvider: Send + Sync {
    fn is_responsible(&self, constraint: &serde_json::Value) -> bool;
    fn handler(
        &self,
        constraint: &serde_json::Value,
    ) -> Box<dyn Fn(&ConstraintContext) -> BoxFuture<'static, bool> + Send + Sync>;
}

struct BundledRunnable {
    run: Box<dyn Fn() + Send + Sync>,
    fatal: bool,
    constraint: serde_json::Value,
}

struct BundledConsumer {
    run: Box<dyn Fn(&ConstraintContext) + Send + Sync>,
    fatal: bool,
    constraint: serde_json::Value,
}

struct BundledDeferred {
    run: Box<dyn Fn(&ConstraintContext) -> BoxFuture<'static, bool> + Send + Sync>,
    fatal: bool,
    constraint: serde_json::Value,
}

/// All handlers collected for one decision.
pub struct ConstraintEnforcementBundle {
    runnables: Vec<BundledRunnable>,
    consumers: Vec<BundledConsumer>,
    deferred: Vec<BundledDeferred>,
}

impl ConstraintEnforcementBundle {
    /// Run every handler in order. The first fatal failure aborts with an
    /// error; advice failures are logged and swallowed.
    pub async fn execute(&self, decision: &AuthorizationDecision) -> Result<(), ConstraintError> {
        for runnable in &self.runnables {
            if catch_unwind(AssertUnwindSafe(|| (runnable.run)())).is_err() {
                if runnable.fatal {
                    return Err(ConstraintError::ObligationFailed {
                        reason: format!("runnable handler for {} panicked", runnable.constraint),
                    });
                }
                warn!(constraint = %runnable.constraint, "advice runnable failed");
            }
        }

        for consumer in &self.consumers {
            let ctx = ConstraintContext {
                decision: decision.clone(),
                constraint: consumer.constraint.clone(),
            };
            if catch_unwind(AssertUnwindSafe(|| (consumer.run)(&ctx))).is_err() {
                if consumer.fatal {
                    return Err(ConstraintError::ObligationFailed {
                        reason: format!("consumer handler for {} panicked", consumer.constraint),
                    });
                }
                warn!(constraint = %consumer.constraint, "advice consumer failed");
            }
        }

        for deferred in &self.deferred {
            let ctx = ConstraintContext {
                decision: decision.clone(),
                constraint: deferred.constraint.clone(),
            };
            let outcome = AssertUnwindSafe((deferred.run)(&ctx)).catch_unwind().await;
            let fulfilled = matches!(outcome, Ok(true));
            if !fulfilled {
                if deferred.fatal {
                    return Err(ConstraintError::ObligationFailed {
                        reason: format!("deferred handler for {} did not succeed", deferred.constraint),
                    });
                }
                warn!(constraint = %deferred.constraint, "advice deferred handler failed");
            }
        }

        Ok(())
    }
}

/// Registry of handler providers, shared by all subscriptions of a PEP.
#[derive(Default)]
pub struct ConstraintEnforcementService {
    runnable_providers: Vec<Arc<dyn RunnableConstraintHandlerProvider>>,
    consumer_providers: Vec<Arc<dyn ConsumerConstraintHandlerProvider>>,
    deferred_providers: Vec<Arc<dyn DeferredConstraintHandlerProvider>>,
}

impl ConstraintEnforcementService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_runnable_provider(
        &mut self,
        provider: Arc<dyn RunnableConstraintHandlerProvider>,
    ) {
        self.runnable_providers.push(provider);
    }

    pub fn register_consumer_provider(
        &mut self,
        provider: Arc<dyn ConsumerConstraintHandlerProvider>,
    ) {
        self.consumer_providers.push(provider);
    }

    pub fn register_deferred_provider(
        &mut self,
        provider: Arc<dyn DeferredConstraintHandlerProvider>,
    ) {
        self.deferred_providers.push(provider);
    }

    /// Assemble the bundle for a decision. Fails when any obligation finds no
    /// responsible provider of any kind.
    pub fn bundle_for(
        &self,
        decision: &AuthorizationDecision,
    ) -> Result<ConstraintEnforcementBundle, ConstraintError> {
        let mut bundle = ConstraintEnforcementBundle {
            runnables: Vec::new(),
            consumers: Vec::new(),
            deferred: Vec::new(),
        };

        for obligation in decision.obligations.iter().flatten() {
            if !self.collect(obligation, true, &mut bundle) {
                return Err(ConstraintError::UnhandledObligation {
                    obligation: obligation.to_string(),
                });
            }
        }
        for advice in decision.advice.iter().flatten() {
            // Providers that are not responsible for advice are skipped.
            self.collect(advice, false, &mut bundle);
        }

        Ok(bundle)
    }

    /// Collect one handler per responsible provider of each kind. Returns
    /// whether any provider claimed the constraint.
    fn collect(
        &self,
        constraint: &serde_json::Value,
        fatal: bool,
        bundle: &mut ConstraintEnforcementBundle,
    ) -> bool {
        let mut handled = false;
        for provider in &self.runnable_providers {
            if provider.is_responsible(constraint) {
                bundle.runnables.push(BundledRunnable {
                    run: provider.handler(constraint),
                    fatal,
                    constraint: constraint.clone(),
                });
                handled = true;
            }
        }
        for provider in &self.consumer_providers {
            if provider.is_responsible(constraint) {
                bundle.consumers.push(BundledConsumer {
                    run: provider.handler(constraint),
                    fatal,
                    constraint: constraint.clone(),
                });
                handled = true;
            }
        }
        for provider in &self.deferred_providers {
            if provider.is_responsible(constraint) {
                bundle.deferred.push(BundledDeferred {
                    run: provider.handler(constraint),
                    fatal,
                    constraint: constraint.clone(),
                });
                handled = true;
            }
        }
        handled
    }

    /// Enforce the constraints of a decision: on any obligation gap or
    /// failure the verdict degrades to `DENY`, otherwise the original
    /// decision stands.
    pub async fn enforce(&self, decision: AuthorizationDecision) -> AuthorizationDecision {
        let bundle = match self.bundle_for(&decision) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "denying access: obligation cannot be handled");
                return AuthorizationDecision::deny();
            }
        };
        match bundle.execute(&decision).await {
            Ok(()) => decision,
            Err(e) => {
                warn!(error = %e, "denying access: obligation handler failed");
                AuthorizationDecision::deny()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use verdict_core::Decision;

    struct MatchText {
        text: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl RunnableConstraintHandlerProvider for MatchText {
        fn is_responsible(&self, constraint: &serde_json::Value) -> bool {
            constraint.as_str() == Some(self.text)
        }

        fn handler(&self, _constraint: &serde_json::Value) -> Box<dyn Fn() + Send + Sync> {
            let calls = Arc::clone(&self.calls);
            Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    struct DeferredOutcome {
        outcome: bool,
    }

    impl DeferredConstraintHandlerProvider for DeferredOutcome {
        fn is_responsible(&self, _constraint: &serde_json::Value) -> bool {
            true
        }

        fn handler(
            &self,
            _constraint: &serde_json::Value,
        ) -> Box<dyn Fn(&ConstraintContext) -> BoxFuture<'static, bool> + Send + Sync> {
            let outcome = self.outcome;
            Box::new(move |_ctx| Box::pin(async move { outcome }))
        }
    }

    struct PanickingRunnable;

    impl RunnableConstraintHandlerProvider for PanickingRunnable {
        fn is_responsible(&self, _constraint: &serde_json::Value) -> bool {
            true
        }

        fn handler(&self, _constraint: &serde_json::Value) -> Box<dyn Fn() + Send + Sync> {
            Box::new(|| panic!("handler exploded"))
        }
    }

    fn permit_with_obligation(ob: &str) -> AuthorizationDecision {
        AuthorizationDecision::permit().with_obligations(vec![serde_json::json!(ob)])
    }

    #[tokio::test]
    async fn test_unhandled_obligation_denies() {
        let service = ConstraintEnforcementService::new();
        let decision = service.enforce(permit_with_obligation("log")).await;
        assert_eq!(decision.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_handled_obligation_keeps_verdict() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut service = ConstraintEnforcementService::new();
        service.register_runnable_provider(Arc::new(MatchText {
            text: "log",
            calls: Arc::clone(&calls),
        }));
        let decision = service.enforce(permit_with_obligation("log")).await;
        assert_eq!(decision.decision, Decision::Permit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_advice_is_skipped() {
        let service = ConstraintEnforcementService::new();
        let decision = AuthorizationDecision::permit().with_advice(vec![serde_json::json!("mail")]);
        let decision = service.enforce(decision).await;
        assert_eq!(decision.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_panicking_obligation_handler_denies() {
        let mut service = ConstraintEnforcementService::new();
        service.register_runnable_provider(Arc::new(PanickingRunnable));
        let decision = service.enforce(permit_with_obligation("log")).await;
        assert_eq!(decision.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_panicking_advice_handler_is_swallowed() {
        let mut service = ConstraintEnforcementService::new();
        service.register_runnable_provider(Arc::new(PanickingRunnable));
        let decision = AuthorizationDecision::permit().with_advice(vec![serde_json::json!("mail")]);
        let decision = service.enforce(decision).await;
        assert_eq!(decision.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_falsy_deferred_obligation_denies() {
        let mut service = ConstraintEnforcementService::new();
        service.register_deferred_provider(Arc::new(DeferredOutcome { outcome: false }));
        let decision = service.enforce(permit_with_obligation("audit")).await;
        assert_eq!(decision.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_truthy_deferred_obligation_permits() {
        let mut service = ConstraintEnforcementService::new();
        service.register_deferred_provider(Arc::new(DeferredOutcome { outcome: true }));
        let decision = service.enforce(permit_with_obligation("audit")).await;
        assert_eq!(decision.decision, Decision::Permit);
    }

    #[tokio::test]
    async fn test_execution_order_runnables_before_deferred() {
        let order = Arc::new(AtomicBool::new(false)); // set by runnable
        let mut service = ConstraintEnforcementService::new();

        struct OrderRunnable {
            flag: Arc<AtomicBool>,
        }
        impl RunnableConstraintHandlerProvider for OrderRunnable {
            fn is_responsible(&self, _c: &serde_json::Value) -> bool {
                true
            }
            fn handler(&self, _c: &serde_json::Value) -> Box<dyn Fn() + Send + Sync> {
                let flag = Arc::clone(&self.flag);
                Box::new(move || flag.store(true, Ordering::SeqCst))
            }
        }

        struct OrderDeferred {
            flag: Arc<AtomicBool>,
        }
        impl DeferredConstraintHandlerProvider for OrderDeferred {
            fn is_responsible(&self, _c: &serde_json::Value) -> bool {
                true
            }
            fn handler(
                &self,
                _c: &serde_json::Value,
            ) -> Box<dyn Fn(&ConstraintContext) -> BoxFuture<'static, bool> + Send + Sync>
            {
                let flag = Arc::clone(&self.flag);
                Box::new(move |_ctx| {
                    let flag = Arc::clone(&flag);
                    Box::pin(async move { flag.load(Ordering::SeqCst) })
                })
            }
        }

        service.register_runnable_provider(Arc::new(OrderRunnable {
            flag: Arc::clone(&order),
        }));
        service.register_deferred_provider(Arc::new(OrderDeferred { flag: order }));

        // The deferred handler only succeeds if the runnable already ran.
        let decision = service.enforce(permit_with_obligation("ordered")).await;
        assert_eq!(decision.decision, Decision::Permit);
    }
}
