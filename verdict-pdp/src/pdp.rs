//! The Policy Decision Point facade
//!
//! Wires the document index, the brokers, and the combining algorithm into
//! the PDP API: `decide` opens a continuously updated decision stream for a
//! subscription; `decide_once` is the blocking-style adapter awaiting the
//! first decision; `decide_traced` additionally carries a JSON trace of the
//! per-document contributions.
//!
//! `decide` must be called from within a Tokio runtime: attribute streams
//! spawn their PIP pumps on the ambient runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{future, stream, StreamExt};
use tracing::debug;
use verdict_broker::{
    combine_latest, distinct_until_changed, AttributeBroker, BoxedStream, FunctionBroker,
    InvocationSettings,
};
use verdict_core::{
    AuthorizationDecision, AuthorizationSubscription, CombiningAlgorithm, TraceLevel, Value,
};
use verdict_dsl::{CompilationContext, CompilerError, DocumentCompiler, EvaluationContext};

use crate::combining::combine;
use crate::evaluate::{evaluate_document, PolicyDecision, PolicyDecisionStream};
use crate::index::DocumentIndex;

/// PDP-level configuration.
#[derive(Debug, Clone)]
pub struct PdpConfiguration {
    /// Identifies this configuration in attribute invocations.
    pub id: String,
    /// Top-level combining algorithm across documents.
    pub algorithm: CombiningAlgorithm,
    /// Variables visible to every policy.
    pub variables: BTreeMap<String, Value>,
    pub trace_level: TraceLevel,
    /// Timing policy applied to attribute invocations.
    pub attribute_settings: InvocationSettings,
}

impl Default for PdpConfiguration {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            algorithm: CombiningAlgorithm::DenyOverrides,
            variables: BTreeMap::new(),
            trace_level: TraceLevel::Off,
            attribute_settings: InvocationSettings::default(),
        }
    }
}

impl PdpConfiguration {
    pub fn new(algorithm: CombiningAlgorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_trace_level(mut self, trace_level: TraceLevel) -> Self {
        self.trace_level = trace_level;
        self
    }

    pub fn with_attribute_settings(mut self, settings: InvocationSettings) -> Self {
        self.attribute_settings = settings;
        self
    }
}

/// A decision together with a JSON trace of the evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TracedDecision {
    pub decision: AuthorizationDecision,
    pub trace: serde_json::Value,
}

/// The engine: documents in, decision streams out.
pub struct PolicyDecisionPoint {
    configuration: PdpConfiguration,
    index: Arc<DocumentIndex>,
    attribute_broker: Arc<AttributeBroker>,
    function_broker: Arc<FunctionBroker>,
}

impl PolicyDecisionPoint {
    pub fn new(
        configuration: PdpConfiguration,
        attribute_broker: Arc<AttributeBroker>,
        function_broker: Arc<FunctionBroker>,
    ) -> Self {
        Self {
            configuration,
            index: Arc::new(DocumentIndex::new()),
            attribute_broker,
            function_broker,
        }
    }

    /// A PDP with default configuration and a standard-library function
    /// broker, mostly for embedding and tests.
    pub fn embedded(algorithm: CombiningAlgorithm) -> Self {
        Self::new(
            PdpConfiguration::new(algorithm),
            Arc::new(AttributeBroker::new()),
            Arc::new(FunctionBroker::with_standard_library()),
        )
    }

    pub fn configuration(&self) -> &PdpConfiguration {
        &self.configuration
    }

    pub fn index(&self) -> &Arc<DocumentIndex> {
        &self.index
    }

    pub fn attribute_broker(&self) -> &Arc<AttributeBroker> {
        &self.attribute_broker
    }

    pub fn function_broker(&self) -> &Arc<FunctionBroker> {
        &self.function_broker
    }

    /// Compile a source document and publish it to the index. Returns the
    /// document id.
    pub fn load_document(&self, id: Option<&str>, source: &str) -> Result<String, CompilerError> {
        let mut compilation = CompilationContext::new(
            Arc::clone(&self.function_broker),
            Arc::clone(&self.attribute_broker),
        )
        .with_trace_level(self.configuration.trace_level);
        let document = DocumentCompiler::new(&mut compilation).compile(id, source)?;
        let id = document.id.clone();
        self.index.insert(document);
        Ok(id)
    }

    /// Remove a document from the index.
    pub fn unload_document(&self, id: &str) -> bool {
        self.index.remove(id)
    }

    fn evaluation_context(&self, subscription: &AuthorizationSubscription) -> EvaluationContext {
        EvaluationContext::new(
            subscription.to_values(),
            Arc::clone(&self.attribute_broker),
            Arc::clone(&self.function_broker),
        )
        .with_variables(self.configuration.variables.clone())
        .with_pdp_config_id(self.configuration.id.as_str())
        .with_attribute_settings(self.configuration.attribute_settings.clone())
        .with_trace_level(self.configuration.trace_level)
    }

    fn document_decisions(
        &self,
        ctx: &EvaluationContext,
    ) -> (Vec<String>, Vec<PolicyDecisionStream>) {
        let documents = self.index.matching(ctx);
        debug!(
            candidates = documents.len(),
            total = self.index.len(),
            "selected candidate documents"
        );
        let ids = documents.iter().map(|d| d.id.clone()).collect();
        let streams = documents
            .iter()
            .map(|document| evaluate_document(document, ctx))
            .collect();
        (ids, streams)
    }

    fn combined(&self, streams: Vec<PolicyDecisionStream>) -> BoxedStream<Vec<PolicyDecision>> {
        if streams.is_empty() {
            Box::pin(stream::once(future::ready(Vec::new())))
        } else {
            combine_latest(streams)
        }
    }

    /// Open the decision stream for a subscription. Consecutive equal
    /// decisions are deduplicated.
    pub fn decide(
        &self,
        subscription: &AuthorizationSubscription,
    ) -> BoxedStream<AuthorizationDecision> {
        let ctx = self.evaluation_context(subscription);
        let (_, streams) = self.document_decisions(&ctx);
        let algorithm = self.configuration.algorithm;
        let decisions = self
            .combined(streams)
            .map(move |per_document| combine(algorithm, &per_document).to_authorization_decision());
        Box::pin(distinct_until_changed(decisions))
    }

    /// Blocking-style adapter: await the first decision of the stream.
    pub async fn decide_once(
        &self,
        subscription: &AuthorizationSubscription,
    ) -> AuthorizationDecision {
        self.decide(subscription)
            .next()
            .await
            .unwrap_or_else(AuthorizationDecision::indeterminate)
    }

    /// Like [`PolicyDecisionPoint::decide`], with a JSON trace tree of the
    /// per-document decisions. With `TraceLevel::Off` the trace is empty.
    pub fn decide_traced(
        &self,
        subscription: &AuthorizationSubscription,
    ) -> BoxedStream<TracedDecision> {
        let ctx = self.evaluation_context(subscription);
        let (ids, streams) = self.document_decisions(&ctx);
        let algorithm = self.configuration.algorithm;
        let trace_level = self.configuration.trace_level;
        let ids = Arc::new(ids);
        let traced = self.combined(streams).map(move |per_document| {
            let combined = combine(algorithm, &per_document);
            let trace = if trace_level == TraceLevel::Off {
                serde_json::Value::Null
            } else {
                serde_json::json!({
                    "algorithm": algorithm.as_str(),
                    "documents": ids
                        .iter()
                        .zip(&per_document)
                        .map(|(id, d)| serde_json::json!({
                            "id": id,
                            "decision": d.decision.to_string(),
                        }))
                        .collect::<Vec<_>>(),
                })
            };
            TracedDecision {
                decision: combined.to_authorization_decision(),
                trace,
            }
        });
        Box::pin(distinct_until_changed(traced))
    }
}
