//! Document index
//!
//! Holds the compiled documents a PDP evaluates, in publication order
//! (document order matters to `first-applicable`). Only valid documents ever
//! reach the index: invalid parse results are rejected at insertion and
//! compilation failures never produce a `CompiledDocument` at all.

use std::sync::{Arc, Mutex};

use tracing::debug;
use verdict_core::RegistrationError;
use verdict_dsl::{CompiledBody, CompiledDocument, Document, EvaluationContext};

/// An ordered, id-addressed collection of compiled documents.
#[derive(Default)]
pub struct DocumentIndex {
    documents: Mutex<Vec<Arc<CompiledDocument>>>,
}

impl DocumentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a document. A document with the same id is replaced in place,
    /// keeping its position in document order.
    pub fn insert(&self, document: CompiledDocument) {
        let document = Arc::new(document);
        let mut documents = self.documents.lock().expect("document index lock poisoned");
        match documents.iter_mut().find(|d| d.id == document.id) {
            Some(slot) => *slot = document,
            None => documents.push(document),
        }
    }

    /// Guard used by callers holding an unparsed [`Document`]: invalid
    /// documents never reach the index.
    pub fn reject_invalid(document: &Document) -> Result<(), RegistrationError> {
        if document.is_invalid() {
            return Err(RegistrationError::InvalidDocument {
                id: document.id.clone(),
                reason: document
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        Ok(())
    }

    /// Remove a document by id. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let mut documents = self.documents.lock().expect("document index lock poisoned");
        let before = documents.len();
        documents.retain(|d| d.id != id);
        let removed = documents.len() != before;
        if removed {
            debug!(document = %id, "removed document from index");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<CompiledDocument>> {
        self.documents
            .lock()
            .expect("document index lock poisoned")
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Snapshot of all documents in document order.
    pub fn documents(&self) -> Vec<Arc<CompiledDocument>> {
        self.documents
            .lock()
            .expect("document index lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.documents
            .lock()
            .expect("document index lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidate selection: documents whose target does not evaluate to
    /// `false`. A target error keeps the document in (it will contribute
    /// `INDETERMINATE` during evaluation).
    pub fn matching(&self, ctx: &EvaluationContext) -> Vec<Arc<CompiledDocument>> {
        self.documents()
            .into_iter()
            .filter(|document| {
                let target = match &document.body {
                    CompiledBody::Policy(policy) => Some(&policy.target),
                    CompiledBody::PolicySet(set) => set.target.as_ref(),
                };
                match target {
                    None => true,
                    Some(target) => target.evaluate(ctx).as_boolean() != Some(false),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use verdict_broker::{AttributeBroker, FunctionBroker};
    use verdict_core::AuthorizationSubscription;
    use verdict_dsl::{parse_document, CompilationContext, DocumentCompiler};

    fn compile(id: &str, source: &str) -> CompiledDocument {
        let mut ctx = CompilationContext::new(
            StdArc::new(FunctionBroker::with_standard_library()),
            StdArc::new(AttributeBroker::new()),
        );
        DocumentCompiler::new(&mut ctx)
            .compile(Some(id), source)
            .expect("compiles")
    }

    fn context(subject: serde_json::Value) -> EvaluationContext {
        EvaluationContext::new(
            AuthorizationSubscription::new(
                subject,
                serde_json::Value::Null,
                serde_json::Value::Null,
                serde_json::Value::Null,
            )
            .to_values(),
            StdArc::new(AttributeBroker::new()),
            StdArc::new(FunctionBroker::with_standard_library()),
        )
    }

    #[test]
    fn test_insert_replaces_same_id_in_place() {
        let index = DocumentIndex::new();
        index.insert(compile("a", "policy \"A\" permit"));
        index.insert(compile("b", "policy \"B\" permit"));
        index.insert(compile("a", "policy \"A2\" deny"));
        let documents = index.documents();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].name, "A2");
        assert_eq!(documents[1].name, "B");
    }

    #[test]
    fn test_remove() {
        let index = DocumentIndex::new();
        index.insert(compile("a", "policy \"A\" permit"));
        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_invalid_documents_are_rejected() {
        let document = parse_document(Some("bad"), "policy \"A\" maybe");
        let err = DocumentIndex::reject_invalid(&document).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidDocument { .. }));
    }

    #[test]
    fn test_matching_filters_on_target() {
        let index = DocumentIndex::new();
        index.insert(compile("admins", "policy \"A\" permit subject == \"admin\""));
        index.insert(compile("open", "policy \"B\" permit"));
        index.insert(compile("broken", "policy \"C\" permit 1 / 0 == 1"));

        let matched = index.matching(&context(serde_json::json!("admin")));
        assert_eq!(matched.len(), 3);

        let matched = index.matching(&context(serde_json::json!("guest")));
        let ids: Vec<&str> = matched.iter().map(|d| d.id.as_str()).collect();
        // The erroring target stays in; it contributes INDETERMINATE.
        assert_eq!(ids, vec!["open", "broken"]);
    }
}
