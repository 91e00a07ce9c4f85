//! Coaching trigger
//!
//! Every final transcript fragment is handed to the coaching analyzer in its
//! own task, together with the owner's knowledge base. The analyzer delivers
//! any advice to observers itself. Nothing here reports back to ingestion:
//! failures are logged and the advice for that line is simply lost.

use async_trait::async_trait;
use callhub_common::events::{ObserverMessage, Speaker, TranscriptFragment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CollaboratorError;
use crate::hub::BroadcastHub;
use crate::registry::SessionContext;

/// One line sent for analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoachingRequest {
    pub session_id: Uuid,
    pub call_id: String,
    pub owner_id: Option<String>,
    pub lead_id: Option<String>,
    pub speaker: Speaker,
    pub line: String,
    pub knowledge_base: String,
    pub timestamp: DateTime<Utc>,
}

/// Source of per-owner coaching material
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn retrieve(&self, context: &SessionContext) -> Result<String, CollaboratorError>;
}

/// Produces advice for a line and delivers it to observers
#[async_trait]
pub trait CoachingAnalyzer: Send + Sync {
    async fn analyze(&self, request: CoachingRequest) -> Result<(), CollaboratorError>;
}

struct Collaborators {
    knowledge: Arc<dyn KnowledgeBase>,
    analyzer: Arc<dyn CoachingAnalyzer>,
}

/// Fire-and-forget dispatcher for coaching analysis
#[derive(Clone)]
pub struct CoachingTrigger {
    inner: Option<Arc<Collaborators>>,
}

impl CoachingTrigger {
    pub fn new(knowledge: Arc<dyn KnowledgeBase>, analyzer: Arc<dyn CoachingAnalyzer>) -> Self {
        Self {
            inner: Some(Arc::new(Collaborators { knowledge, analyzer })),
        }
    }

    /// Trigger that never analyzes (no analyzer configured)
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Dispatch analysis of `fragment` if it is final
    ///
    /// Returns whether a task was spawned. Never waits on the analysis.
    pub fn on_final_fragment(&self, context: &SessionContext, fragment: &TranscriptFragment) -> bool {
        if !fragment.is_final {
            return false;
        }
        let Some(inner) = self.inner.clone() else {
            return false;
        };

        let context = context.clone();
        let fragment = fragment.clone();
        tokio::spawn(async move {
            let knowledge_base = match inner.knowledge.retrieve(&context).await {
                Ok(kb) => kb,
                Err(e) => {
                    warn!("Coaching: knowledge base unavailable for call {}: {}", context.call_id, e);
                    String::new()
                }
            };

            let request = CoachingRequest {
                session_id: context.session_id,
                call_id: context.call_id.clone(),
                owner_id: context.owner_id.clone(),
                lead_id: context.lead_id.clone(),
                speaker: fragment.speaker,
                line: fragment.content,
                knowledge_base,
                timestamp: fragment.timestamp,
            };

            match inner.analyzer.analyze(request).await {
                Ok(()) => debug!("Coaching: analysis finished for call {}", context.call_id),
                Err(e) => warn!("Coaching: analysis failed for call {}: {}", context.call_id, e),
            }
        });
        true
    }
}

/// Knowledge base read from `<dir>/<owner>.md`, falling back to `default.md`
#[derive(Debug, Clone)]
pub struct FileKnowledgeBase {
    dir: PathBuf,
}

impl FileKnowledgeBase {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Owner ids become file names; anything outside `[A-Za-z0-9_-]` is refused
    fn owner_file(&self, owner_id: Option<&str>) -> Option<PathBuf> {
        let owner = owner_id?;
        let safe = !owner.is_empty()
            && owner
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{}.md", owner)))
    }

    async fn read_optional(path: PathBuf) -> Result<Option<String>, CollaboratorError> {
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KnowledgeBase for FileKnowledgeBase {
    async fn retrieve(&self, context: &SessionContext) -> Result<String, CollaboratorError> {
        if let Some(path) = self.owner_file(context.owner_id.as_deref()) {
            if let Some(text) = Self::read_optional(path).await? {
                return Ok(text);
            }
        }
        Ok(Self::read_optional(self.dir.join("default.md"))
            .await?
            .unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct CoachingAdvice {
    tip: Option<String>,
    category: Option<String>,
}

/// Analyzer that POSTs each request to an HTTP endpoint
///
/// A `200` answer with a non-empty `tip` is published as a `coaching_tip`;
/// `204` or an empty tip means the line needed no advice.
pub struct HttpCoachingAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    hub: Arc<BroadcastHub>,
}

impl HttpCoachingAnalyzer {
    pub fn new(endpoint: String, timeout: Duration, hub: Arc<BroadcastHub>) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Network(e.to_string()))?;
        Ok(Self { client, endpoint, hub })
    }
}

#[async_trait]
impl CoachingAnalyzer for HttpCoachingAnalyzer {
    async fn analyze(&self, request: CoachingRequest) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }

        let advice: CoachingAdvice = response.json().await?;
        let Some(tip) = advice.tip.filter(|t| !t.trim().is_empty()) else {
            return Ok(());
        };

        let message = ObserverMessage::CoachingTip {
            session_id: request.session_id,
            call_id: request.call_id,
            tip,
            category: advice.category,
            timestamp: Utc::now(),
        };
        self.hub.publish(request.session_id, message).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticKnowledge(Result<&'static str, ()>);

    #[async_trait]
    impl KnowledgeBase for StaticKnowledge {
        async fn retrieve(&self, _context: &SessionContext) -> Result<String, CollaboratorError> {
            self.0
                .map(str::to_string)
                .map_err(|_| CollaboratorError::Network("kb down".into()))
        }
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<CoachingRequest>,
        fail: bool,
    }

    #[async_trait]
    impl CoachingAnalyzer for Recorder {
        async fn analyze(&self, request: CoachingRequest) -> Result<(), CollaboratorError> {
            let _ = self.tx.send(request);
            if self.fail {
                Err(CollaboratorError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    fn context(owner: Option<&str>) -> SessionContext {
        SessionContext {
            call_id: "CA1".into(),
            session_id: Uuid::new_v4(),
            lead_id: None,
            owner_id: owner.map(str::to_string),
            started_at: Utc::now(),
        }
    }

    fn fragment(text: &str, is_final: bool) -> TranscriptFragment {
        TranscriptFragment {
            speaker: Speaker::Customer,
            content: text.into(),
            timestamp: Utc::now(),
            is_final,
            confidence: Some(0.9),
        }
    }

    fn trigger(kb: Result<&'static str, ()>, fail: bool) -> (CoachingTrigger, mpsc::UnboundedReceiver<CoachingRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let trigger = CoachingTrigger::new(Arc::new(StaticKnowledge(kb)), Arc::new(Recorder { tx, fail }));
        (trigger, rx)
    }

    #[tokio::test]
    async fn test_partial_fragments_never_trigger() {
        let (trigger, mut rx) = trigger(Ok("kb"), false);

        assert!(!trigger.on_final_fragment(&context(None), &fragment("we already", false)));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_final_fragment_triggers_once_with_text() {
        let (trigger, mut rx) = trigger(Ok("Objection handling notes"), false);

        assert!(trigger.on_final_fragment(&context(Some("rep-1")), &fragment("We already have CAD software", true)));

        let request = rx.recv().await.unwrap();
        assert_eq!(request.line, "We already have CAD software");
        assert_eq!(request.knowledge_base, "Objection handling notes");
        assert_eq!(request.speaker, Speaker::Customer);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "exactly one invocation per fragment");
    }

    #[tokio::test]
    async fn test_knowledge_base_failure_still_analyzes() {
        let (trigger, mut rx) = trigger(Err(()), false);
        trigger.on_final_fragment(&context(None), &fragment("pricing?", true));

        let request = rx.recv().await.unwrap();
        assert!(request.knowledge_base.is_empty());
    }

    #[tokio::test]
    async fn test_analyzer_failure_is_contained() {
        let (trigger, mut rx) = trigger(Ok("kb"), true);
        assert!(trigger.on_final_fragment(&context(None), &fragment("one", true)));
        assert!(trigger.on_final_fragment(&context(None), &fragment("two", true)));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_disabled_trigger() {
        let trigger = CoachingTrigger::disabled();
        assert!(!trigger.is_enabled());
        assert!(!trigger.on_final_fragment(&context(None), &fragment("hi", true)));
    }

    #[tokio::test]
    async fn test_file_knowledge_base_owner_then_default() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("rep-1.md"), "rep one playbook").await.unwrap();
        tokio::fs::write(dir.path().join("default.md"), "house playbook").await.unwrap();
        let kb = FileKnowledgeBase::new(dir.path());

        assert_eq!(kb.retrieve(&context(Some("rep-1"))).await.unwrap(), "rep one playbook");
        assert_eq!(kb.retrieve(&context(Some("rep-2"))).await.unwrap(), "house playbook");
        assert_eq!(kb.retrieve(&context(Some("../etc/passwd"))).await.unwrap(), "house playbook");
        assert_eq!(kb.retrieve(&context(None)).await.unwrap(), "house playbook");
    }

    #[tokio::test]
    async fn test_file_knowledge_base_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let kb = FileKnowledgeBase::new(dir.path().join("missing"));
        assert_eq!(kb.retrieve(&context(Some("rep-1"))).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_http_analyzer_publishes_tip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(body_partial_json(serde_json::json!({"line": "We already have CAD software"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tip": "Ask what they like least about it",
                "category": "objection"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new(8, Duration::from_millis(50)));
        let ctx = context(Some("rep-1"));
        let mut sub = hub.subscribe(ctx.session_id);
        let analyzer = HttpCoachingAnalyzer::new(format!("{}/analyze", server.uri()), Duration::from_secs(5), hub.clone()).unwrap();

        analyzer
            .analyze(CoachingRequest {
                session_id: ctx.session_id,
                call_id: ctx.call_id.clone(),
                owner_id: ctx.owner_id.clone(),
                lead_id: None,
                speaker: Speaker::Customer,
                line: "We already have CAD software".into(),
                knowledge_base: String::new(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        match sub.try_recv() {
            Some(ObserverMessage::CoachingTip { tip, category, .. }) => {
                assert_eq!(tip, "Ask what they like least about it");
                assert_eq!(category.as_deref(), Some("objection"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_analyzer_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let hub = Arc::new(BroadcastHub::new(8, Duration::from_millis(50)));
        let analyzer = HttpCoachingAnalyzer::new(server.uri(), Duration::from_secs(5), hub).unwrap();
        let ctx = context(None);

        let err = analyzer
            .analyze(CoachingRequest {
                session_id: ctx.session_id,
                call_id: ctx.call_id,
                owner_id: None,
                lead_id: None,
                speaker: Speaker::Agent,
                line: "hello".into(),
                knowledge_base: String::new(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CollaboratorError::Status(503)));
    }
}
