//! Turn orchestrator: runs one user message through the full pipeline.
//!
//! A turn loads history and metadata, extracts preferences while embedding
//! the message, reconciles metadata, searches listings, decides whether to
//! inject them, generates a reply, grounds it against what was injected and
//! persists the whole turn atomically. A failed turn persists nothing.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use propmatch_core::{
    ConversationId, ConversationTurn, FieldSchema, GroundingVerdict, LeadClass, ListingId,
    PropmatchConfig, Role, ScoredListing, UserMetadata,
};
use propmatch_storage::{ConversationStore, TurnCommit};
use propmatch_vector::{DynEmbeddingService, SearchQuery, SimilarityMetric, VectorSearch};

use crate::error::ChatError;
use crate::extractor::MetadataExtractor;
use crate::grounding::{stated_amounts, GroundingValidator};
use crate::llm::{CompletionOptions, LlmClient};
use crate::locks::ConversationLocks;
use crate::prompt::PromptBuilder;
use crate::reconciler::{has_sufficient_signal, MetadataReconciler, Reconciliation};

/// Pipeline stages in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnStage {
    Init,
    /// Waiting for an earlier turn of the same conversation to finish.
    AwaitLock,
    ParallelLoad,
    DetectShown,
    ParallelExtract,
    Reconcile,
    Search,
    DecideInjection,
    BuildPrompt,
    Generate,
    Ground,
    Persist,
    Respond,
}

impl TurnStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStage::Init => "init",
            TurnStage::AwaitLock => "await_lock",
            TurnStage::ParallelLoad => "parallel_load",
            TurnStage::DetectShown => "detect_shown",
            TurnStage::ParallelExtract => "parallel_extract",
            TurnStage::Reconcile => "reconcile",
            TurnStage::Search => "search",
            TurnStage::DecideInjection => "decide_injection",
            TurnStage::BuildPrompt => "build_prompt",
            TurnStage::Generate => "generate",
            TurnStage::Ground => "ground",
            TurnStage::Persist => "persist",
            TurnStage::Respond => "respond",
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock time spent in each completed stage.
#[derive(Clone, Debug, Default)]
pub struct TurnTimings {
    stages: Vec<(TurnStage, Duration)>,
}

impl TurnTimings {
    pub fn record(&mut self, stage: TurnStage, elapsed: Duration) {
        debug!(stage = %stage, elapsed_ms = elapsed.as_millis() as u64, "Stage complete");
        self.stages.push((stage, elapsed));
    }

    pub fn get(&self, stage: TurnStage) -> Option<Duration> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, d)| *d)
    }

    pub fn total(&self) -> Duration {
        self.stages.iter().map(|(_, d)| *d).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TurnStage, Duration)> {
        self.stages.iter()
    }

    /// `stage=ms` pairs, for log lines.
    pub fn summary(&self) -> String {
        self.stages
            .iter()
            .map(|(s, d)| format!("{}={}", s, d.as_millis()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Tracks the current stage so a failure can be attributed to it.
struct TurnProgress {
    stage: TurnStage,
    entered: Instant,
    timings: TurnTimings,
}

impl TurnProgress {
    fn new() -> Self {
        Self {
            stage: TurnStage::Init,
            entered: Instant::now(),
            timings: TurnTimings::default(),
        }
    }

    fn enter(&mut self, next: TurnStage) {
        let now = Instant::now();
        self.timings.record(self.stage, now - self.entered);
        debug!(from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
        self.entered = now;
    }

    fn finish(mut self) -> TurnTimings {
        self.timings.record(self.stage, self.entered.elapsed());
        self.timings
    }
}

/// Outcome of a completed turn.
#[derive(Clone, Debug)]
pub struct TurnReport {
    pub conversation_id: ConversationId,
    /// The reply that was persisted and should be shown to the user.
    pub reply: String,
    pub lead_class: LeadClass,
    pub verdict: GroundingVerdict,
    /// Listings injected into the reply prompt, in rank order.
    pub injected: Vec<ListingId>,
    pub metadata_version: u64,
    pub timings: TurnTimings,
}

/// Capabilities a turn depends on.
#[derive(Clone)]
pub struct TurnDependencies {
    pub store: Arc<dyn ConversationStore>,
    pub embedder: Arc<dyn DynEmbeddingService>,
    pub search: Arc<dyn VectorSearch>,
    pub llm: Arc<dyn LlmClient>,
}

/// Runs turns. One instance serves every conversation.
pub struct TurnOrchestrator {
    store: Arc<dyn ConversationStore>,
    embedder: Arc<dyn DynEmbeddingService>,
    search: Arc<dyn VectorSearch>,
    llm: Arc<dyn LlmClient>,
    schema: FieldSchema,
    extractor: MetadataExtractor,
    reconciler: MetadataReconciler,
    prompt_builder: PromptBuilder,
    grounding: GroundingValidator,
    locks: ConversationLocks,
    reply_options: CompletionOptions,
    fallback_reply: String,
    max_message_chars: usize,
    history_limit: usize,
    top_k: usize,
    score_threshold: f64,
    llm_timeout: Duration,
}

impl TurnOrchestrator {
    /// Wire the pipeline, rejecting a search backend or embedder that does
    /// not match the configured metric and dimension.
    pub fn new(
        deps: TurnDependencies,
        schema: FieldSchema,
        config: &PropmatchConfig,
    ) -> Result<Self, ChatError> {
        let metric: SimilarityMetric = config
            .search
            .metric
            .parse()
            .map_err(|e| ChatError::Config(format!("search.metric: {}", e)))?;
        if deps.search.metric() != metric {
            return Err(ChatError::Config(format!(
                "listing index uses {} but search.metric is {}",
                deps.search.metric(),
                metric
            )));
        }

        let dim = config.search.embedding_dim;
        if deps.embedder.dimensions() != dim {
            return Err(ChatError::Config(format!(
                "embedder produces {} dimensions, search.embedding_dim is {}",
                deps.embedder.dimensions(),
                dim
            )));
        }
        if deps.search.dimensions() != dim {
            return Err(ChatError::Config(format!(
                "listing index has {} dimensions, search.embedding_dim is {}",
                deps.search.dimensions(),
                dim
            )));
        }

        let grounding = GroundingValidator::new(&config.grounding.listing_id_pattern)
            .map_err(|e| ChatError::Config(format!("grounding.listing_id_pattern: {}", e)))?;

        let extractor = MetadataExtractor::new(
            deps.llm.clone(),
            schema.clone(),
            CompletionOptions::extraction(&config.llm),
            Duration::from_millis(config.chat.extraction_timeout_ms),
            config.chat.min_patch_confidence,
        );

        Ok(Self {
            store: deps.store,
            embedder: deps.embedder,
            search: deps.search,
            llm: deps.llm,
            extractor,
            reconciler: MetadataReconciler::new(schema.clone()),
            prompt_builder: PromptBuilder::new(schema.clone()),
            schema,
            grounding,
            locks: ConversationLocks::new(),
            reply_options: CompletionOptions::reply(&config.llm),
            fallback_reply: config.grounding.fallback_reply.clone(),
            max_message_chars: config.chat.max_message_chars,
            history_limit: config.chat.history_limit,
            top_k: config.search.top_k,
            score_threshold: config.search.score_threshold,
            llm_timeout: Duration::from_millis(config.chat.llm_timeout_ms),
        })
    }

    /// Let the grounding check recognise catalogue ids that do not match
    /// the configured id pattern.
    pub fn with_known_listing_ids(mut self, ids: impl IntoIterator<Item = ListingId>) -> Self {
        self.grounding = self.grounding.with_known_ids(ids);
        self
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Handle one user message.
    ///
    /// Turns on the same conversation are serialized; turns on different
    /// conversations run concurrently.
    pub async fn handle_turn(
        &self,
        conversation_id: &ConversationId,
        raw_text: &str,
    ) -> Result<TurnReport, ChatError> {
        let text = self.validate_message(raw_text)?;

        let span = info_span!("turn", conversation_id = %conversation_id);
        let mut progress = TurnProgress::new();
        let result = self
            .run_turn(conversation_id, text, &mut progress)
            .instrument(span.clone())
            .await;

        match result {
            Ok(mut report) => {
                report.timings = progress.finish();
                span.in_scope(|| {
                    info!(
                        lead_class = %report.lead_class,
                        injected = report.injected.len(),
                        grounded = report.verdict.is_safe(),
                        version = report.metadata_version,
                        total_ms = report.timings.total().as_millis() as u64,
                        timings = %report.timings.summary(),
                        "Turn complete"
                    )
                });
                Ok(report)
            }
            Err(e) => {
                span.in_scope(|| {
                    warn!(
                        stage = %progress.stage,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Turn failed"
                    )
                });
                Err(e)
            }
        }
    }

    fn validate_message<'a>(&self, raw_text: &'a str) -> Result<&'a str, ChatError> {
        let text = raw_text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if text.chars().count() > self.max_message_chars {
            return Err(ChatError::MessageTooLong(self.max_message_chars));
        }
        Ok(text)
    }

    async fn run_turn(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        progress: &mut TurnProgress,
    ) -> Result<TurnReport, ChatError> {
        progress.enter(TurnStage::AwaitLock);
        let _guard = self.locks.acquire(conversation_id).await;

        progress.enter(TurnStage::ParallelLoad);
        let (history, stored) = tokio::try_join!(
            self.store.load_history(conversation_id, self.history_limit),
            self.store.load_metadata(conversation_id),
        )?;
        let current =
            stored.unwrap_or_else(|| UserMetadata::initial(conversation_id.clone()));
        let base_version = current.version;

        progress.enter(TurnStage::DetectShown);
        let shown = last_shown(&history);

        progress.enter(TurnStage::ParallelExtract);
        let (patch, embedding) = tokio::join!(
            self.extractor.extract(text, &current, &shown),
            self.embedder.embed_boxed(text),
        );
        let embedding = embedding.map_err(|e| ChatError::Embedding(e.to_string()))?;

        progress.enter(TurnStage::Reconcile);
        let received_at = Utc::now();
        let Reconciliation { metadata, changed } =
            self.reconciler.reconcile(&current, &patch, received_at);

        progress.enter(TurnStage::Search);
        let query = SearchQuery::new(embedding, self.top_k).with_threshold(self.score_threshold);
        let candidates = self
            .search
            .search(query)
            .await
            .map_err(|e| ChatError::Search(e.to_string()))?;

        progress.enter(TurnStage::DecideInjection);
        let injected: Vec<ScoredListing> =
            if has_sufficient_signal(self.schema.injection(), &metadata) {
                candidates
            } else {
                debug!(
                    candidates = candidates.len(),
                    populated = metadata.populated_count(),
                    "Insufficient preferences, withholding listings"
                );
                Vec::new()
            };

        progress.enter(TurnStage::BuildPrompt);
        let listings = (!injected.is_empty()).then_some(injected.as_slice());
        let prompt = self.prompt_builder.build(&history, &metadata, listings, text);

        progress.enter(TurnStage::Generate);
        let reply = tokio::time::timeout(
            self.llm_timeout,
            self.llm.complete(&prompt, &self.reply_options),
        )
        .await
        .map_err(|_| ChatError::LlmTimeout(self.llm_timeout.as_millis() as u64))??;

        progress.enter(TurnStage::Ground);
        let amounts = stated_amounts(text, &metadata);
        let verdict = self.grounding.validate(&reply, &injected, &amounts);
        let reply = match &verdict {
            GroundingVerdict::Safe => reply,
            GroundingVerdict::Risky { offending_claim } => {
                warn!(claim = %offending_claim, "Reply failed grounding, sending fallback");
                self.fallback_reply.clone()
            }
        };

        // Injected ids are recorded even when the fallback replaced the reply.
        let injected_ids: Vec<ListingId> =
            injected.iter().map(|s| s.listing.id.clone()).collect();

        progress.enter(TurnStage::Persist);
        let commit = TurnCommit {
            user_turn: ConversationTurn::user(conversation_id.clone(), text, received_at),
            assistant_turn: ConversationTurn::assistant(
                conversation_id.clone(),
                reply.clone(),
                Utc::now(),
                injected_ids.iter().cloned().collect(),
            ),
            metadata: metadata.clone(),
            base_version,
        };
        self.store.persist_turn(commit).await?;
        debug!(changed, version = metadata.version, "Turn persisted");

        progress.enter(TurnStage::Respond);
        Ok(TurnReport {
            conversation_id: conversation_id.clone(),
            reply,
            lead_class: metadata.lead_class,
            verdict,
            injected: injected_ids,
            metadata_version: metadata.version,
            timings: TurnTimings::default(),
        })
    }
}

/// Listing ids attached to the most recent assistant turn.
fn last_shown(history: &[ConversationTurn]) -> BTreeSet<ListingId> {
    history
        .iter()
        .rev()
        .find(|t| t.role == Role::Assistant)
        .map(|t| t.listing_ids.clone())
        .unwrap_or_default()
}
