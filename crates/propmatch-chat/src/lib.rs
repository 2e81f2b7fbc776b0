//! Per-turn conversation pipeline for PropMatch.
//!
//! Extracts buyer preferences from each message, keeps the lead
//! classification current, retrieves matching listings and generates a reply
//! that is checked against the listings it was given before it is stored.

pub mod error;
pub mod extractor;
pub mod grounding;
pub mod llm;
pub mod locks;
pub mod money;
pub mod openrouter;
pub mod orchestrator;
pub mod prompt;
pub mod reconciler;

pub use error::ChatError;
pub use extractor::{ExtractionError, MetadataExtractor, MetadataPatch, PatchEntry};
pub use grounding::{stated_amounts, GroundingValidator};
pub use llm::{CompletionOptions, LlmClient, LlmError, MessageRole, Prompt, PromptMessage};
pub use locks::{ConversationGuard, ConversationLocks};
pub use openrouter::OpenRouterClient;
pub use orchestrator::{TurnDependencies, TurnOrchestrator, TurnReport, TurnStage, TurnTimings};
pub use prompt::PromptBuilder;
pub use reconciler::{has_sufficient_signal, LeadClassifier, MetadataReconciler, Reconciliation};
