//! PropMatch application binary - composition root.
//!
//! Ties the PropMatch crates together into a single executable:
//! 1. Load configuration from TOML and the domain schema
//! 2. Open the conversation store (SQLite, or in memory with `--ephemeral`)
//! 3. Embed and index the listing catalogue
//! 4. Wire the turn orchestrator to the LLM provider
//! 5. Run the chosen subcommand

mod cli;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use propmatch_chat::{OpenRouterClient, TurnDependencies, TurnOrchestrator, TurnReport};
use propmatch_core::{ConversationId, FieldSchema, PropmatchConfig, Role};
use propmatch_storage::{
    ConversationStore, Database, MemoryConversationStore, SqliteConversationStore,
};
use propmatch_vector::{
    index_listings, load_listings, DynEmbeddingService, HttpEmbeddingService,
    InMemoryListingIndex, MockEmbedding, SimilarityMetric,
};

use cli::{expand_home, CliArgs, Command};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    // Config is read before tracing starts so its log level can apply.
    let config_file = args.resolve_config_path();
    let loaded = PropmatchConfig::load(&config_file);
    let log_level = args.resolve_log_level(
        loaded
            .as_ref()
            .map(|c| c.general.log_level.as_str())
            .unwrap_or("info"),
    );

    // Logs go to stderr so replies on stdout stay clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting PropMatch v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(config) => {
            tracing::info!(path = %config_file.display(), "Configuration loaded");
            config
        }
        Err(e) => {
            tracing::warn!(path = %config_file.display(), error = %e, "Failed to load config, using defaults");
            PropmatchConfig::default()
        }
    };

    match args.command {
        Command::CheckSchema { path } => check_schema(path.as_deref(), &config),
        Command::History {
            conversation,
            limit,
        } => {
            let store = open_store(&config, args.ephemeral)?;
            print_history(store.as_ref(), &ConversationId::new(conversation), limit).await
        }
        Command::Metadata { conversation } => {
            let store = open_store(&config, args.ephemeral)?;
            print_metadata(store.as_ref(), &ConversationId::new(conversation)).await
        }
        Command::Chat {
            conversation,
            message,
        } => run_chat(&config, args.ephemeral, conversation, message).await,
    }
}

fn open_store(config: &PropmatchConfig, ephemeral: bool) -> AppResult<Arc<dyn ConversationStore>> {
    if ephemeral {
        tracing::info!("Using in-memory conversation store; nothing will be saved");
        return Ok(Arc::new(MemoryConversationStore::new()));
    }
    let db_path = expand_home(&config.storage.db_path);
    let db = Database::new(&db_path)?;
    Ok(Arc::new(SqliteConversationStore::new(Arc::new(db))))
}

/// Load the configured schema, falling back to the built-in real-estate
/// schema when the file does not exist.
fn load_schema(path: &Path) -> AppResult<FieldSchema> {
    if path.exists() {
        return Ok(FieldSchema::load(path)?);
    }
    tracing::warn!(path = %path.display(), "Schema file not found, using built-in real-estate schema");
    Ok(FieldSchema::real_estate()?)
}

fn build_embedder(config: &PropmatchConfig) -> AppResult<Arc<dyn DynEmbeddingService>> {
    let search = &config.search;
    if search.embedding_url.trim().is_empty() {
        tracing::info!(
            dimensions = search.embedding_dim,
            "No embedding endpoint configured, using mock embeddings"
        );
        return Ok(Arc::new(MockEmbedding::with_dimensions(search.embedding_dim)));
    }

    let api_key = std::env::var(&config.llm.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty());
    Ok(Arc::new(HttpEmbeddingService::new(
        &search.embedding_url,
        &search.embedding_model,
        api_key,
        search.embedding_dim,
        Duration::from_millis(config.chat.llm_timeout_ms),
    )?))
}

async fn build_index(
    config: &PropmatchConfig,
    embedder: &dyn DynEmbeddingService,
) -> AppResult<Arc<InMemoryListingIndex>> {
    let metric: SimilarityMetric = config.search.metric.parse()?;
    let index = InMemoryListingIndex::new(metric, config.search.embedding_dim);

    let path = expand_home(&config.general.listings_path);
    if path.exists() {
        let docs = load_listings(&path)?;
        index_listings(&index, embedder, docs).await?;
    } else {
        tracing::warn!(path = %path.display(), "Listing catalogue not found, index is empty");
    }
    Ok(Arc::new(index))
}

async fn run_chat(
    config: &PropmatchConfig,
    ephemeral: bool,
    conversation: Option<String>,
    message: Option<String>,
) -> AppResult<()> {
    let schema = load_schema(&expand_home(&config.general.schema_path))?;
    let store = open_store(config, ephemeral)?;
    let embedder = build_embedder(config)?;
    let index = build_index(config, embedder.as_ref()).await?;
    let llm = OpenRouterClient::from_config(
        &config.llm,
        Duration::from_millis(config.chat.llm_timeout_ms),
    )?;

    let known_ids = index.ids();
    let deps = TurnDependencies {
        store,
        embedder,
        search: index,
        llm: Arc::new(llm),
    };
    let orchestrator = TurnOrchestrator::new(deps, schema, config)?.with_known_listing_ids(known_ids);

    let conversation_id = ConversationId::new(
        conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );

    if let Some(message) = message {
        let report = orchestrator.handle_turn(&conversation_id, &message).await?;
        print_reply(&report);
        return Ok(());
    }

    println!("Conversation {} (type /quit to exit)", conversation_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }

        match orchestrator.handle_turn(&conversation_id, line).await {
            Ok(report) => print_reply(&report),
            Err(e) if e.is_retryable() => eprintln!("error: {} (you can try again)", e),
            Err(e) => eprintln!("error: {}", e),
        }
    }
    Ok(())
}

fn print_reply(report: &TurnReport) {
    println!("{}", report.reply);
    println!(
        "  [lead: {} | listings: {} | preferences v{}]",
        report.lead_class,
        report.injected.len(),
        report.metadata_version
    );
}

async fn print_history(
    store: &dyn ConversationStore,
    conversation_id: &ConversationId,
    limit: usize,
) -> AppResult<()> {
    let turns = store.load_history(conversation_id, limit).await?;
    if turns.is_empty() {
        println!("No turns stored for {}", conversation_id);
        return Ok(());
    }

    for turn in turns {
        let speaker = match turn.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!(
            "[{}] {}: {}",
            turn.timestamp.format("%Y-%m-%d %H:%M:%S"),
            speaker,
            turn.text
        );
        if !turn.listing_ids.is_empty() {
            let ids: Vec<&str> = turn.listing_ids.iter().map(|id| id.as_str()).collect();
            println!("    listings: {}", ids.join(", "));
        }
    }
    Ok(())
}

async fn print_metadata(
    store: &dyn ConversationStore,
    conversation_id: &ConversationId,
) -> AppResult<()> {
    match store.load_metadata(conversation_id).await? {
        Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
        None => println!("No preferences stored for {}", conversation_id),
    }
    Ok(())
}

fn check_schema(path: Option<&Path>, config: &PropmatchConfig) -> AppResult<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| expand_home(&config.general.schema_path));
    let schema = FieldSchema::load(&path)?;

    println!(
        "Schema '{}' is valid ({} fields)",
        schema.name(),
        schema.fields().len()
    );
    for field in schema.fields() {
        println!(
            "  {:<16} {:<14} weight {:.2}",
            field.name,
            format!("{:?}", field.kind),
            field.weight
        );
    }
    let thresholds = schema.thresholds();
    println!(
        "  lead thresholds: hot >= {}, warm >= {}",
        thresholds.hot, thresholds.warm
    );
    let rule = schema.injection();
    println!(
        "  listings shown once {} are known and {} fields are populated",
        rule.required_fields.join(", "),
        rule.min_populated
    );
    Ok(())
}
