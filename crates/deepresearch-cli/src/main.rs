mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use deepresearch_core::{
    ChatHistoryStore, ChatLoop, LoggingTelemetry, Orchestrator, PersonaStore, PreferencesStore, Session,
    StartOptions,
};
use deepresearch_memory::{ManagerCache, RecallRequest, StoreRequest};
use deepresearch_provider::{LlmClient, SearchClient};
use deepresearch_schema::memory::MemoryLayer;
use deepresearch_schema::persona::TerminalPreferences;
use deepresearch_schema::CoreError;
use deepresearch_server::AppState;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "deepresearch", version, about = "Interactive deep research terminal")]
struct Cli {
    #[arg(long, help = "Overrides STORAGE_DIR for this invocation")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the session server")]
    Serve {
        #[arg(long, default_value = "3000")]
        port: u16,
    },
    #[command(about = "Run a one-shot research expansion and print the summary")]
    Research {
        topic: String,
        #[arg(long, default_value = "2")]
        depth: u32,
        #[arg(long, default_value = "3")]
        breadth: u32,
    },
    #[command(about = "Local REPL chat loop for testing without a connected client")]
    Chat {
        #[arg(long, default_value = "local")]
        user: String,
    },
    #[command(subcommand, about = "Persona catalog management")]
    Persona(PersonaCommands),
    #[command(subcommand, about = "Memory subsystem inspection")]
    Memory(MemoryCommands),
}

#[derive(Subcommand)]
enum PersonaCommands {
    List,
    Get,
    Set { slug: String },
}

#[derive(Subcommand)]
enum MemoryCommands {
    Store {
        #[arg(long, default_value = "local")]
        user: String,
        content: String,
    },
    Recall {
        #[arg(long, default_value = "local")]
        user: String,
        query: String,
    },
    Stats {
        #[arg(long, default_value = "local")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }
    init_logging(&config.storage_dir)?;

    let exit_code = match run(cli.command, &config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(&e)
        }
    };
    std::process::exit(exit_code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<CoreError>() {
        Some(core_err) => core_err.exit_code(),
        None => 1,
    }
}

fn init_logging(storage_dir: &std::path::Path) -> Result<()> {
    let log_dir = storage_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "deepresearch.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive the process, and the CLI
    // process exits via `std::process::exit`, which skips destructors.
    Box::leak(Box::new(guard));

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();
    Ok(())
}

async fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Serve { port } => cmd_serve(config, port).await,
        Commands::Research { topic, depth, breadth } => cmd_research(config, &topic, depth, breadth).await,
        Commands::Chat { user } => cmd_chat(config, &user).await,
        Commands::Persona(action) => cmd_persona(config, action).await,
        Commands::Memory(action) => cmd_memory(config, action).await,
    }
}

fn build_search_client(config: &Config) -> SearchClient {
    SearchClient::new(config.search_api_base.clone(), config.search_api_key.clone())
}

fn build_llm_client(config: &Config) -> LlmClient {
    LlmClient::new(
        config.llm_api_base.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
        deepresearch_core::persona::known_slugs(),
    )
}

async fn cmd_serve(config: &Config, port: u16) -> Result<()> {
    std::fs::create_dir_all(&config.storage_dir)?;
    let llm = Arc::new(build_llm_client(config));
    let orchestrator = Arc::new(Orchestrator::new(build_search_client(config), build_llm_client(config)));
    let memory = Arc::new(ManagerCache::new(
        config.storage_dir.to_string_lossy().to_string(),
        Some(Arc::clone(&llm)),
    ));
    let state = AppState {
        storage_dir: config.storage_dir.clone(),
        orchestrator,
        llm,
        memory,
        persona_store: Arc::new(PersonaStore::new(&config.storage_dir)),
        preferences_store: Arc::new(PreferencesStore::new(&config.storage_dir, TerminalPreferences::default())),
        chat_history: Arc::new(ChatHistoryStore::new(&config.storage_dir)),
        remote_sync: config.remote_sync_enabled,
    };
    deepresearch_server::serve(state, &format!("0.0.0.0:{port}")).await
}

async fn cmd_research(config: &Config, topic: &str, depth: u32, breadth: u32) -> Result<()> {
    let orchestrator = Orchestrator::new(build_search_client(config), build_llm_client(config));
    let telemetry = Arc::new(LoggingTelemetry);
    let options = StartOptions { depth, breadth, ..Default::default() };
    let result = orchestrator.start(topic, options, telemetry, CancellationToken::new()).await?;

    if result.success {
        println!("{}", result.summary);
        println!("\n(saved as {})", result.suggested_filename);
        Ok(())
    } else {
        anyhow::bail!(result.error.unwrap_or_else(|| "research run failed".to_string()))
    }
}

async fn cmd_chat(config: &Config, user: &str) -> Result<()> {
    let llm = Arc::new(build_llm_client(config));
    let memory = Arc::new(ManagerCache::new(config.storage_dir.to_string_lossy().to_string(), Some(Arc::clone(&llm))));
    let persona_store = PersonaStore::new(&config.storage_dir);
    let persona = persona_store.get_default().await;
    let chat_loop = ChatLoop::new(llm, memory, user.to_string(), persona, config.remote_sync_enabled);
    let session = Session::new(Some(user.to_string()));
    let telemetry = LoggingTelemetry;

    println!("deepresearch chat — type /exit to quit");
    let mut line = String::new();
    loop {
        line.clear();
        print!("> ");
        use std::io::Write as _;
        std::io::stdout().flush()?;
        if std::io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/exit" {
            chat_loop.on_exit(&session).await?;
            break;
        }
        match chat_loop.turn(&session, input, &telemetry).await {
            Ok(outcome) => println!("{}", outcome.reply),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

async fn cmd_persona(config: &Config, action: PersonaCommands) -> Result<()> {
    let store = PersonaStore::new(&config.storage_dir);
    match action {
        PersonaCommands::List => {
            for persona in deepresearch_core::persona::catalog() {
                println!("{} — {}", persona.slug, persona.description);
            }
        }
        PersonaCommands::Get => {
            println!("{}", store.get_default().await.slug);
        }
        PersonaCommands::Set { slug } => {
            let persona = store.set_default(&slug).await?;
            println!("default persona set to {}", persona.slug);
        }
    }
    Ok(())
}

async fn cmd_memory(config: &Config, action: MemoryCommands) -> Result<()> {
    let llm = Arc::new(build_llm_client(config));
    let memory = Arc::new(ManagerCache::new(config.storage_dir.to_string_lossy().to_string(), Some(Arc::clone(&llm))));
    match action {
        MemoryCommands::Store { user, content } => {
            let manager = memory.get_or_create(&user, MemoryLayer::Working, config.remote_sync_enabled).await?;
            let record = manager.store(StoreRequest { content, ..Default::default() }).await?;
            println!("stored {}", record.id);
        }
        MemoryCommands::Recall { user, query } => {
            let manager = memory.get_or_create(&user, MemoryLayer::Working, config.remote_sync_enabled).await?;
            let records = manager.recall(RecallRequest { query, ..Default::default() }).await?;
            for record in records {
                println!("- {}", record.content);
            }
        }
        MemoryCommands::Stats { user } => {
            let manager = memory.get_or_create(&user, MemoryLayer::Working, config.remote_sync_enabled).await?;
            let stats = manager.stats().await?;
            println!(
                "working(stored={} retrieved={} validated={}) episodic(stored={} retrieved={} validated={}) \
                 semantic(stored={} retrieved={} validated={}) total(stored={} retrieved={} validated={})",
                stats.working.stored, stats.working.retrieved, stats.working.validated_count,
                stats.episodic.stored, stats.episodic.retrieved, stats.episodic.validated_count,
                stats.semantic.stored, stats.semantic.retrieved, stats.semantic.validated_count,
                stats.total_stored, stats.total_retrieved, stats.total_validated
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_their_declared_exit_code() {
        let err = anyhow::Error::new(CoreError::CredentialMissing("SEARCH_API_KEY".to_string()));
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn non_core_errors_default_to_one() {
        let err = anyhow::anyhow!("disk full");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn cli_parses_research_subcommand_with_defaults() {
        let cli = Cli::parse_from(["deepresearch", "research", "rust async runtimes"]);
        match cli.command {
            Commands::Research { topic, depth, breadth } => {
                assert_eq!(topic, "rust async runtimes");
                assert_eq!(depth, 2);
                assert_eq!(breadth, 3);
            }
            _ => panic!("expected Research subcommand"),
        }
    }
}
