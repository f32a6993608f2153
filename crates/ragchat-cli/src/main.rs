use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Input;

use ragchat_client::BackendClient;
use ragchat_conversation::Conversation;
use ragchat_core::config::Config;
use ragchat_core::types::{ChatOptions, ChunkingStrategy, ConversationState, DocumentSet};

mod logging;
mod render;

#[derive(Parser)]
#[command(
    name = "ragchat",
    about = "Chat with your documents through a retrieval-augmented backend",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Backend base URL (overrides config and RAGCHAT_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Document set to retrieve from
    #[arg(long, global = true, value_enum)]
    document_set: Option<DocumentSetArg>,

    /// Chunking strategy
    #[arg(long, global = true, value_enum)]
    strategy: Option<StrategyArg>,

    /// Rerank retrieved chunks
    #[arg(long, global = true)]
    rerank: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat session
    Chat,

    /// Ask a single question and print the answer
    Ask {
        /// Question to send
        #[arg(short, long)]
        message: String,
    },

    /// Check backend health
    Health,

    /// Document management
    Documents {
        #[command(subcommand)]
        action: DocumentAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DocumentAction {
    /// List indexed documents
    List,
    /// Print a document with line numbers
    Show { id: String },
    /// Upload a .txt or .md file
    Upload { path: PathBuf },
    /// Delete an uploaded document
    Delete { id: String },
    /// Rebuild the vector index
    Rebuild,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum DocumentSetArg {
    Original,
    Optimized,
}

impl From<DocumentSetArg> for DocumentSet {
    fn from(arg: DocumentSetArg) -> Self {
        match arg {
            DocumentSetArg::Original => DocumentSet::Original,
            DocumentSetArg::Optimized => DocumentSet::Optimized,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Standard,
    Large,
    #[value(name = "parent_child", alias = "parent-child")]
    ParentChild,
}

impl From<StrategyArg> for ChunkingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Standard => ChunkingStrategy::Standard,
            StrategyArg::Large => ChunkingStrategy::Large,
            StrategyArg::ParentChild => ChunkingStrategy::ParentChild,
        }
    }
}

impl Cli {
    /// Config defaults with command-line flags layered on top.
    fn chat_options(&self, config: &Config) -> ChatOptions {
        let mut options = config.chat_options();
        if let Some(set) = self.document_set {
            options.document_set = Some(set.into());
        }
        if let Some(strategy) = self.strategy {
            options.strategy = Some(strategy.into());
        }
        if self.rerank {
            options.use_reranking = Some(true);
        }
        options
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    logging::init(config.logging.as_ref(), cli.verbose);
    config.validate()?;

    let mut client = BackendClient::from_config(&config)?;
    if let Some(url) = &cli.api_url {
        client.base_url = url.trim_end_matches('/').to_string();
    }
    tracing::debug!(base_url = %client.base_url, config = %config_path.display(), "Starting");

    let options = cli.chat_options(&config);

    match cli.command {
        Commands::Chat => run_chat(client, options).await?,
        Commands::Ask { message } => {
            let conv = Conversation::new(Arc::new(client));
            stream_turn(&conv, &message, options).await?;
            if let Some(error) = conv.snapshot().error {
                anyhow::bail!(error);
            }
        }
        Commands::Health => {
            let health = client.health().await?;
            println!("Backend: {}", client.base_url);
            println!("Status: {}", health.status);
            println!("Model loaded: {}", health.model_loaded);
            println!("Vector store ready: {}", health.vectorstore_ready);
            println!("Documents: {}", health.document_count);
        }
        Commands::Documents { action } => run_documents(&client, &config, action).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
                println!("Config: {}", config_path.display());
                println!("Effective base URL: {}", client.base_url);
            }
        },
    }

    Ok(())
}

async fn run_chat(client: BackendClient, options: ChatOptions) -> anyhow::Result<()> {
    let conv = Conversation::new(Arc::new(client));
    println!("Type a question. /clear resets the conversation, /quit exits.");

    loop {
        let line = tokio::task::spawn_blocking(|| {
            Input::<String>::new()
                .with_prompt("you")
                .allow_empty(true)
                .interact_text()
        })
        .await??;

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                conv.clear_messages();
                println!("Conversation cleared.");
            }
            question => {
                stream_turn(&conv, question, options).await?;
                if let Some(error) = conv.snapshot().error {
                    eprintln!("error: {error}");
                    conv.clear_error();
                }
            }
        }
    }

    Ok(())
}

/// Run one turn, printing the answer as it streams. Ctrl-C abandons the turn.
async fn stream_turn(conv: &Conversation, question: &str, options: ChatOptions) -> anyhow::Result<()> {
    let mut rx = conv.subscribe();
    let mut turn = Box::pin(conv.send_message(question, options));

    let mut stdout = std::io::stdout();
    let mut shown = String::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut turn => break,
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = rx.borrow_and_update().clone();
                print_progress(&mut stdout, &state, &mut shown)?;
            }
        }
    }

    // Dropping an unfinished turn finalizes its answer.
    drop(turn);
    let state = conv.snapshot();
    print_progress(&mut stdout, &state, &mut shown)?;
    writeln!(stdout)?;
    if interrupted {
        println!("(interrupted)");
    }
    if let Some(answer) = render::current_answer(&state) {
        print!("{}", render::footer(answer));
    }
    stdout.flush()?;
    Ok(())
}

fn print_progress(
    out: &mut impl std::io::Write,
    state: &ConversationState,
    shown: &mut String,
) -> std::io::Result<()> {
    let Some(answer) = render::current_answer(state) else {
        return Ok(());
    };
    match render::delta(shown, &answer.content) {
        render::Delta::Append(tail) => write!(out, "{tail}")?,
        render::Delta::Replace(text) => write!(out, "\n{text}")?,
    }
    out.flush()?;
    shown.clone_from(&answer.content);
    Ok(())
}

async fn run_documents(
    client: &BackendClient,
    config: &Config,
    action: DocumentAction,
) -> anyhow::Result<()> {
    match action {
        DocumentAction::List => {
            let list = client.list_documents().await?;
            for doc in &list.documents {
                println!("{}", render::document_row(doc));
            }
            println!("{} document(s)", list.total);
        }
        DocumentAction::Show { id } => {
            let doc = client.document_content(&id).await?;
            println!("{} ({} lines)", doc.filename, doc.line_count);
            print!("{}", render::numbered(&doc.content));
        }
        DocumentAction::Upload { path } => {
            let filename = file_name(&path)?;
            let bytes = tokio::fs::read(&path).await?;
            config.upload().validate(&filename, bytes.len() as u64)?;
            let result = client.upload_document(&filename, bytes).await?;
            println!("{} uploaded as {} ({})", result.filename, result.id, result.status);
            if !result.message.is_empty() {
                println!("{}", result.message);
            }
        }
        DocumentAction::Delete { id } => {
            client.delete_document(&id).await?;
            println!("Deleted {id}");
        }
        DocumentAction::Rebuild => {
            let result = client.rebuild_index().await?;
            println!("{}: {} chunks", result.status, result.chunk_count);
            if !result.message.is_empty() {
                println!("{}", result.message);
            }
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("not a file path: {}", path.display()))
}
