use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docent::agent::{Collaborators, FileCheckpointer, HistoryFilter, ServiceConfigurer};
use docent::llm::ChatRole;
use docent::processing::LocalDocumentConverter;
use docent::storage::{ChunkRef, DocumentRecord, DocumentRepository, DocumentSource, FileMetadata, JsonManifest};
use docent::{Agent, Attachment, RunConfig, StreamItem, StreamMode, TurnInput, Uuid};

#[derive(Parser)]
#[command(name = "docent")]
#[command(about = "Conversational document agent", long_about = None)]
struct Cli {
    /// Folder holding agent.json (defaults to $AGENT_CONFIG_PATH)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Folder for the document manifest and conversation checkpoints
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat on a thread; reads messages from stdin when none is given
    Chat {
        #[arg(long)]
        thread: Option<String>,
        /// Single message to send
        #[arg(short, long)]
        message: Option<String>,
        /// File attached to the turn
        #[arg(long)]
        attach: Option<PathBuf>,
    },
    /// Show the checkpoints of a thread, newest first
    History {
        thread: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete every checkpoint of a thread
    DeleteThread { thread: String },
    /// Rebuild the lexical index
    Sync,
    /// Reconfigure and rebuild the agent
    Restart,
    /// Print the agent status
    Status,
    /// Embed a file into a vector store and record it in the manifest
    Embed {
        #[arg(long)]
        store: String,
        path: PathBuf,
        #[arg(long)]
        mime_type: Option<String>,
    },
    /// Remove a recorded document's chunks from a vector store
    Unembed {
        #[arg(long)]
        store: String,
        document: Uuid,
    },
}

fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "md" => "text/markdown",
        _ => "text/plain",
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("docent"))
        .unwrap_or_else(|| PathBuf::from(".docent"))
}

struct App {
    agent: Agent,
    manifest: Arc<JsonManifest>,
}

impl App {
    fn open(cli: &Cli) -> Result<Self> {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

        let manifest = Arc::new(JsonManifest::open(data_dir.join("manifest.json"))?);
        let collaborators = Collaborators {
            documents: manifest.clone(),
            files: manifest.clone(),
            converter: Arc::new(LocalDocumentConverter::new()),
            checkpointer: Some(Arc::new(FileCheckpointer::new(data_dir.join("threads"))?)),
        };
        let configurer = match cli.config_dir {
            Some(ref dir) => ServiceConfigurer::new(dir, collaborators),
            None => ServiceConfigurer::from_env(collaborators)?,
        };
        Ok(Self {
            agent: Agent::new(Arc::new(configurer)),
            manifest,
        })
    }

    async fn start(&self) -> Result<()> {
        self.agent.configure(false).await?;
        self.agent.build_graph()?;
        Ok(())
    }
}

async fn run_turn(agent: &Agent, input: TurnInput, thread: &str) -> Result<()> {
    let mut rx = agent.stream(input, RunConfig::new(thread), StreamMode::Updates)?;
    while let Some(item) = rx.recv().await {
        let StreamItem::Updates { node, messages } = item? else {
            continue;
        };
        for message in messages {
            match message.role {
                ChatRole::Assistant if !message.pending_tool_calls().is_empty() => {
                    for call in message.pending_tool_calls() {
                        eprintln!("[{}] calling {} {}", node, call.name, call.arguments);
                    }
                }
                ChatRole::Assistant => println!("{}", message.text()),
                ChatRole::Tool => eprintln!("[{}] {} returned {} chars", node, message.name.as_deref().unwrap_or("tool"), message.text().len()),
                _ => {}
            }
        }
    }
    Ok(())
}

async fn chat(app: &App, thread: Option<String>, message: Option<String>, attach: Option<PathBuf>) -> Result<()> {
    let thread = thread.unwrap_or_else(|| Uuid::new_v4().to_string());
    eprintln!("thread: {}", thread);

    let attachment = attach.map(|path| Attachment {
        id: Uuid::new_v4().to_string(),
        name: file_name(&path),
        mime_type: guess_mime_type(&path).to_string(),
        url: path.display().to_string(),
    });

    if let Some(message) = message {
        let mut input = TurnInput::user(message);
        input.attachment = attachment;
        return run_turn(&app.agent, input, &thread).await;
    }

    let mut pending_attachment = attachment;
    let stdin = std::io::stdin();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let mut input = TurnInput::user(line.trim_end());
        input.attachment = pending_attachment.take();
        if let Err(e) = run_turn(&app.agent, input, &thread).await {
            eprintln!("error: {:#}", e);
        }
    }
    Ok(())
}

async fn embed(app: &App, store: String, path: PathBuf, mime_type: Option<String>) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("File not found: {}", path.display()))?;
    let file = FileMetadata {
        id: Uuid::new_v4(),
        name: file_name(&path),
        mime_type: mime_type.unwrap_or_else(|| guess_mime_type(&path).to_string()),
        path,
    };

    let ids = app.agent.embed_document(&store, &file).await?;
    app.manifest.add_file(file.clone())?;
    let record = DocumentRecord {
        id: Uuid::new_v4(),
        name: file.name.clone(),
        source: DocumentSource::Uploaded,
        mime_type: Some(file.mime_type.clone()),
        file_id: Some(file.id),
        embedded_to_vs: Some(store.clone()),
        chunks: ids.iter().map(|id| ChunkRef { id: id.clone() }).collect(),
        embedded_to_bm25: false,
    };
    let document_id = record.id;
    app.manifest.save_all(vec![record]).await?;
    println!("document {} embedded into {} as {} chunks", document_id, store, ids.len());
    Ok(())
}

async fn unembed(app: &App, store: String, document: Uuid) -> Result<()> {
    let mut record = app
        .manifest
        .get_by_id(document)
        .await?
        .ok_or_else(|| anyhow!("Unknown document {}", document))?;
    let ids = record.chunk_ids();
    app.agent.unembed_document(&store, &ids).await?;

    record.chunks.clear();
    record.embedded_to_vs = None;
    record.embedded_to_bm25 = false;
    app.manifest.save_all(vec![record]).await?;
    println!("removed {} chunks of {} from {}", ids.len(), document, store);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docent=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = App::open(&cli)?;

    match cli.command {
        Commands::Chat { thread, message, attach } => {
            app.start().await?;
            chat(&app, thread, message, attach).await?;
        }
        Commands::History { thread, limit } => {
            app.start().await?;
            let filter = HistoryFilter {
                limit: Some(limit),
                ..Default::default()
            };
            for snapshot in app.agent.get_state_history(&RunConfig::new(&thread), &filter).await? {
                println!(
                    "{} step={} next={:?} messages={} at {}",
                    snapshot.checkpoint_id,
                    snapshot.metadata.step,
                    snapshot.next,
                    snapshot.values.messages.len(),
                    snapshot.created_at.to_rfc3339()
                );
            }
        }
        Commands::DeleteThread { thread } => {
            app.agent.delete_thread(&thread).await?;
            println!("thread {} deleted", thread);
        }
        Commands::Sync => {
            app.start().await?;
            app.agent.sync_bm25().await?;
            println!("{}", serde_json::to_string_pretty(&app.agent.status())?);
        }
        Commands::Restart => {
            app.start().await?;
            app.agent
                .restart(|progress| eprintln!("{:?} {:.0}%", progress.status, progress.percentage * 100.0))
                .await?;
        }
        Commands::Status => {
            app.start().await?;
            println!("{}", serde_json::to_string_pretty(&app.agent.status())?);
        }
        Commands::Embed { store, path, mime_type } => {
            app.start().await?;
            embed(&app, store, path, mime_type).await?;
        }
        Commands::Unembed { store, document } => {
            app.start().await?;
            unembed(&app, store, document).await?;
        }
    }

    app.agent.shutdown().await?;
    Ok(())
}
