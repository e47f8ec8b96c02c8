//! Terminal chat front-end for the quill engine.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use quill::{
    OllamaProvider, Orchestrator, Role, SessionEvent, Settings, ToolCatalog, ToolRegistry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quill", about = "Chat with your documents through local tools")]
struct Cli {
    /// Path to a settings file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the model id from the settings file.
    #[arg(long)]
    model: Option<String>,

    /// Override the Ollama host from the settings file.
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        settings.model = model;
    }
    if let Some(host) = cli.host {
        settings.ollama_host = host;
    }
    info!(model = %settings.model, host = %settings.ollama_host, "starting");

    let provider = Arc::new(OllamaProvider::new(&settings.model_config())?);
    let registry = Arc::new(ToolRegistry::new(
        settings.server_config_path.clone(),
        settings.coordination_port,
    ));
    registry.start();

    let catalog: Arc<dyn ToolCatalog> = registry.clone();
    let orchestrator = Orchestrator::new(provider, catalog, settings);

    println!("quill - :new starts a fresh chat, :status shows tool state, :quit exits");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();

        match line.as_str() {
            "" => continue,
            ":quit" | ":q" => break,
            ":status" => {
                println!("{}", registry.status().status);
                continue;
            }
            ":new" => {
                orchestrator.new_chat().await;
                println!("started a new chat");
                continue;
            }
            _ => {}
        }

        if !orchestrator.can_send(&line) {
            println!("not ready: {}", registry.status().status);
            continue;
        }

        run_turn(&orchestrator, line).await?;
    }

    Ok(())
}

/// Drive one turn, printing assistant content as it grows. Ctrl-C cancels
/// the turn instead of exiting.
async fn run_turn(orchestrator: &Orchestrator, prompt: String) -> Result<()> {
    let mut printed = 0usize;
    let mut turn = orchestrator.send_turn(prompt);
    loop {
        let event = tokio::select! {
            event = turn.next() => event,
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            SessionEvent::MessageUpdated => {
                let conversation = orchestrator.conversation();
                let conversation = conversation.lock();
                let Some(message) = conversation.messages().last() else {
                    continue;
                };
                match message.role {
                    Role::Assistant => {
                        if message.content.len() > printed {
                            print!("{}", &message.content[printed..]);
                            std::io::stdout().flush()?;
                            printed = message.content.len();
                        }
                    }
                    Role::Error => println!("! {}", message.content),
                    Role::User => {}
                }
            }
            SessionEvent::ToolCall { name, .. } => {
                println!("\n[running {name}]");
                reset_printed_to_current(orchestrator, &mut printed);
            }
            SessionEvent::ToolResult { .. } => {}
            SessionEvent::Completed => {
                println!();
            }
        }
    }
    Ok(())
}

fn reset_printed_to_current(orchestrator: &Orchestrator, printed: &mut usize) {
    let conversation = orchestrator.conversation();
    let conversation = conversation.lock();
    if let Some(message) = conversation.messages().last() {
        *printed = message.content.len();
    }
}
