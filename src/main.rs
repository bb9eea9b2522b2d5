//! `hush` node binary.

use std::error::Error;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use hush::config::{Config, CONFIG_FILENAME};
use hush::context::Context;
use hush::conversation::KeyState;
use hush::logging;
use hush::runtime::Runtime;

/// Serverless encrypted messaging node.
#[derive(Parser, Debug)]
#[command(name = "hush", version, about)]
struct Cli {
    /// Configuration file [default: hush.toml]
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding `node.data_dir`
    #[arg(long, short = 'd', value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node until stdin closes. Lines on stdin are local commands:
    /// `nodes`, `start <node-id>...`, `send <conversation> <text>`,
    /// `read <conversation>`.
    Run,
    /// Print the local identity.
    Identity,
    /// List known nodes.
    Nodes,
    /// List conversations with their key state and messages.
    Conversations,
    /// Write a default configuration file.
    InitConfig {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(Some(&cli.log));
    if let Err(error) = run(cli) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn Error>> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));
    let mut config = Config::load(&path)?;
    if let Some(dir) = &cli.data_dir {
        config.node.data_dir = dir.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    if let Command::InitConfig { path } = &cli.command {
        Config::default().save(path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let ctx = Arc::new(Context::open(config)?);
    match cli.command {
        Command::Run => run_node(ctx),
        Command::Identity => {
            let node = ctx.identity().node();
            println!("id:          {}", node.id);
            println!("name:        {}", node.name);
            println!("public key:  {}", node.public_key);
            println!("signing key: {}", node.signing_key);
            Ok(())
        }
        Command::Nodes => print_nodes(&ctx),
        Command::Conversations => print_conversations(&ctx),
        Command::InitConfig { .. } => Ok(()),
    }
}

fn run_node(ctx: Arc<Context>) -> Result<(), Box<dyn Error>> {
    let runtime = Runtime::bind(ctx.clone())?;
    let stop = runtime.stop_signal();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if stop.is_stopped() {
            break;
        }
        let line = line?;
        if let Err(err) = handle_command(&ctx, line.trim()) {
            warn!(error = %err, "command failed");
        }
    }

    info!("stdin closed, stopping");
    runtime.stop()?;
    Ok(())
}

fn handle_command(ctx: &Context, line: &str) -> Result<(), Box<dyn Error>> {
    let mut words = line.splitn(3, ' ');
    match (words.next(), words.next(), words.next()) {
        (Some(""), _, _) | (None, _, _) => {}
        (Some("nodes"), _, _) => print_nodes(ctx)?,
        (Some("start"), Some(first), rest) => {
            let mut members = vec![first.to_string()];
            members.extend(rest.unwrap_or_default().split_whitespace().map(String::from));
            let id = ctx.start_conversation(&members)?;
            println!("conversation {id}");
        }
        (Some("send"), Some(conversation), Some(text)) => {
            let message = ctx.send_message(conversation, text)?;
            println!("sent {}", message.id());
        }
        (Some("read"), Some(conversation), _) => {
            for message in ctx.read_conversation(conversation)? {
                println!("[{}] {}: {}", message.time_sent, message.author, message.content);
            }
        }
        (Some(other), _, _) => println!("unknown command: {other}"),
    }
    Ok(())
}

fn print_nodes(ctx: &Context) -> Result<(), Box<dyn Error>> {
    for node in ctx.nodes()? {
        let marker = if node.id == ctx.identity().id() { " (self)" } else { "" };
        println!("{}  {}{marker}", node.id, node.name);
    }
    Ok(())
}

fn print_conversations(ctx: &Context) -> Result<(), Box<dyn Error>> {
    for conversation in ctx.conversations()? {
        let state = match &conversation.key_state {
            KeyState::Pending { parts } => {
                format!("pending {}/{}", parts.len(), conversation.members.len())
            }
            KeyState::Complete { .. } => "complete".to_string(),
        };
        println!("{}  [{state}]", conversation.id);
        for member in &conversation.members {
            println!("  member {member}");
        }
        if conversation.is_complete() {
            for message in ctx.read_conversation(&conversation.id)? {
                println!("  [{}] {}: {}", message.time_sent, message.author, message.content);
            }
        }
    }
    Ok(())
}
