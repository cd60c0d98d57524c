//! deepsearch CLI entry point.
//!
//! Commands:
//! - `init`:    write the default config file
//! - `serve`:   start the HTTP gateway
//! - `ask`:     run one turn and stream it to the terminal
//! - `history`: list a user's conversations
//! - `show`:    print one conversation

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "deepsearch",
    about = "deepsearch: web research assistant with streaming turns",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs (and `ask` events) as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Init,

    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ask a question and stream the answer
    Ask {
        /// The message to send
        message: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// Act as this user
        #[arg(short, long, default_value = deepsearch_gateway::LOCAL_USER)]
        user: String,
    },

    /// List conversations, most recently updated first
    History {
        #[arg(short, long, default_value = deepsearch_gateway::LOCAL_USER)]
        user: String,
    },

    /// Print a conversation's messages
    Show {
        /// Conversation id
        id: String,

        #[arg(short, long, default_value = deepsearch_gateway::LOCAL_USER)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so `ask` output stays clean on stdout.
    let filter = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        (Commands::Serve { .. }, false) => "info",
        _ => "warn",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match cli.command {
        Commands::Init => commands::init::run().await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Ask {
            message,
            conversation,
            user,
        } => commands::ask::run(message, conversation, user, cli.json).await?,
        Commands::History { user } => commands::history::list(user, cli.json).await?,
        Commands::Show { id, user } => commands::history::show(id, user, cli.json).await?,
    }

    Ok(())
}
