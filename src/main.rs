use clap::{Args, CommandFactory, Parser, Subcommand};
use echo_avatar::commands::{execute_command, EchoCommand};
use echo_avatar::config::{Config, ConfigProvider, LiveConfig, StaticConfig};
use echo_avatar::runtime::{self, AppState};
use echo_avatar::{host::CommandReply, logging};
use std::sync::Arc;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_OPERATOR_ID: &str = "operator";

#[derive(Debug, Parser)]
#[command(
    name = "echo-avatar",
    version = VERSION,
    about = "Record chat messages from chosen users and turn them into persona prompts"
)]
struct Cli {
    /// Caller id for one-shot commands
    #[arg(long = "as", global = true)]
    caller: Option<String>,
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Args)]
struct UserArg {
    user_id: String,
}

#[derive(Debug, Args)]
struct UserTextArgs {
    user_id: String,
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Read JSON-lines events from stdin and reply on stdout
    Listen,
    /// Show the monitored users
    Status,
    /// Count recorded messages for a user
    Count(UserArg),
    /// Delete everything stored for a user
    Clear(UserArg),
    /// Set a profile field (only `nickname`)
    UpdateProfile {
        user_id: String,
        key: String,
        #[arg(required = true, num_args = 1..)]
        value: Vec<String>,
    },
    /// Add an administrator annotation
    AddAnnotation(UserTextArgs),
    /// Add a memory note
    AddMemory(UserTextArgs),
    /// Render the HTML preview of a user's data
    Preview(UserArg),
    /// Sample the history and ask the LLM for a draft persona
    GenerateSample(UserArg),
    /// Build the full persona prompt and submit it to the LLM
    Generate(UserArg),
    /// Print the last lines of the log files
    Logs {
        #[arg(short = 'n', long, default_value_t = 200)]
        lines: usize,
    },
    /// Show version
    Version,
}

fn print_version() {
    println!("echo-avatar {VERSION}");
}

fn one_shot_command(command: MainCommand) -> Option<EchoCommand> {
    Some(match command {
        MainCommand::Status => EchoCommand::Status,
        MainCommand::Count(a) => EchoCommand::Count { user_id: a.user_id },
        MainCommand::Clear(a) => EchoCommand::Clear { user_id: a.user_id },
        MainCommand::UpdateProfile {
            user_id,
            key,
            value,
        } => EchoCommand::UpdateProfile {
            user_id,
            key,
            value: value.join(" "),
        },
        MainCommand::AddAnnotation(a) => EchoCommand::AddAnnotation {
            user_id: a.user_id,
            text: a.text.join(" "),
        },
        MainCommand::AddMemory(a) => EchoCommand::AddMemory {
            user_id: a.user_id,
            text: a.text.join(" "),
        },
        MainCommand::Preview(a) => EchoCommand::Preview { user_id: a.user_id },
        MainCommand::GenerateSample(a) => EchoCommand::GenerateSample { user_id: a.user_id },
        MainCommand::Generate(a) => EchoCommand::Generate { user_id: a.user_id },
        MainCommand::Listen | MainCommand::Logs { .. } | MainCommand::Version => return None,
    })
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    if config.log_to_file {
        logging::init_file_logging(&config.logs_dir(), config.log_retention_days)?;
    } else {
        logging::init_console_logging();
    }
    Ok(())
}

fn config_provider(config: &Config) -> anyhow::Result<Arc<dyn ConfigProvider>> {
    Ok(match Config::resolve_config_path()? {
        Some(path) => Arc::new(LiveConfig::new(path, config.clone())),
        None => Arc::new(StaticConfig::new(config.target_users.clone())),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Some(MainCommand::Version) => {
            print_version();
            return Ok(());
        }
        Some(command) => command,
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
            return Ok(());
        }
    };

    let config = Config::load()?;

    if let MainCommand::Logs { lines } = command {
        for line in logging::read_last_lines_from_logs(&config.logs_dir(), lines)? {
            println!("{line}");
        }
        return Ok(());
    }

    init_logging(&config)?;
    let provider = config_provider(&config)?;

    match one_shot_command(command) {
        None => {
            info!("Starting echo-avatar listener...");
            let state = AppState::from_config(config, provider, None)?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            runtime::run_listen(&state, stdin, tokio::io::stdout()).await?;
        }
        Some(echo_command) => {
            let caller = cli
                .caller
                .unwrap_or_else(|| DEFAULT_OPERATOR_ID.to_string());
            let state = AppState::from_config(config, provider, Some(caller.clone()))?;
            for reply in execute_command(&state, &caller, echo_command).await {
                print_reply(&state, &caller, reply).await;
            }
        }
    }
    Ok(())
}

async fn print_reply(state: &AppState, caller: &str, reply: CommandReply) {
    for line in runtime::deliver_reply(state, caller, reply).await {
        match line {
            runtime::OutboundLine::Text { text, .. } => println!("{text}"),
            runtime::OutboundLine::Image { path, .. } => println!("Preview written to {path}"),
            runtime::OutboundLine::Error { error, .. } => eprintln!("{error}"),
        }
    }
}
