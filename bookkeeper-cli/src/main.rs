use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;

use bookkeeper_core::deployment::UntypedDeployment;
use bookkeeper_core::update::{OpType, ResourceChanges, UpdateInfo, UpdateResult};
use bookkeeper_state::{FileStateBackend, StackSummary};

/// Holds the store URL when `--url` is not given
const BACKEND_URL_ENV: &str = "BOOKKEEPER_BACKEND_URL";
const DEFAULT_BACKEND_URL: &str = "file://~";

#[derive(Parser)]
#[command(name = "bookkeeper")]
#[command(about = "Self-managed stack state kept in a local directory or bucket", long_about = None)]
struct Cli {
    /// State store URL (file://path or s3://bucket/prefix)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stack management commands
    Stack {
        #[command(subcommand)]
        command: StackCommands,
    },
    /// Remove the locks held on a stack, e.g. after a crashed update
    Cancel {
        /// Stack reference
        stack: String,
    },
    /// State store maintenance commands
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Show the state store in use
    Whoami,
}

#[derive(Subcommand)]
enum StackCommands {
    /// List all stacks
    Ls,
    /// Create an empty stack
    Init {
        /// Stack reference
        stack: String,
    },
    /// Remove a stack, keeping a backup of its state
    Rm {
        /// Stack reference
        stack: String,

        /// Remove the stack even if it still has resources
        #[arg(long, short)]
        force: bool,
    },
    /// Rename a stack
    Rename {
        /// Stack reference
        stack: String,
        /// New stack name or reference
        new_name: String,
    },
    /// Write the latest deployment of a stack as JSON
    Export {
        /// Stack reference
        stack: String,

        /// Write to this file instead of stdout
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Replace the state of a stack with an exported deployment
    Import {
        /// Stack reference
        stack: String,

        /// Exported deployment
        #[arg(long)]
        file: PathBuf,
    },
    /// Show the update history of a stack
    History {
        /// Stack reference
        stack: String,

        /// Entries per page (0 = all)
        #[arg(long, default_value_t = 10)]
        page_size: usize,

        /// Page to show, starting at 1
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Show the configuration used by the latest update
    Config {
        /// Stack reference
        stack: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Move legacy stacks into the per-project layout
    Upgrade,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let url = backend_url(cli.url);
    let result = match FileStateBackend::login(&url).await {
        Ok(backend) => match cli.command {
            Commands::Stack { command } => run_stack_command(&backend, command).await,
            Commands::Cancel { stack } => run_cancel(&backend, &stack).await,
            Commands::State { command } => run_state_command(&backend, command).await,
            Commands::Whoami => {
                run_whoami(&backend);
                Ok(())
            }
        },
        Err(e) => Err(format!("Failed to open {}: {}", url, e)),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn backend_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var(BACKEND_URL_ENV).ok())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string())
}

async fn run_stack_command(backend: &FileStateBackend, command: StackCommands) -> Result<(), String> {
    match command {
        StackCommands::Ls => run_stack_ls(backend).await,
        StackCommands::Init { stack } => run_stack_init(backend, &stack).await,
        StackCommands::Rm { stack, force } => run_stack_rm(backend, &stack, force).await,
        StackCommands::Rename { stack, new_name } => {
            run_stack_rename(backend, &stack, &new_name).await
        }
        StackCommands::Export { stack, file } => run_stack_export(backend, &stack, file).await,
        StackCommands::Import { stack, file } => run_stack_import(backend, &stack, &file).await,
        StackCommands::History {
            stack,
            page_size,
            page,
        } => run_stack_history(backend, &stack, page_size, page).await,
        StackCommands::Config { stack } => run_stack_config(backend, &stack).await,
    }
}

async fn run_stack_ls(backend: &FileStateBackend) -> Result<(), String> {
    let stacks = backend
        .list_stacks()
        .await
        .map_err(|e| format!("Failed to list stacks: {}", e))?;

    if stacks.is_empty() {
        println!("No stacks found in {}", backend.url());
        return Ok(());
    }

    for line in format_stack_table(&stacks) {
        println!("{}", line);
    }
    Ok(())
}

async fn run_stack_init(backend: &FileStateBackend, stack: &str) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    backend
        .create_stack(&reference)
        .await
        .map_err(|e| format!("Failed to create stack: {}", e))?;
    println!("{} {}", "Created stack".green().bold(), reference);
    Ok(())
}

async fn run_stack_rm(backend: &FileStateBackend, stack: &str, force: bool) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    backend
        .remove_stack(&reference, force)
        .await
        .map_err(|e| format!("Failed to remove stack: {}", e))?;
    println!("{} {}", "Removed stack".green().bold(), reference);
    Ok(())
}

async fn run_stack_rename(
    backend: &FileStateBackend,
    stack: &str,
    new_name: &str,
) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    let renamed = backend
        .rename_stack(&reference, new_name)
        .await
        .map_err(|e| format!("Failed to rename stack: {}", e))?;
    println!("Renamed {} to {}", reference, renamed.to_string().bold());
    Ok(())
}

async fn run_stack_export(
    backend: &FileStateBackend,
    stack: &str,
    file: Option<PathBuf>,
) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    let deployment = backend
        .export_deployment(&reference)
        .await
        .map_err(|e| format!("Failed to export stack: {}", e))?;
    let json = serde_json::to_string_pretty(&deployment)
        .map_err(|e| format!("Failed to serialize deployment: {}", e))?;

    match file {
        Some(path) => {
            fs::write(&path, json + "\n")
                .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
            println!("Exported {} to {}", reference, path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn run_stack_import(
    backend: &FileStateBackend,
    stack: &str,
    file: &PathBuf,
) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    let content = fs::read_to_string(file)
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let deployment: UntypedDeployment = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse {}: {}", file.display(), e))?;

    backend
        .import_deployment(&reference, &deployment)
        .await
        .map_err(|e| format!("Failed to import stack: {}", e))?;
    println!("{} {}", "Imported".green().bold(), reference);
    Ok(())
}

async fn run_stack_history(
    backend: &FileStateBackend,
    stack: &str,
    page_size: usize,
    page: usize,
) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    let history = backend
        .get_history(&reference, page_size, page)
        .await
        .map_err(|e| format!("Failed to read history: {}", e))?;

    if history.is_empty() {
        println!("Stack {} has never been updated", reference);
        return Ok(());
    }

    for update in &history {
        print_update(update);
    }
    Ok(())
}

async fn run_stack_config(backend: &FileStateBackend, stack: &str) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    let config = backend
        .get_latest_configuration(&reference)
        .await
        .map_err(|e| format!("Failed to read configuration: {}", e))?;

    for (key, value) in &config {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        println!("{} = {}", key.bold(), value);
    }
    Ok(())
}

async fn run_cancel(backend: &FileStateBackend, stack: &str) -> Result<(), String> {
    let reference = backend.parse_stack_reference(stack).map_err(|e| e.to_string())?;
    backend
        .cancel_current_update(&reference)
        .await
        .map_err(|e| format!("Failed to cancel: {}", e))?;
    println!("Removed all locks on {}", reference);
    Ok(())
}

async fn run_state_command(backend: &FileStateBackend, command: StateCommands) -> Result<(), String> {
    match command {
        StateCommands::Upgrade => {
            backend
                .upgrade()
                .await
                .map_err(|e| format!("Upgrade failed: {}", e))?;
            println!("{}", "State store upgraded".green().bold());
            Ok(())
        }
    }
}

fn run_whoami(backend: &FileStateBackend) {
    println!("{}: {}", "Backend".bold(), backend.name());
    println!("{}: {}", "URL".bold(), backend.url());
    println!("{}: {}", "Layout".bold(), backend.layout_mode().as_str());
}

fn format_stack_table(stacks: &[StackSummary]) -> Vec<String> {
    let rows: Vec<(String, String, String)> = stacks
        .iter()
        .map(|stack| {
            (
                stack.reference.to_string(),
                stack
                    .last_update
                    .map(format_time)
                    .unwrap_or_else(|| "n/a".to_string()),
                stack
                    .resource_count
                    .map(|count| count.to_string())
                    .unwrap_or_else(|| "n/a".to_string()),
            )
        })
        .collect();

    let name_width = rows.iter().map(|r| r.0.len()).max().unwrap_or(0).max(4);
    let time_width = rows.iter().map(|r| r.1.len()).max().unwrap_or(0).max(11);

    let mut lines = vec![format!(
        "{:<name_width$}  {:<time_width$}  {}",
        "NAME", "LAST UPDATE", "RESOURCE COUNT"
    )];
    for (name, time, count) in rows {
        lines.push(format!("{:<name_width$}  {:<time_width$}  {}", name, time, count));
    }
    lines
}

fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn print_update(update: &UpdateInfo) {
    let result = match update.result {
        UpdateResult::Succeeded => "succeeded".green(),
        UpdateResult::Failed => "failed".red(),
        UpdateResult::InProgress => "in progress".yellow(),
    };
    let started = DateTime::<Utc>::from_timestamp(update.start_time, 0)
        .map(format_time)
        .unwrap_or_else(|| update.start_time.to_string());

    println!("{} {} ({})", update.kind.to_string().bold(), result, started);
    if !update.message.is_empty() {
        println!("    {}", update.message);
    }
    let changes = format_changes(&update.resource_changes);
    if !changes.is_empty() {
        println!("    {}", changes);
    }
}

/// Compact `+N ~N -N` summary of resource changes
fn format_changes(changes: &ResourceChanges) -> String {
    let mut parts = Vec::new();
    for (op, count) in changes {
        if *count == 0 {
            continue;
        }
        let part = match op {
            OpType::Create | OpType::Import => format!("+{}", count).green().to_string(),
            OpType::Update => format!("~{}", count).yellow().to_string(),
            OpType::Delete => format!("-{}", count).red().to_string(),
            OpType::Replace | OpType::CreateReplacement | OpType::DeleteReplaced => {
                format!("+-{}", count).magenta().to_string()
            }
            OpType::Same | OpType::Read | OpType::Refresh => continue,
        };
        parts.push(part);
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_url_prefers_flag() {
        assert_eq!(
            backend_url(Some("file:///tmp/state".to_string())),
            "file:///tmp/state"
        );
    }

    #[test]
    fn test_format_changes_skips_unchanged() {
        colored::control::set_override(false);
        let mut changes = ResourceChanges::new();
        changes.insert(OpType::Create, 2);
        changes.insert(OpType::Same, 5);
        changes.insert(OpType::Delete, 1);
        changes.insert(OpType::Update, 0);
        assert_eq!(format_changes(&changes), "+2 -1");
        assert_eq!(format_changes(&ResourceChanges::new()), "");
    }

    #[test]
    fn test_cli_parses_stack_commands() {
        let cli = Cli::parse_from(["bookkeeper", "--url", "file:///tmp", "stack", "rm", "dev", "--force"]);
        assert_eq!(cli.url.as_deref(), Some("file:///tmp"));
        match cli.command {
            Commands::Stack {
                command: StackCommands::Rm { stack, force },
            } => {
                assert_eq!(stack, "dev");
                assert!(force);
            }
            _ => panic!("Expected stack rm"),
        }
    }
}
