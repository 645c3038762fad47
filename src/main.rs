//! CLI entry point for `llmsh`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::Colorize;
use dotenvy::dotenv;

use llmsh::config::{self, Config};
use llmsh::engine::{LlamaServerEngine, LlamaServerSettings};
use llmsh::{Agent, AgentSettings, logging, prompts};

#[cfg(windows)]
const INPUT_HELP: &str = "End each message with Ctrl+Z, then Enter. \
                          Ctrl+Z on an empty prompt quits.";
// Ctrl+Z suspends the process on a Unix terminal, so messages end at EOF.
#[cfg(not(windows))]
const INPUT_HELP: &str = "End each message with Enter, then Ctrl+D. \
                          Ctrl+D on an empty prompt quits.";

#[derive(Parser, Debug)]
#[command(
    name = "llmsh",
    version,
    about = "Chat with a local LLM that can run shell commands after you approve them",
    long_about = format!(
        "Chat with a model served by a local llama.cpp-compatible server.\n\n\
         {INPUT_HELP}\n\
         When a reply contains an ```exec block you are asked before anything runs."
    )
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config profile name
    #[arg(long)]
    profile: Option<String>,

    /// Completion server base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Chat template (llama3, chatml, gemma)
    #[arg(long)]
    template: Option<String>,

    /// System prompt file
    #[arg(long)]
    system_prompt: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Check configuration and server connectivity
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let result = match cli.command.clone() {
        Some(Commands::Doctor) => run_doctor(&cli).await,
        Some(Commands::Completions { shell }) => {
            generate_completions(shell);
            Ok(())
        }
        None => run_session(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn load_config_from_cli(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.clone(), cli.profile.as_deref())?;
    if let Some(base_url) = &cli.base_url {
        config.base_url = Some(base_url.clone());
    }
    if let Some(template) = &cli.template {
        config.template = Some(template.clone());
    }
    if let Some(path) = &cli.system_prompt {
        config.system_prompt_path = Some(path.display().to_string());
    }
    config.validate()?;
    Ok(config)
}

async fn run_session(cli: &Cli) -> Result<()> {
    let config = load_config_from_cli(cli)?;
    let system_prompt = prompts::load_system_prompt(&config)?;
    if logging::is_verbose() {
        logging::info(format!(
            "system prompt: {} ({})",
            system_prompt.source,
            llmsh::utils::format_bytes(system_prompt.text.len())
        ));
    }

    let engine = LlamaServerEngine::new(LlamaServerSettings::from_config(&config))
        .context("Failed to create completion client")?;
    let stdin = io::stdin();
    let mut agent = Agent::new(
        engine,
        AgentSettings::from_config(&config),
        stdin.lock(),
        io::stdout(),
    );

    agent.start(&system_prompt.text).await.map_err(|err| {
        anyhow::anyhow!("{err} [{}]", err.category().as_str())
    })?;
    let summary = agent
        .run()
        .await
        .map_err(|err| anyhow::anyhow!("{err} [{}]", err.category().as_str()))?;

    logging::info(format!(
        "session ended after {} turn(s): {} run, {} declined, {} shared",
        summary.turns, summary.commands_run, summary.commands_declined, summary.results_shared
    ));
    Ok(())
}

/// Generate shell completions for the given shell
fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

/// Report configuration and server health.
async fn run_doctor(cli: &Cli) -> Result<()> {
    println!("{}", "llmsh doctor".bold());
    println!("{}", "============".dimmed());
    println!();

    println!("{}", "Version:".bold());
    println!("  llmsh: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("{}", "Configuration:".bold());
    let config_path = cli.config.clone().or_else(config::default_config_path);
    match config_path.as_deref() {
        Some(path) if path.exists() => match config::load_single_config_file(path) {
            Ok(_) => println!("  {} {} parsed", "✓".green(), path.display()),
            Err(err) => println!("  {} {}: {err:#}", "✗".red(), path.display()),
        },
        Some(path) => println!(
            "  {} {} not found (defaults apply)",
            "!".yellow(),
            path.display()
        ),
        None => println!("  {} no config location (defaults apply)", "!".yellow()),
    }

    let config = match load_config_from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            println!("  {} effective config invalid: {err:#}", "✗".red());
            return Ok(());
        }
    };
    println!("  {} base_url: {}", "·".dimmed(), config.base_url());
    println!("  {} template: {}", "·".dimmed(), config.template());
    println!(
        "  {} context window: {} tokens",
        "·".dimmed(),
        config.context_window()
    );
    match prompts::load_system_prompt(&config) {
        Ok(prompt) => println!("  {} system prompt: {}", "✓".green(), prompt.source),
        Err(err) => println!("  {} system prompt: {err:#}", "✗".red()),
    }
    println!();

    println!("{}", "Server:".bold());
    print!("  {} Checking {}/health...", "·".dimmed(), config.base_url());
    io::stdout().flush().ok();
    let engine = LlamaServerEngine::new(LlamaServerSettings::from_config(&config))?;
    match engine.health().await {
        Ok(body) => println!("\r  {} Server healthy: {}", "✓".green(), body.trim()),
        Err(err) => {
            println!("\r  {} Server check failed", "✗".red());
            println!("    {err}");
            println!("    Start one with e.g. `llama-server -m model.gguf --port 8080`");
        }
    }

    Ok(())
}
