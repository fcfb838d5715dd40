use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use saga_engine::{
    init_telemetry, EngineConfig, InMemoryDefinitionProvider, SagaEngine, ScriptedInvoker, StateMachine,
};

#[derive(Parser)]
#[command(name = "saga-engine")]
#[command(about = "Saga state machine engine with forward recovery and compensation")]
#[command(long_about = "Runs saga state machine definitions: validates them, simulates traversals \
                       against scripted participants and shows the effective engine configuration.")]
struct Cli {
    /// Configuration file to load instead of the default search path
    #[arg(long, global = true, help = "Path to a saga-engine TOML configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a state machine definition for structural errors
    Validate {
        /// Definition file (JSON)
        definition: PathBuf,
    },
    /// Run a definition against scripted participant outcomes
    Simulate {
        #[arg(long, help = "State machine definition file (JSON)")]
        definition: PathBuf,
        #[arg(long, help = "Participant script file: { \"service.method\": [outcome, ...] }")]
        script: Option<PathBuf>,
        #[arg(long, help = "Start variables as a JSON object")]
        input: Option<String>,
        #[arg(long, help = "Business key for the new instance")]
        business_key: Option<String>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    EngineConfig::load_env_file()?;
    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };

    match cli.command {
        Commands::Validate { definition } => validate_command(&definition),
        Commands::Simulate {
            definition,
            script,
            input,
            business_key,
        } => {
            init_telemetry(&config.observability)?;
            tokio::runtime::Runtime::new()?.block_on(async {
                simulate_command(config, &definition, script.as_deref(), input.as_deref(), business_key).await
            })
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn read_definition(path: &Path) -> Result<StateMachine> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read definition {}", path.display()))?;
    let machine = StateMachine::from_json(&raw)?;
    Ok(machine)
}

fn validate_command(path: &Path) -> Result<()> {
    let machine = read_definition(path)?;
    machine.validate()?;
    println!(
        "✅ Definition '{}' is valid ({} states, starts at '{}')",
        machine.name,
        machine.states.len(),
        machine.start_state
    );
    Ok(())
}

async fn simulate_command(
    config: EngineConfig,
    definition: &Path,
    script: Option<&Path>,
    input: Option<&str>,
    business_key: Option<String>,
) -> Result<()> {
    let machine = read_definition(definition)?;
    let machine_name = machine.name.clone();
    let definitions = Arc::new(InMemoryDefinitionProvider::new());
    definitions.register(machine)?;

    let invoker = match script {
        Some(path) => {
            let raw = fs::read_to_string(path).with_context(|| format!("Failed to read script {}", path.display()))?;
            ScriptedInvoker::from_json(&raw)?
        }
        None => ScriptedInvoker::new(),
    };
    let params: Value = match input {
        Some(raw) => serde_json::from_str(raw).context("Input must be a JSON object")?,
        None => json!({}),
    };

    let engine = SagaEngine::builder()
        .config(config)
        .definitions(definitions)
        .invoker(Arc::new(invoker))
        .build()?;
    engine.start()?;
    let instance = engine.execute(&machine_name, business_key, params).await?;
    engine.stop();

    println!("{}", serde_json::to_string_pretty(&instance)?);
    Ok(())
}
