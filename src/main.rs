use anyhow::Context;
use clap::{Parser, Subcommand};
use llm_relay::logging::init_logging;
use llm_relay::{GenerationParams, GenerationRequest, Relay, RelayConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Cached, coalesced and pooled access to an LLM generation upstream")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults plus environment when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a completion through the relay
    Generate {
        prompt: String,
        #[arg(short, long)]
        model: Option<String>,
        #[arg(long, default_value_t = 1000)]
        max_tokens: u32,
        #[arg(long, default_value_t = 0.7)]
        temperature: f64,
        /// Skip cache lookups
        #[arg(long)]
        no_cache: bool,
    },
    /// Print cache, coalescing and pool statistics as JSON
    Stats,
    /// Remove the cached response for a prompt
    Invalidate {
        prompt: String,
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Remove every cached response
    ClearCache,
    /// List cached responses similar to a prompt
    Similar {
        prompt: String,
        #[arg(short, long)]
        model: Option<String>,
        #[arg(short = 'n', long, default_value_t = 5)]
        max_results: usize,
    },
    /// Write a default configuration file
    InitConfig { path: PathBuf },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RelayConfig> {
    let config = match path {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RelayConfig::from_env().context("Invalid environment configuration")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        RelayConfig::default().save(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    let _guard = init_logging(&config.logging);
    let default_model = config.upstream.default_model.clone();

    let relay = Relay::init(config).await?;

    let result = run(&relay, cli.command, &default_model).await;
    relay.shutdown().await;
    result
}

async fn run(relay: &Relay, command: Commands, default_model: &str) -> anyhow::Result<()> {
    match command {
        Commands::Generate {
            prompt,
            model,
            max_tokens,
            temperature,
            no_cache,
        } => {
            let mut request = GenerationRequest::new(prompt).params(GenerationParams::new(max_tokens, temperature));
            if let Some(model) = model {
                request = request.model(model);
            }
            if no_cache {
                request = request.skip_cache();
            }

            let response = relay.generate(&request).await?;
            eprintln!(
                "[{:?} via {}, {:.1} ms]",
                response.source, response.model, response.elapsed_ms
            );
            println!("{}", response.content);
        }
        Commands::Stats => {
            let stats = relay.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Invalidate { prompt, model } => {
            let model = model.as_deref().unwrap_or(default_model);
            if relay.cache().invalidate(&prompt, model).await {
                println!("Invalidated cached response");
            } else {
                println!("No cached response found");
            }
        }
        Commands::ClearCache => {
            let removed = relay.cache().clear_all().await;
            println!("Removed {} cached entries", removed);
        }
        Commands::Similar {
            prompt,
            model,
            max_results,
        } => {
            let model = model.as_deref().unwrap_or(default_model);
            let matches = relay.cache().get_similar(&prompt, model, max_results).await;
            if matches.is_empty() {
                println!("No similar responses cached");
            }
            for found in matches {
                println!("{:.3}  {}", found.similarity, llm_relay::fingerprint::preview(&found.prompt));
            }
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}
