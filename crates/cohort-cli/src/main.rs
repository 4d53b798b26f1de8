mod output;
mod run;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "run-experiment",
    about = "Intent experiment: run cohorts of sandboxed agents against pre-created cities",
    version
)]
pub struct Cli {
    /// Number of cohorts to run back to back (one agent per intent each)
    #[arg(short = 'n', long = "pairs", default_value_t = 5)]
    pub pairs: usize,

    /// Experiment config (YAML); defaults apply when the file is missing
    #[arg(long, default_value = "experiment.yaml")]
    pub config: PathBuf,

    /// Results directory (default: results/<YYYYmmdd_HHMMSS>)
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Model-router API key handed to every sandbox
    #[arg(long, env = "ANTHROPIC_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Model the router is configured for (recorded in metadata)
    #[arg(long, env = "CCR_MODEL")]
    pub model: Option<String>,
}

fn main() {
    // .env first so clap sees its values; existing variables win.
    let dotenv = dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    if let Some(path) = dotenv {
        tracing::info!(path = %path.display(), "loaded environment file");
    }

    let result = tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(run::run(cli)));

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
