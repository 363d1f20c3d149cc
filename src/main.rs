use clap::Parser;
use miette::Result;
use policy_gate::policy::loader;
use policy_gate::settings::{Overrides, Settings};
use policy_gate::web;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "policy-gate",
    version,
    about = "Reverse proxy that forwards requests only when the route's policy allows them"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(flatten)]
    overrides: Overrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings, flags win over file and environment
    let mut settings = Settings::load(&cli.config)?;
    settings.apply(cli.overrides);
    tracing::info!(?settings, "Loaded configuration");

    let target = settings.target()?;

    // every policy must compile before anything listens
    let policies = loader::load_policies(settings.policies_path()?)?;

    web::serve(&settings, target, policies).await?;
    Ok(())
}
