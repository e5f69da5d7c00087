//! `campaign-engine` binary
//!
//! Runs the orchestrator, call engine and HTTP API in one process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Instrument};

use rvoip_campaign_engine::config::CampaignEngineConfig;
use rvoip_campaign_engine::logging::{component_span, parse_log_level, setup_logging, LogFormat, LoggingConfig};
use rvoip_campaign_engine::server::CampaignServerBuilder;
use rvoip_campaign_engine::telephony::simulated::SimulatedBehavior;

#[derive(Debug, Parser)]
#[command(name = "campaign-engine", version, about = "Outbound IVR campaign engine")]
struct Cli {
    /// TOML configuration file; `CAMPAIGN__*` environment variables override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// API bind address, overriding the configuration
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Use the in-process telephony simulator instead of ARI
    #[arg(long)]
    simulate: bool,

    /// Digit pressed on every simulated call (with --simulate)
    #[arg(long, value_name = "DIGIT", requires = "simulate")]
    simulate_digit: Option<char>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Extra filter directive such as `rvoip_campaign_engine::calls=debug` (repeatable)
    #[arg(long = "log-directive", value_name = "DIRECTIVE")]
    log_directives: Vec<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CampaignEngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CampaignEngineConfig::from_env().context("loading configuration from environment")?,
    };
    if let Some(bind) = cli.bind {
        config.api.bind_address = bind;
        config.validate()?;
    }

    if cli.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let mut logging = LoggingConfig::new(parse_log_level(&cli.log_level)?);
    if cli.json_logs {
        logging = logging.with_format(LogFormat::Json);
    }
    for directive in cli.log_directives {
        logging = logging.with_directive(directive);
    }
    setup_logging(logging)?;
    let span = component_span(&config.general.instance_id, "main");

    let mut builder = CampaignServerBuilder::new().with_config(config);
    if cli.simulate {
        builder = builder.with_simulated_telephony(SimulatedBehavior::AutoAnswer {
            digit: cli.simulate_digit,
            step: Duration::from_millis(500),
        });
    }

    async move {
        let mut server = builder.build().await.context("building campaign engine")?;
        server.start().await.context("starting campaign engine")?;
        info!("Press Ctrl+C to stop");
        server.run().await?;
        Ok::<_, anyhow::Error>(())
    }
    .instrument(span)
    .await
}
