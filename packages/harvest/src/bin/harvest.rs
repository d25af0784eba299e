// Command-line entry point for one-off extractions.
//
// Usage:
//   harvest extract https://example.com "List the opening hours" --tier pro --credits 5
//   harvest chain --tier free

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use harvest::pipeline::ResolveRequest;
use harvest::{
    BrowserFetcher, ConfigChainResolver, ContentFetcher, ExtractContext, ExtractInput, Extractor,
    HeuristicDetector, HttpFetcher, MemoryStore, OpenAiCompatClient, PipelineConfig,
    PlaintextVault, PriceTable, RateLimitedFetcher, Tier, ValidatedFetcher,
};

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Budget-aware structured extraction from web pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract structured data from a page
    Extract {
        /// Page to extract from
        url: String,

        /// What to extract
        instructions: String,

        /// Subscription tier to run as
        #[arg(long, default_value = "free")]
        tier: Tier,

        /// Credits to grant before running
        #[arg(long, default_value = "1")]
        credits: Decimal,

        /// JSON schema for the output, inline or a path to a file
        #[arg(long)]
        schema: Option<String>,

        /// Allow escalation to browser rendering
        #[arg(long)]
        dynamic: bool,

        /// Skip the credit check
        #[arg(long)]
        skip_credit_check: bool,
    },

    /// Print the backend chain a tier would use
    Chain {
        #[arg(long, default_value = "free")]
        tier: Tier,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvest=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Extract {
            url,
            instructions,
            tier,
            credits,
            schema,
            dynamic,
            skip_credit_check,
        } => {
            run_extract(
                config,
                url,
                instructions,
                tier,
                credits,
                schema,
                dynamic,
                skip_credit_check,
            )
            .await
        }
        Commands::Chain { tier } => print_chain(config, tier).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_extract(
    config: PipelineConfig,
    url: String,
    instructions: String,
    tier: Tier,
    credits: Decimal,
    schema: Option<String>,
    dynamic: bool,
    skip_credit_check: bool,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let detector = Arc::new(HeuristicDetector::new());

    let http = HttpFetcher::new()
        .context("Failed to build HTTP client")?
        .with_user_agent(config.fetch.user_agent.clone())
        .with_max_body_bytes(config.fetch.max_body_bytes)
        .with_detector(detector.clone());
    let static_fetcher: Arc<dyn ContentFetcher> =
        match config.fetch.requests_per_second.and_then(NonZeroU32::new) {
            Some(rps) => Arc::new(RateLimitedFetcher::new(ValidatedFetcher::new(http), rps)),
            None => Arc::new(ValidatedFetcher::new(http)),
        };

    let llm = OpenAiCompatClient::new().context("Failed to build LLM client")?;

    let mut builder = Extractor::builder(
        store,
        static_fetcher,
        Arc::new(llm),
        Arc::new(PriceTable::default()),
    );
    if let Some(renderer_url) = &config.fetch.renderer_url {
        let mut browser = BrowserFetcher::new(renderer_url.clone())
            .context("Failed to build rendering client")?
            .with_detector(detector);
        if let Some(key) = &config.fetch.renderer_api_key {
            browser = browser.with_api_key(key.clone());
        }
        builder = builder.with_dynamic_fetcher(Arc::new(ValidatedFetcher::new(browser)));
    }
    let extractor = builder.with_config(config).build();

    let user_id = Uuid::new_v4();
    if credits > Decimal::ZERO {
        extractor
            .ledger()
            .credit_topup(user_id, credits, None)
            .await
            .context("Failed to seed credits")?;
    }

    let mut input = ExtractInput::new(url, instructions);
    if let Some(schema) = schema {
        input = input.with_schema(load_schema(&schema)?);
    }
    let ctx = ExtractContext::for_tier(user_id, tier)
        .with_dynamic_content(dynamic)
        .with_skip_credit_check(skip_credit_check);

    let result = extractor.extract(user_id, input, &ctx).await;
    extractor.shutdown().await;

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            let body = serde_json::json!({
                "success": false,
                "category": e.category().as_str(),
                "message": e.user_message(false),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Err(anyhow::Error::new(e).context("Extraction failed"))
        }
    }
}

async fn print_chain(config: PipelineConfig, tier: Tier) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let resolver = ConfigChainResolver::new(config.chain, store, Arc::new(PlaintextVault));

    let ctx = ExtractContext::for_tier(Uuid::new_v4(), tier);
    let chain = resolver
        .resolve(&ResolveRequest::from_context(&ctx, None))
        .await;

    for entry in chain.entries() {
        println!("{}", entry.label());
    }
    Ok(())
}

fn load_schema(schema: &str) -> Result<serde_json::Value> {
    let trimmed = schema.trim_start();
    let raw = if trimmed.starts_with('{') {
        schema.to_string()
    } else {
        let path = PathBuf::from(schema);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read schema file {}", path.display()))?
    };
    serde_json::from_str(&raw).context("Schema is not valid JSON")
}
