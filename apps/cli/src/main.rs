use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use iidi_aggregator::auth::{load_public_key, AuthError, TokenVerifier};
use iidi_aggregator::config::{AuthConfig, Config};
use iidi_aggregator::state::build_service;
use iidi_fhir_client::HttpFhirSource;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "iidi",
    about = "Operator tools for the immunization aggregator",
    version,
    arg_required_else_help = true
)]
struct Cli {
    /// Log progress to stderr (repeat for more detail).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one aggregation pass against a FHIR server and print the rows as JSON.
    Aggregate {
        /// FHIR base URL (e.g. https://fhir.example.org/fhir).
        #[arg(long)]
        fhir_url: String,
        /// Jurisdiction stamped on every row (BC or ON). Inferred from the URL when omitted.
        #[arg(long)]
        jurisdiction: Option<String>,
        /// Age grouping: years or buckets.
        #[arg(long, default_value = "years")]
        age_grouping: String,
        /// Measure ages against today or the immunization date.
        #[arg(long, default_value = "today")]
        age_reference: String,
        /// Search page size (`_count`).
        #[arg(long, default_value_t = 500)]
        page_size: usize,
        /// Stop after this many pages per resource type.
        #[arg(long)]
        max_pages: Option<usize>,
        /// Per-request timeout in seconds.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Output file path (stdout if omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Pretty-print JSON output.
        #[arg(short, long)]
        pretty: bool,
    },

    /// Verify a bearer token against a public key and print its claims.
    VerifyToken {
        /// PEM-encoded public key.
        #[arg(short, long, value_name = "PATH")]
        key: PathBuf,
        /// Signature algorithm.
        #[arg(short, long, default_value = "RS256")]
        algorithm: String,
        /// Expected `aud` claim.
        #[arg(long)]
        audience: Option<String>,
        /// Expected `iss` claim.
        #[arg(long)]
        issuer: Option<String>,
        /// The token (or "-" for stdin).
        token: String,
    },

    /// Print CLI version.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Aggregate {
            fhir_url,
            jurisdiction,
            age_grouping,
            age_reference,
            page_size,
            max_pages,
            timeout,
            output,
            pretty,
        } => {
            let mut config = Config::default();
            config.fhir.base_url = fhir_url;
            config.fhir.page_size = page_size;
            config.fhir.max_pages = max_pages;
            config.fhir.request_timeout_seconds = timeout;
            config.aggregation.jurisdiction = jurisdiction;
            config.aggregation.age_grouping = age_grouping;
            config.aggregation.age_reference = age_reference;
            // No key is needed to aggregate.
            config.auth.local_dev = true;

            run_aggregate(&config, output.as_deref(), pretty).await?;
        }
        Commands::VerifyToken {
            key,
            algorithm,
            audience,
            issuer,
            token,
        } => {
            let config = AuthConfig {
                public_key_path: key.display().to_string(),
                algorithm,
                audience,
                issuer,
                ..AuthConfig::default()
            };
            run_verify_token(&config, &key, &token)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_aggregate(config: &Config, output: Option<&Path>, pretty: bool) -> Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid arguments: {e}"))?;

    let source = HttpFhirSource::new(&config.fhir.base_url, config.fhir.request_timeout())
        .with_context(|| format!("Invalid FHIR URL '{}'", config.fhir.base_url))?;
    let service = build_service(config, Arc::new(source))?;

    let rows = service.aggregate_on(chrono::Utc::now().date_naive()).await;
    let stats = service.resolver().stats();
    tracing::info!(
        rows = rows.len(),
        patients_cached = stats.len,
        patient_fetch_failures = stats.failures,
        "Aggregation finished"
    );

    let json = if pretty {
        serde_json::to_string_pretty(&rows)?
    } else {
        serde_json::to_string(&rows)?
    };

    match output {
        Some(path) => tokio::fs::write(path, format!("{json}\n"))
            .await
            .with_context(|| format!("Failed to write '{}'", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

fn run_verify_token(config: &AuthConfig, key: &Path, token: &str) -> Result<()> {
    let token = if token == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read token from stdin")?;
        buf.trim().to_string()
    } else {
        token.trim().to_string()
    };

    let pem = load_public_key(key)?;
    let verifier = TokenVerifier::from_pem(pem.as_bytes(), config)?;
    let claims = verifier.verify(&token).map_err(|e| match e {
        AuthError::InvalidToken(reason) => anyhow::anyhow!("Token rejected: {reason}"),
        AuthError::MissingToken => anyhow::anyhow!("No token given"),
    })?;

    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}
