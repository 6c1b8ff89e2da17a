//! rustharvest - PubMed literature harvester
//!
//! Harvests PubMed records for a query, enriches them with OpenAlex and iCite
//! citation counts, reconciles the two and saves a JSON dataset.
//!
//! ## Usage
//!
//! ```bash
//! rustharvest harvest "corona" --start-year 2020 --end-year 2020 --email me@example.org
//! rustharvest summary results.json
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rustharvest::config::{
    CitationsSource, Credentials, Endpoints, HarvestConfig, HarvestRequest, Tuning, DEFAULT_CONCURRENCY,
    DEFAULT_MAX_RECORDS, DEFAULT_PAGE_SIZE,
};
use rustharvest::dataset::{Run, HIGH_DISCREPANCY_PCT};
use rustharvest::harvest::{CancelFlag, Harvester};
use rustharvest::reconcile::{CitationPolicy, Provenance};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// PubMed harvester with OpenAlex/iCite citation reconciliation
#[derive(Parser)]
#[command(name = "rustharvest")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest records for a query and save the dataset
    Harvest(HarvestArgs),

    /// Print the summary of a saved dataset
    Summary {
        /// Dataset written by `harvest`
        file: PathBuf,
    },
}

#[derive(Args)]
struct HarvestArgs {
    /// Search keywords (matched in title/abstract)
    query: String,

    /// First publication year (inclusive)
    #[arg(long)]
    start_year: Option<i32>,

    /// Last publication year (inclusive)
    #[arg(long)]
    end_year: Option<i32>,

    /// Contact e-mail sent to NCBI
    #[arg(long, env = "ENTREZ_EMAIL")]
    email: String,

    /// NCBI API key (10 req/s instead of 3)
    #[arg(long, env = "NCBI_API_KEY")]
    ncbi_api_key: Option<String>,

    /// Address for the OpenAlex polite pool (defaults to --email)
    #[arg(long, env = "OPENALEX_MAILTO")]
    openalex_mailto: Option<String>,

    /// Citation providers: openalex, icite or both
    #[arg(long, default_value_t = CitationsSource::Both)]
    citations_source: CitationsSource,

    /// prefer_openalex, prefer_icite, max, min or reconcile
    #[arg(long, default_value_t = CitationPolicy::PreferOpenalex)]
    citations_policy: CitationPolicy,

    /// Dataset destination
    #[arg(short, long, default_value = "results.json")]
    outfile: PathBuf,

    /// Also write a flat CSV export
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Maximum records to harvest
    #[arg(long, default_value_t = DEFAULT_MAX_RECORDS)]
    max_records: usize,

    /// Identifiers per search page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Concurrent requests per stage
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
}

impl HarvestArgs {
    fn into_config(self) -> HarvestConfig {
        let mut request = HarvestRequest::new(self.query);
        request.start_year = self.start_year;
        request.end_year = self.end_year;
        request.citations_source = self.citations_source;
        request.citations_policy = self.citations_policy;
        request.max_records = self.max_records;

        HarvestConfig {
            request,
            credentials: Credentials {
                email: self.email,
                ncbi_api_key: self.ncbi_api_key.filter(|k| !k.trim().is_empty()),
                openalex_mailto: self.openalex_mailto.filter(|m| !m.trim().is_empty()),
            },
            endpoints: Endpoints::default(),
            tuning: Tuning {
                page_size: self.page_size,
                concurrency: self.concurrency,
                ..Tuning::default()
            },
            outfile: self.outfile,
            csv_out: self.csv,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    match cli.command {
        Commands::Harvest(args) => run_harvest(args.into_config()).await,
        Commands::Summary { file } => {
            let run = Run::load(&file).with_context(|| format!("Failed to load {}", file.display()))?;
            print_summary(&run);
            Ok(())
        }
    }
}

// ============================================================================
// Harvest
// ============================================================================

async fn run_harvest(config: HarvestConfig) -> Result<()> {
    let harvester = Harvester::from_config(&config).context("Invalid harvest configuration")?;

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nInterrupt received, stopping after the current batch...");
            flag.cancel();
        }
    });

    println!("\n--- Harvest: {} ---", config.request.query);
    println!(
        "Citations: {} (policy: {})",
        config.request.citations_source, config.request.citations_policy
    );

    let run = harvester
        .run(&config.request, &cancel)
        .await
        .context("Harvest failed")?;

    run.persist(&config.outfile)
        .with_context(|| format!("Failed to save {}", config.outfile.display()))?;
    println!("Saved: {:?}", config.outfile);

    if let Some(csv_path) = &config.csv_out {
        if run.records.is_empty() {
            println!("No data to save to {:?}", csv_path);
        } else {
            run.write_csv(csv_path)
                .with_context(|| format!("Failed to write {}", csv_path.display()))?;
            println!("Saved: {:?}", csv_path);
        }
    }

    if run.incomplete {
        warn!(records = run.records.len(), "Run is incomplete");
    }
    info!(records = run.records.len(), "Done");

    print_summary(&run);
    Ok(())
}

// ============================================================================
// Summary
// ============================================================================

fn print_summary(run: &Run) {
    let kpis = &run.kpis;
    let years = match (run.year_range.start, run.year_range.end) {
        (Some(start), Some(end)) => format!("{}-{}", start, end),
        (Some(start), None) => format!("{}-", start),
        (None, Some(end)) => format!("-{}", end),
        (None, None) => "all".to_string(),
    };

    println!("\n--- Summary ---");
    println!("Query:            {}", run.query);
    println!("Years:            {}", years);
    println!("Harvested at:     {}", run.harvested_at);
    println!("Citations:        {} (policy: {})", run.citations_source, run.citations_policy);
    println!("Total hits:       {}", kpis.total_found);
    println!("Fetched:          {} ({:.2}% coverage)", kpis.total_fetched, kpis.coverage_pct);
    println!("Records:          {}", kpis.records);
    println!("Skipped/excluded: {} / {}", kpis.skipped, kpis.excluded);
    println!("DOIs backfilled:  {}", kpis.doi_backfilled);
    if run.incomplete {
        let reason = if kpis.cursor_stopped_early {
            "search stopped early"
        } else {
            "cancelled"
        };
        println!("Status:           INCOMPLETE ({})", reason);
    }

    if !run.year_counts.is_empty() {
        println!("\nHits per year:");
        for (year, count) in &run.year_counts {
            println!("  {}: {}", year, count);
        }
    }

    let per_year = run.records_per_year();
    if !per_year.is_empty() {
        println!("\nRecords per year:");
        for (year, count) in &per_year {
            println!("  {}: {}", year, count);
        }
    }

    let count = |p: Provenance| {
        run.records
            .iter()
            .filter(|r| r.citation_provenance == p)
            .count()
    };
    println!("\nCitation provenance:");
    println!("  both_agree:      {}", count(Provenance::BothAgree));
    println!("  both_reconciled: {}", count(Provenance::BothReconciled));
    println!("  openalex_only:   {}", count(Provenance::OpenalexOnly));
    println!("  icite_only:      {}", count(Provenance::IciteOnly));
    println!("  unavailable:     {}", count(Provenance::Unavailable));

    println!("\nCitation statistics:");
    println!(
        "  Dual-source:     {} ({:.2}%)",
        kpis.dual_source_count, kpis.dual_source_pct
    );
    println!(
        "  Discrepancies:   {} ({:.2}% of dual-source)",
        kpis.discrepancy_count, kpis.discrepancy_pct
    );
    println!(
        "  Relative discrepancy: mean {:.2}%, median {:.2}%",
        kpis.mean_discrepancy_pct, kpis.median_discrepancy_pct
    );
    println!(
        "  High (>{:.0}%):      {}",
        HIGH_DISCREPANCY_PCT, kpis.high_discrepancy_count
    );
    for record in run.high_discrepancy_records().take(10) {
        println!(
            "    {} openalex={} icite={} {}",
            record.id,
            record.citations_openalex.unwrap_or_default(),
            record.citations_icite.unwrap_or_default(),
            truncate(&record.title, 60)
        );
    }
    println!(
        "  Retries: {}, failed citation batches: {}",
        kpis.retry_attempts, kpis.failed_citation_batches
    );
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
