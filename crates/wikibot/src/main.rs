use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use wikibot_core::cache::LookupCaches;
use wikibot_core::categories::{CategoryReconciler, discover_leaf_categories, is_category_title};
use wikibot_core::config::{BotConfig, DEFAULT_CONFIG_PATH, load_config};
use wikibot_core::pipeline::{BatchReport, Confirmer, Decision, PageOutcome, Pipeline, PipelineOptions};
use wikibot_core::service::{MediaWikiClient, MediaWikiClientConfig, WikiContentService};

#[derive(Debug, Parser)]
#[command(
    name = "wikibot",
    version,
    about = "Reconcile wiki template data with categories and cross-references"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(short, long, global = true, help = "Log at debug level")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Reconcile pages, asking before each save")]
    Run(RunArgs),
    #[command(about = "Show the diff and warnings for one page without saving")]
    Check(CheckArgs),
    #[command(name = "leaf-categories", about = "Print the removable category set")]
    LeafCategories,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(short = 'c', long, value_name = "NAME", help = "Process members of a category")]
    category: Option<String>,
    #[arg(long, requires = "category", help = "Include members of subcategories")]
    recursive: bool,
    #[arg(long, help = "Compute diffs but never save")]
    dry_run: bool,
    #[arg(short, long, help = "Save every change without asking")]
    yes: bool,
    titles: Vec<String>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    title: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    dotenvy::dotenv().ok();

    let config = load_config(&cli.config)?;
    match cli.command {
        Some(Commands::Run(args)) => run_batch(&config, args),
        Some(Commands::Check(CheckArgs { title })) => run_check(&config, &title),
        Some(Commands::LeafCategories) => run_leaf_categories(&config),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Logs go to stderr; stdout carries diffs and prompts.
fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "wikibot=debug,wikibot_core=debug"
    } else {
        "wikibot=info,wikibot_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn connect(config: &BotConfig) -> Result<MediaWikiClient> {
    let client_config = MediaWikiClientConfig::from_config(&config.wiki)?;
    info!(api_url = %client_config.api_url, "connecting to wiki");
    MediaWikiClient::new(client_config)
}

fn leaf_categories(
    service: &mut dyn WikiContentService,
    config: &BotConfig,
) -> Result<BTreeSet<String>> {
    if !config.bot.leaf_categories.is_empty() {
        return Ok(config.bot.leaf_categories.iter().cloned().collect());
    }
    match config.bot.needs_root_category.as_deref() {
        Some(root) => discover_leaf_categories(service, root),
        None => Ok(BTreeSet::new()),
    }
}

fn run_batch(config: &BotConfig, args: RunArgs) -> Result<()> {
    let mut client = connect(config)?;

    let mut titles = args.titles;
    if let Some(category) = args.category.as_deref() {
        let members = client
            .list_category_members(category, args.recursive)
            .with_context(|| format!("failed to list Category:{category}"))?;
        titles.extend(members.into_iter().filter(|title| !is_category_title(title)));
    }
    if titles.is_empty() {
        bail!("nothing to do: pass page titles or --category");
    }

    let reconciler = CategoryReconciler::new(leaf_categories(&mut client, config)?);
    let mut confirmer = StdinConfirmer;
    let options = PipelineOptions {
        dry_run: args.dry_run,
        assume_yes: args.yes,
    };
    let report = Pipeline::new(
        &mut client,
        &mut confirmer,
        &config.bot,
        reconciler,
        LookupCaches::default(),
        options,
    )
    .run_batch(&titles);

    print_report(&report, args.dry_run);
    Ok(())
}

fn run_check(config: &BotConfig, title: &str) -> Result<()> {
    let mut client = connect(config)?;
    let reconciler = CategoryReconciler::new(leaf_categories(&mut client, config)?);
    let mut confirmer = StdinConfirmer;
    let outcome = Pipeline::new(
        &mut client,
        &mut confirmer,
        &config.bot,
        reconciler,
        LookupCaches::default(),
        PipelineOptions {
            dry_run: true,
            assume_yes: false,
        },
    )
    .run_page(title);

    print_outcome(&outcome, true);
    Ok(())
}

fn run_leaf_categories(config: &BotConfig) -> Result<()> {
    let mut client = connect(config)?;
    let leaves = leaf_categories(&mut client, config)?;
    println!("leaf categories: {}", leaves.len());
    for leaf in leaves {
        println!("  - {leaf}");
    }
    Ok(())
}

fn print_report(report: &BatchReport, show_diffs: bool) {
    for outcome in &report.outcomes {
        print_outcome(outcome, show_diffs);
    }
    println!("{}", report.summary());
}

fn print_outcome(outcome: &PageOutcome, show_diff: bool) {
    match outcome.reason.as_deref() {
        Some(reason) => println!("{}: {} ({reason})", outcome.title, outcome.kind),
        None => println!("{}: {}", outcome.title, outcome.kind),
    }
    if show_diff && let Some(diff) = outcome.diff.as_deref() {
        print!("{diff}");
    }
    for warning in &outcome.warnings {
        println!("  warning: {warning}");
    }
}

struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&mut self, title: &str, diff: &str) -> Result<Decision> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        print!("{diff}");
        loop {
            write!(stdout, "Save {title}? [y]es, [n]o, [a]ll, [s]kip: ")?;
            stdout.flush()?;
            let mut answer = String::new();
            if stdin.lock().read_line(&mut answer)? == 0 {
                return Ok(Decision::Skip);
            }
            match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(Decision::Accept),
                "n" | "no" => return Ok(Decision::Reject),
                "a" | "all" => return Ok(Decision::AcceptAll),
                "s" | "skip" | "" => return Ok(Decision::Skip),
                _ => continue,
            }
        }
    }
}
