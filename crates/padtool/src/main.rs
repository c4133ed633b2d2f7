use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use padtool_core::config::{DEFAULT_CONFIG_FILENAME, ToolConfig, load_config};
use padtool_core::fetch::{ERROR_LOG_FILENAME, FetchOptions, MANIFEST_FILENAME, fetch_all};
use padtool_core::http::{HttpSession, ReqwestTransport, SystemClock};
use padtool_core::index::load_index;
use padtool_core::links::{LinkQueryOptions, build_index};
use padtool_core::render::{OutputFormat, write_outputs};
use padtool_core::wikis::{WIKI_SHORTCUTS, WikiTarget};
use tracing::info;
use tracing_subscriber::EnvFilter;

const INDEX_FILE_SUFFIX: &str = "_etherpad_links";

#[derive(Debug, Parser)]
#[command(
    name = "padtool",
    version,
    about = "Index Etherpad links cited on Wikimedia wikis and archive the pads"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Increase log verbosity (-v, -vv)")]
    verbose: u8,
    #[arg(short, long, global = true, help = "Only log errors")]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Build the Etherpad link index for a wiki and write reports")]
    Links(LinksArgs),
    #[command(about = "Download the plain-text export of every pad in an index")]
    Download(DownloadArgs),
    #[command(about = "List wiki shortcuts")]
    Wikis,
}

#[derive(Debug, Args)]
struct LinksArgs {
    #[arg(
        long,
        value_name = "NAME",
        default_value = "meta",
        conflicts_with = "url",
        help = "Wiki shortcut, <lang>.<project>, or Wikipedia language code"
    )]
    wiki: String,
    #[arg(long, value_name = "API_URL", help = "Explicit MediaWiki API endpoint")]
    url: Option<String>,
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "SECS", help = "Delay between API requests")]
    delay: Option<f64>,
    #[arg(
        long,
        value_name = "FORMATS",
        value_delimiter = ',',
        help = "Comma-separated subset of json,wikicode,csv,urls (default: all)"
    )]
    format: Vec<String>,
}

#[derive(Debug, Args)]
struct DownloadArgs {
    #[arg(value_name = "INDEX_JSON")]
    index: PathBuf,
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "SECS", help = "Delay between downloads")]
    delay: Option<f64>,
    #[arg(long, value_name = "SECS", help = "Per-request timeout")]
    timeout: Option<f64>,
    #[arg(long, help = "Skip pads already downloaded in the output directory")]
    resume: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();
    setup_logging(cli.verbose, cli.quiet);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let mut config = load_config(&config_path)?;
    config.apply_env();

    match cli.command {
        Some(Commands::Links(args)) => run_links(&config, args),
        Some(Commands::Download(args)) => run_download(&config, args),
        Some(Commands::Wikis) => run_wikis(),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    let default_filter = if quiet {
        "error"
    } else {
        match verbose {
            0 => "padtool=info,padtool_core=info,warn",
            1 => "padtool=debug,padtool_core=debug,info",
            _ => "padtool=trace,padtool_core=trace,debug",
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_links(config: &ToolConfig, args: LinksArgs) -> Result<()> {
    let target = match &args.url {
        Some(api_url) => WikiTarget::from_api_url(api_url)?,
        None => WikiTarget::from_shortcut(&args.wiki)?,
    };
    let formats = if args.format.is_empty() {
        OutputFormat::ALL.to_vec()
    } else {
        args.format
            .iter()
            .map(|value| OutputFormat::parse(value))
            .collect::<Result<Vec<_>>>()?
    };
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.links.output_dir.clone());

    let mut options = LinkQueryOptions::from_config(target, config);
    if let Some(delay) = args.delay {
        options.page_delay = seconds(delay, "--delay")?;
    }

    info!("querying {} for {}", options.target.api_url, options.query);
    let mut session = HttpSession::new(ReqwestTransport::new(&config.http)?, SystemClock);
    let index = build_index(&mut session, &options)
        .with_context(|| format!("failed to build link index from {}", options.target.api_url))?;

    let stats = index.stats();
    println!("wiki: {}", options.target.wiki_label);
    println!("api_url: {}", options.target.api_url);
    println!("requests: {}", session.request_count());
    println!("total_results: {}", stats.total_results);
    println!("unique_etherpad_urls: {}", stats.unique_etherpad_urls);
    println!("unique_wiki_pages: {}", stats.unique_wiki_pages);

    if index.is_empty() {
        println!("written: <none> (no Etherpad links found)");
        return Ok(());
    }
    for path in write_outputs(&index, &output_dir, &formats)? {
        println!("written: {}", normalize_path(&path));
    }
    Ok(())
}

fn run_download(config: &ToolConfig, args: DownloadArgs) -> Result<()> {
    let index = load_index(&args.index)?;
    let output_dir = match &args.output {
        Some(path) => path.clone(),
        None => config
            .download
            .output_root
            .join(index_label(&args.index, &index.source().wiki_label)),
    };

    let mut http = config.download_http();
    if let Some(timeout) = args.timeout {
        let timeout = seconds(timeout, "--timeout")?;
        if timeout.is_zero() {
            bail!("--timeout must be greater than zero");
        }
        http.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    }

    let mut options = FetchOptions::from_config(&output_dir, config);
    options.resume = args.resume;
    options.index_path = Some(args.index.clone());
    if let Some(delay) = args.delay {
        options.delay = seconds(delay, "--delay")?;
    }

    info!(
        "downloading {} pads into {}",
        index.url_to_pages().len(),
        normalize_path(&output_dir)
    );
    let mut session = HttpSession::new(ReqwestTransport::new(&http)?, SystemClock);
    let manifest = fetch_all(&mut session, &index, &options)?;

    println!("output_dir: {}", normalize_path(&output_dir));
    println!("total: {}", manifest.total);
    println!("succeeded: {}", manifest.succeeded);
    println!("failed: {}", manifest.failed);
    println!("skipped: {}", manifest.skipped);
    println!("requests: {}", session.request_count());
    println!(
        "manifest: {}",
        normalize_path(&output_dir.join(MANIFEST_FILENAME))
    );
    println!(
        "error_log: {}",
        normalize_path(&output_dir.join(ERROR_LOG_FILENAME))
    );
    Ok(())
}

fn run_wikis() -> Result<()> {
    for (name, api_url) in WIKI_SHORTCUTS {
        println!("{name}: {api_url}");
    }
    Ok(())
}

/// `meta_wikimedia_etherpad_links.json` -> `meta_wikimedia`.
fn index_label(index_path: &Path, fallback: &str) -> String {
    let stem = index_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let label = stem.strip_suffix(INDEX_FILE_SUFFIX).unwrap_or(&stem);
    if !label.is_empty() {
        label.to_string()
    } else if !fallback.is_empty() {
        fallback.to_string()
    } else {
        "wiki".to_string()
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) => Ok(duration),
        Err(error) => bail!("{flag} must be a non-negative number of seconds (got {value}): {error}"),
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
