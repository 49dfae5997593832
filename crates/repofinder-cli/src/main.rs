use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use repofinder_core::config_file;
use repofinder_core::gateway::{ChatMessage, complete_json};
use repofinder_core::{
    Config, CoreError, ModelGateway, Pipeline, ProcessOptions, Provider, RepoVerdictRecord,
};

mod output;
mod papers;

use output::{ColorMode, Probe, RunStats};

/// Repository finder - Find and validate code repositories for research papers
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find and validate repositories for every paper under a root directory
    Run(RunArgs),

    /// Check connectivity to the model gateway and the GitHub API
    Check {
        #[command(flatten)]
        llm: LlmArgs,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Write a config file holding the current settings (without secrets)
    InitConfig {
        /// Target path (default: the platform config directory)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct LlmArgs {
    /// LLM provider: aliyun, zenmux, openai, deepseek or moonshot
    #[arg(long)]
    provider: Option<Provider>,

    /// Model name (default: the provider's default model)
    #[arg(long)]
    model: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Papers root directory, laid out as <venue>/<year>/<paper>/
    #[arg(long, env = "PAPERS_ROOT_DIR")]
    root_dir: PathBuf,

    /// Only process one paper, relative to the root (e.g. "CVPR/2024/Paper Title")
    #[arg(long)]
    single: Option<PathBuf>,

    /// Process at most this many papers
    #[arg(long)]
    limit: Option<usize>,

    /// Rule-based filtering only, no model calls
    #[arg(long)]
    no_llm: bool,

    /// Skip link extraction from the paper text; search GitHub only
    #[arg(long)]
    skip_pdf: bool,

    /// Find repositories without assessing their quality
    #[arg(long)]
    skip_validation: bool,

    /// Reprocess papers that already have a result
    #[arg(long)]
    no_resume: bool,

    /// Papers processed concurrently
    #[arg(long)]
    workers: Option<usize>,

    #[command(flatten)]
    llm: LlmArgs,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { llm, no_color } => check(llm, no_color).await,
        Command::InitConfig { path, force } => init_config(path, force),
    }
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Terminal logging defaults to warnings, since progress is printed
/// separately; the optional log file records at info.
fn init_tracing(
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter("info"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Resolve configuration: defaults < config files < environment < flags.
fn resolve_config(llm: &LlmArgs) -> Config {
    let mut config = Config::default();
    config_file::apply_to_config(&config_file::load_config(), &mut config);
    config_file::apply_env(&mut config, |k| std::env::var(k).ok());

    if let Some(provider) = llm.provider
        && provider != config.llm.provider
    {
        config.llm.switch_provider(provider);
        config.llm.api_key = std::env::var(provider.api_key_env())
            .ok()
            .filter(|k| !k.trim().is_empty());
    }
    if let Some(model) = &llm.model {
        config.llm.model = model.clone();
    }
    config
}

fn color_mode(no_color: bool) -> ColorMode {
    ColorMode(!no_color && std::io::stdout().is_terminal())
}

fn build_pipeline(config: Config, options: ProcessOptions) -> anyhow::Result<Pipeline> {
    match Pipeline::from_config(config, options) {
        Ok(pipeline) => Ok(pipeline),
        Err(CoreError::Config(msg)) => anyhow::bail!(
            "{}\nSet the key in the environment or a config file, or run with --no-llm.",
            msg
        ),
        Err(e) => Err(e.into()),
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Write to the shared output with the progress bar cleared.
fn emit(
    out: &SharedWriter,
    bar: &ProgressBar,
    f: impl FnOnce(&mut dyn Write) -> std::io::Result<()>,
) {
    bar.suspend(|| {
        if let Ok(mut w) = out.lock() {
            let _ = f(&mut **w);
            let _ = w.flush();
        }
    });
}

enum PaperOutcome {
    Skipped,
    Done(RepoVerdictRecord),
    Failed(anyhow::Error),
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = resolve_config(&args.llm);
    if let Some(workers) = args.workers {
        config.num_workers = workers.max(1);
    }
    let workers = config.num_workers.max(1);
    let options = ProcessOptions {
        use_llm: !args.no_llm,
        skip_pdf: args.skip_pdf,
        skip_validation: args.skip_validation,
    };
    let resume = !args.no_resume;
    let color = color_mode(args.no_color);

    if !args.root_dir.is_dir() {
        anyhow::bail!("Root directory not found: {}", args.root_dir.display());
    }
    let mut dirs = match &args.single {
        Some(rel) => {
            let dir = args.root_dir.join(rel);
            if !dir.join(papers::PAPER_DATA_FILE).is_file() {
                anyhow::bail!(
                    "Paper not found: {} (expected a directory containing {})",
                    dir.display(),
                    papers::PAPER_DATA_FILE
                );
            }
            vec![dir]
        }
        None => papers::discover_papers(&args.root_dir),
    };
    if let Some(limit) = args.limit {
        dirs.truncate(limit);
    }

    let out: SharedWriter = Arc::new(Mutex::new(Box::new(std::io::stdout())));
    if dirs.is_empty() {
        println!("No papers found under {}", args.root_dir.display());
        return Ok(());
    }

    let pipeline = Arc::new(build_pipeline(config, options)?);
    let total = dirs.len();
    tracing::info!(
        total,
        workers,
        llm = pipeline.gateway().is_some(),
        resume,
        "starting batch"
    );
    println!("Found {} paper(s) to process\n", total);

    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.green/dim}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );

    let start = Instant::now();
    let mut stats = RunStats::new(total);
    let mut results = futures_util::stream::iter(dirs.into_iter().enumerate())
        .take_while(|_| futures_util::future::ready(!cancel.is_cancelled()))
        .map(|(i, dir)| {
            let pipeline = Arc::clone(&pipeline);
            let out = Arc::clone(&out);
            let bar = bar.clone();
            async move {
                let label = format!("[{}/{}]", i + 1, total);
                let outcome = process_dir(&pipeline, &dir, &label, resume, &out, &bar, color).await;
                (label, outcome)
            }
        })
        .buffer_unordered(workers);

    while let Some((label, outcome)) = results.next().await {
        match outcome {
            PaperOutcome::Skipped => stats.skipped += 1,
            PaperOutcome::Done(record) => stats.record(&record),
            PaperOutcome::Failed(e) => {
                tracing::error!(paper = %label, error = %format!("{e:#}"), "paper failed");
                emit(&out, &bar, |w| writeln!(w, "{} error: {:#}", label, e));
                stats.errors += 1;
            }
        }
        let status = stats.status_line(start.elapsed());
        bar.inc(1);
        bar.set_message(status.clone());
        if bar.is_hidden() {
            emit(&out, &bar, |w| {
                writeln!(w, "progress: {}/{} | {}", stats.done(), total, status)
            });
        }
    }
    drop(results);
    bar.finish_and_clear();

    let interrupted = cancel.is_cancelled();
    if interrupted {
        tracing::warn!(done = stats.done(), total, "interrupted, remaining papers not scheduled");
    }
    let mut w = out
        .lock()
        .map_err(|_| anyhow::anyhow!("output lock poisoned"))?;
    output::print_summary(&mut **w, &stats, start.elapsed(), interrupted, color)?;
    Ok(())
}

async fn process_dir(
    pipeline: &Pipeline,
    dir: &Path,
    label: &str,
    resume: bool,
    out: &SharedWriter,
    bar: &ProgressBar,
    color: ColorMode,
) -> PaperOutcome {
    let options = pipeline.options();
    let existing = if resume {
        papers::load_record(dir)
    } else {
        None
    };
    let revalidate = !options.skip_validation
        && existing.as_ref().is_some_and(RepoVerdictRecord::needs_validation);
    if !revalidate && existing.as_ref().is_some_and(RepoVerdictRecord::is_processed) {
        emit(out, bar, |w| writeln!(w, "{} already processed, skipped", label));
        return PaperOutcome::Skipped;
    }

    let load_dir = dir.to_path_buf();
    let max_pages = pipeline.config().pdf_max_pages;
    let loaded = tokio::task::spawn_blocking(move || {
        papers::load_paper(&load_dir, options.skip_pdf, max_pages)
    })
    .await;
    let paper = match loaded {
        Ok(Ok(paper)) => paper,
        Ok(Err(e)) => return PaperOutcome::Failed(e),
        Err(e) => return PaperOutcome::Failed(e.into()),
    };
    emit(out, bar, |w| output::print_paper_start(w, label, &paper.title, color));

    let started = Instant::now();
    let record = pipeline
        .process_paper(
            &paper,
            existing.as_ref().filter(|_| revalidate),
            &|event| emit(out, bar, |w| output::print_progress(w, label, &event, color)),
        )
        .await;

    if let Err(e) = papers::save_record(dir, &record) {
        return PaperOutcome::Failed(e);
    }
    emit(out, bar, |w| {
        output::print_outcome(w, label, &record, started.elapsed(), color)
    });
    PaperOutcome::Done(record)
}

async fn probe_gateway(gateway: &dyn ModelGateway) -> Probe {
    let messages = vec![
        ChatMessage::system("Reply in JSON format."),
        ChatMessage::user(r#"Reply with {"ok": true}"#),
    ];
    let started = Instant::now();
    match complete_json(gateway, messages, 0.0).await {
        Ok(_) => Probe::Ok(format!(
            "{} replied in {:.1}s",
            gateway.model(),
            started.elapsed().as_secs_f64()
        )),
        Err(e) => Probe::Failed(e.to_string()),
    }
}

async fn check(llm: LlmArgs, no_color: bool) -> anyhow::Result<()> {
    let config = resolve_config(&llm);
    let color = color_mode(no_color);
    let mut w = std::io::stdout();

    writeln!(
        w,
        "Model: {} / {} ({})",
        config.llm.provider, config.llm.model, config.llm.base_url
    )?;
    writeln!(w, "GitHub API: {}", config.github_api_url)?;
    writeln!(w)?;

    let authenticated = config.github_token.is_some();
    let (pipeline, gateway_note) = match Pipeline::from_config(config.clone(), ProcessOptions::default()) {
        Ok(pipeline) => (pipeline, None),
        Err(CoreError::Config(msg)) => {
            let options = ProcessOptions {
                use_llm: false,
                ..Default::default()
            };
            (Pipeline::from_config(config, options)?, Some(msg))
        }
        Err(e) => return Err(e.into()),
    };

    let gateway_probe = match (pipeline.gateway(), gateway_note) {
        (Some(gateway), _) => probe_gateway(gateway).await,
        (None, Some(note)) => Probe::Skipped(note),
        (None, None) => Probe::Skipped("model calls disabled in config".to_string()),
    };
    output::print_probe(&mut w, "model gateway", &gateway_probe, color)?;

    let status = pipeline.hosting().rate_limit_status().await;
    let hosting_probe = match &status {
        Some(_) => Probe::Ok("reachable".to_string()),
        None => Probe::Failed("rate limit endpoint did not answer".to_string()),
    };
    output::print_probe(&mut w, "GitHub API", &hosting_probe, color)?;
    if let Some(status) = &status {
        output::print_rate_status(&mut w, status, authenticated, color)?;
    }

    if matches!(gateway_probe, Probe::Failed(_)) || matches!(hosting_probe, Probe::Failed(_)) {
        anyhow::bail!("connectivity check failed");
    }
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path,
        None => config_file::config_path().context("Could not determine config directory")?,
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = Config::default();
    config_file::apply_to_config(&config_file::load_config(), &mut config);
    config_file::save_to_path(&config_file::template_from(&config), &path)
        .map_err(anyhow::Error::msg)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use repofinder_core::hosting::mock::MockHosting;
    use repofinder_core::{RepoType, RepositorySummary};

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "repofinder",
            "run",
            "--root-dir",
            "/papers",
            "--single",
            "CVPR/2024/Demo Net",
            "--limit",
            "3",
            "--no-llm",
            "--provider",
            "DeepSeek",
            "--log-file",
            "run.log",
        ])
        .unwrap();
        assert_eq!(cli.log_file.as_deref(), Some(Path::new("run.log")));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.root_dir, PathBuf::from("/papers"));
        assert_eq!(args.single, Some(PathBuf::from("CVPR/2024/Demo Net")));
        assert_eq!(args.limit, Some(3));
        assert!(args.no_llm);
        assert!(!args.no_resume);
        assert_eq!(args.llm.provider, Some(Provider::Deepseek));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = Cli::try_parse_from(["repofinder", "check", "--provider", "skynet"]);
        assert!(err.is_err());
    }

    fn quiet() -> (SharedWriter, ProgressBar) {
        (
            Arc::new(Mutex::new(Box::new(std::io::sink()))),
            ProgressBar::hidden(),
        )
    }

    fn search_pipeline(hosting: Arc<MockHosting>) -> Pipeline {
        let options = ProcessOptions {
            use_llm: false,
            skip_pdf: true,
            skip_validation: false,
        };
        Pipeline::new(Config::default(), options, hosting, None)
    }

    fn paper_dir(root: &Path) -> PathBuf {
        let dir = root.join("CVPR/2024/Demo Net");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(papers::PAPER_DATA_FILE),
            r#"{"title": "Demo Net", "year": 2024, "conference": "CVPR"}"#,
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn processed_paper_is_skipped_on_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = paper_dir(tmp.path());
        let done = RepoVerdictRecord {
            repo_type: Some(RepoType::NoneFound),
            processed_at: Some("2026-01-01T00:00:00.000000".into()),
            ..Default::default()
        };
        papers::save_record(&dir, &done).unwrap();

        let hosting = Arc::new(MockHosting::new());
        let pipeline = search_pipeline(hosting.clone());
        let (out, bar) = quiet();

        let outcome = process_dir(&pipeline, &dir, "[1/1]", true, &out, &bar, ColorMode(false)).await;
        assert!(matches!(outcome, PaperOutcome::Skipped));
        assert_eq!(hosting.search_calls(), 0);

        let outcome = process_dir(&pipeline, &dir, "[1/1]", false, &out, &bar, ColorMode(false)).await;
        assert!(matches!(outcome, PaperOutcome::Done(_)));
        assert_eq!(hosting.search_calls(), 1);
        let saved = papers::load_record(&dir).unwrap();
        assert_ne!(saved.processed_at, done.processed_at);
    }

    #[tokio::test]
    async fn unscored_selection_is_revalidated_on_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = paper_dir(tmp.path());
        papers::save_record(&dir, &RepoVerdictRecord {
            selected_repo_url: Some("https://github.com/x/demo".into()),
            repo_type: Some(RepoType::Unofficial),
            processed_at: Some("2026-01-01T00:00:00.000000".into()),
            ..Default::default()
        })
        .unwrap();

        let hosting = Arc::new(MockHosting::new().with_repo(RepositorySummary {
            full_name: "x/demo".into(),
            url: "https://github.com/x/demo".into(),
            size_kb: 2000,
            ..Default::default()
        }));
        let pipeline = search_pipeline(hosting.clone());
        let (out, bar) = quiet();

        let outcome = process_dir(&pipeline, &dir, "[1/1]", true, &out, &bar, ColorMode(false)).await;
        let PaperOutcome::Done(record) = outcome else {
            panic!("expected a processed paper");
        };
        assert_eq!(hosting.search_calls(), 0);
        assert!(record.quality.score.is_some());
        assert_eq!(papers::load_record(&dir), Some(record));
    }

    #[tokio::test]
    async fn unreadable_paper_data_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("V/2024/Broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(papers::PAPER_DATA_FILE), "[oops").unwrap();

        let pipeline = search_pipeline(Arc::new(MockHosting::new()));
        let (out, bar) = quiet();
        let outcome = process_dir(&pipeline, &dir, "[1/1]", true, &out, &bar, ColorMode(false)).await;
        assert!(matches!(outcome, PaperOutcome::Failed(_)));
        assert!(papers::load_record(&dir).is_none());
    }
}
