use std::io::Write;
use std::time::Duration;

use owo_colors::OwoColorize;
use repofinder_core::{
    ExtractionSource, Meaningful, ProgressEvent, RateStatus, RepoType, RepoVerdictRecord,
};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn source_name(source: ExtractionSource) -> &'static str {
    match source {
        ExtractionSource::Pdf => "paper text",
        ExtractionSource::GithubSearch => "GitHub search",
    }
}

/// Print a real-time progress event for the paper labelled `label`.
pub fn print_progress(
    w: &mut dyn Write,
    label: &str,
    event: &ProgressEvent,
    color: ColorMode,
) -> std::io::Result<()> {
    match event {
        ProgressEvent::CandidatesFound { source, count } => {
            let msg = format!("{} candidate(s) from {}", count, source_name(*source));
            if color.enabled() {
                writeln!(w, "{} {}", label, msg.dimmed())?;
            } else {
                writeln!(w, "{} {}", label, msg)?;
            }
        }
        ProgressEvent::Selected {
            url,
            source,
            reason,
            low_confidence,
        } => {
            let kind = match source {
                ExtractionSource::Pdf => "official",
                ExtractionSource::GithubSearch => "unofficial",
            };
            if color.enabled() {
                write!(w, "{} selected {} {}", label, kind, url.cyan())?;
                if *low_confidence {
                    write!(w, " {}", "(low confidence)".yellow())?;
                }
            } else {
                write!(w, "{} selected {} {}", label, kind, url)?;
                if *low_confidence {
                    write!(w, " (low confidence)")?;
                }
            }
            writeln!(w)?;
            if !reason.is_empty() {
                let msg = format!("  reason: {}", truncate(reason, 100));
                if color.enabled() {
                    writeln!(w, "{} {}", label, msg.dimmed())?;
                } else {
                    writeln!(w, "{} {}", label, msg)?;
                }
            }
        }
        ProgressEvent::NothingFound => {
            if color.enabled() {
                writeln!(w, "{} {}", label, "no repository found".red())?;
            } else {
                writeln!(w, "{} no repository found", label)?;
            }
        }
        ProgressEvent::Assessed { url, verdict } => {
            let score = verdict
                .score
                .map(|s| format!("{:.2}", s))
                .unwrap_or_else(|| "n/a".to_string());
            let reason = truncate(&verdict.reason, 80);
            match verdict.is_meaningful {
                Meaningful::Yes => {
                    if color.enabled() {
                        writeln!(w, "{} {} {} ({})", label, "meaningful".green(), score, url)?;
                    } else {
                        writeln!(w, "{} meaningful {} ({})", label, score, url)?;
                    }
                }
                Meaningful::No => {
                    if color.enabled() {
                        writeln!(w, "{} {} {}: {}", label, "not meaningful".red(), score, reason)?;
                    } else {
                        writeln!(w, "{} not meaningful {}: {}", label, score, reason)?;
                    }
                }
                Meaningful::Unknown => {
                    if color.enabled() {
                        writeln!(w, "{} {}: {}", label, "quality unknown".yellow(), reason)?;
                    } else {
                        writeln!(w, "{} quality unknown: {}", label, reason)?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Print the header line when a paper starts.
pub fn print_paper_start(
    w: &mut dyn Write,
    label: &str,
    title: &str,
    color: ColorMode,
) -> std::io::Result<()> {
    let short = truncate(title, 70);
    if color.enabled() {
        writeln!(w, "{} {}", label.bold(), short.bold())
    } else {
        writeln!(w, "{} {}", label, short)
    }
}

/// Print the final outcome of one paper.
pub fn print_outcome(
    w: &mut dyn Write,
    label: &str,
    record: &RepoVerdictRecord,
    elapsed: Duration,
    color: ColorMode,
) -> std::io::Result<()> {
    let outcome = match (record.repo_type, record.selected_repo_url.as_deref()) {
        (Some(RepoType::Official), Some(url)) => format!("official {}", url),
        (Some(RepoType::Unofficial), Some(url)) => format!("unofficial {}", url),
        (Some(RepoType::NoneMeaningful), _) => "no meaningful repository".to_string(),
        _ => "no repository".to_string(),
    };
    let secs = format!("({:.1}s)", elapsed.as_secs_f64());
    if color.enabled() {
        let outcome = match record.repo_type {
            Some(RepoType::Official) | Some(RepoType::Unofficial) => outcome.green().to_string(),
            _ => outcome.red().to_string(),
        };
        writeln!(w, "{} done: {} {}", label, outcome, secs.dimmed())
    } else {
        writeln!(w, "{} done: {} {}", label, outcome, secs)
    }
}

/// Counters for one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub official: usize,
    pub unofficial: usize,
    pub not_found: usize,
    pub meaningful: usize,
    pub not_meaningful: usize,
    pub errors: usize,
}

impl RunStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Count a freshly written record.
    pub fn record(&mut self, record: &RepoVerdictRecord) {
        self.processed += 1;
        match record.repo_type {
            Some(RepoType::Official) => self.official += 1,
            Some(RepoType::Unofficial) => self.unofficial += 1,
            Some(RepoType::NoneFound) | Some(RepoType::NoneMeaningful) => self.not_found += 1,
            None => {}
        }
        match record.quality.is_meaningful {
            Meaningful::Yes => self.meaningful += 1,
            Meaningful::No => self.not_meaningful += 1,
            Meaningful::Unknown => {}
        }
    }

    /// Papers finished so far, whatever the outcome.
    pub fn done(&self) -> usize {
        self.processed + self.skipped + self.errors
    }

    /// Mean wall time per paper that was actually worked on. Skipped papers
    /// take no time and are left out.
    pub fn average(&self, elapsed: Duration) -> Option<Duration> {
        let worked = self.done().saturating_sub(self.skipped);
        (worked > 0).then(|| elapsed.div_f64(worked as f64))
    }

    /// Estimated time for the remaining papers.
    pub fn eta(&self, elapsed: Duration) -> Option<Duration> {
        let remaining = self.total.saturating_sub(self.done());
        self.average(elapsed)
            .map(|avg| avg.mul_f64(remaining as f64))
    }

    /// One-line status used as the progress-bar message.
    pub fn status_line(&self, elapsed: Duration) -> String {
        let mut line = format!(
            "processed {} | skipped {} | errors {}",
            self.processed, self.skipped, self.errors
        );
        if let Some(avg) = self.average(elapsed) {
            line.push_str(&format!(" | {:.1}s/paper", avg.as_secs_f64()));
        }
        if let Some(eta) = self.eta(elapsed) {
            line.push_str(&format!(" | eta {}", format_minutes(eta)));
        }
        line
    }
}

pub fn format_minutes(d: Duration) -> String {
    format!("{:.1} min", d.as_secs_f64() / 60.0)
}

pub fn print_summary(
    w: &mut dyn Write,
    stats: &RunStats,
    elapsed: Duration,
    interrupted: bool,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    let sep = "=".repeat(60);
    let title = if interrupted { "INTERRUPTED" } else { "SUMMARY" };
    if color.enabled() {
        writeln!(w, "{}", sep.bold())?;
        writeln!(w, "{}", title.bold())?;
        writeln!(w, "{}", sep.bold())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "{}", title)?;
        writeln!(w, "{}", sep)?;
    }

    writeln!(w, "  Papers: {}", stats.total)?;
    writeln!(w, "  Processed: {}", stats.processed)?;
    writeln!(w, "  Skipped (already processed): {}", stats.skipped)?;
    if stats.errors > 0 {
        if color.enabled() {
            writeln!(w, "  {} {}", "Errors:".red(), stats.errors)?;
        } else {
            writeln!(w, "  Errors: {}", stats.errors)?;
        }
    }
    writeln!(w)?;

    writeln!(w, "  Repositories:")?;
    if color.enabled() {
        writeln!(w, "    {} {}", "Official:".green(), stats.official)?;
        writeln!(w, "    {} {}", "Unofficial:".cyan(), stats.unofficial)?;
        writeln!(w, "    {} {}", "Not found:".red(), stats.not_found)?;
    } else {
        writeln!(w, "    Official: {}", stats.official)?;
        writeln!(w, "    Unofficial: {}", stats.unofficial)?;
        writeln!(w, "    Not found: {}", stats.not_found)?;
    }
    writeln!(w, "  Quality:")?;
    writeln!(w, "    Meaningful: {}", stats.meaningful)?;
    writeln!(w, "    Not meaningful: {}", stats.not_meaningful)?;
    writeln!(w)?;

    let msg = format!(
        "Total time: {:.1}s ({})",
        elapsed.as_secs_f64(),
        format_minutes(elapsed)
    );
    if color.enabled() {
        writeln!(w, "  {}", msg.dimmed())?;
    } else {
        writeln!(w, "  {}", msg)?;
    }
    if stats.processed > 0 {
        let avg = elapsed.as_secs_f64() / stats.processed as f64;
        writeln!(w, "  Average: {:.1}s per paper", avg)?;
    }
    writeln!(w)?;
    Ok(())
}

/// Result of one connectivity probe in `check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Ok(String),
    Failed(String),
    Skipped(String),
}

pub fn print_probe(
    w: &mut dyn Write,
    name: &str,
    probe: &Probe,
    color: ColorMode,
) -> std::io::Result<()> {
    match probe {
        Probe::Ok(detail) => {
            if color.enabled() {
                writeln!(w, "  {} {}: {}", "[ok]".green(), name, detail)
            } else {
                writeln!(w, "  [ok] {}: {}", name, detail)
            }
        }
        Probe::Failed(detail) => {
            if color.enabled() {
                writeln!(w, "  {} {}: {}", "[failed]".red(), name, detail)
            } else {
                writeln!(w, "  [failed] {}: {}", name, detail)
            }
        }
        Probe::Skipped(detail) => {
            if color.enabled() {
                writeln!(w, "  {} {}: {}", "[skipped]".dimmed(), name, detail)
            } else {
                writeln!(w, "  [skipped] {}: {}", name, detail)
            }
        }
    }
}

pub fn print_rate_status(
    w: &mut dyn Write,
    status: &RateStatus,
    authenticated: bool,
    color: ColorMode,
) -> std::io::Result<()> {
    let reset = i64::try_from(status.reset)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| status.reset.to_string());
    let auth = if authenticated {
        "authenticated"
    } else {
        "anonymous"
    };
    let budget = format!("{}/{}", status.remaining, status.limit);
    let low = status.remaining * 10 < status.limit;
    if color.enabled() {
        let budget = if low {
            budget.yellow().to_string()
        } else {
            budget.green().to_string()
        };
        writeln!(w, "  Rate limit ({}): {} remaining, resets {}", auth, budget, reset)
    } else {
        writeln!(w, "  Rate limit ({}): {} remaining, resets {}", auth, budget, reset)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}
