use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Config, Provider};

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api_keys: Option<ApiKeysConfig>,
    pub llm: Option<LlmSection>,
    pub hosting: Option<HostingSection>,
    pub thresholds: Option<ThresholdsSection>,
    pub traversal: Option<TraversalSection>,
    pub concurrency: Option<ConcurrencyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKeysConfig {
    pub github_token: Option<String>,
    pub llm_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmSection {
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub enabled: Option<bool>,
    /// Use the model for URL boundary extraction.
    pub extraction: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostingSection {
    pub api_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub rate_limit_delay_ms: Option<u64>,
    pub search_max_results: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdsSection {
    pub min_repo_size_kb: Option<u64>,
    pub max_abandoned_years: Option<i32>,
    pub min_stars_for_old_repo: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraversalSection {
    pub max_depth: Option<usize>,
    pub max_files_to_analyze: Option<usize>,
    pub sample_file_lines: Option<usize>,
    pub max_nodes: Option<usize>,
    pub max_sampled_files: Option<usize>,
    pub readme_excerpt_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub num_workers: Option<usize>,
    pub pdf_max_pages: Option<usize>,
}

/// Platform config directory path: `<config_dir>/repofinder/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("repofinder").join("config.toml"))
}

/// Load config by cascading CWD `.repofinder.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".repofinder.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            None
        }
    }
}

/// Field of `section` from `overlay`, falling back to `base`.
fn pick<S, T>(overlay: &Option<S>, base: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (b, o) = (&base, &overlay);
    ConfigFile {
        api_keys: Some(ApiKeysConfig {
            github_token: pick(&o.api_keys, &b.api_keys, |a| a.github_token.clone()),
            llm_api_key: pick(&o.api_keys, &b.api_keys, |a| a.llm_api_key.clone()),
        }),
        llm: Some(LlmSection {
            provider: pick(&o.llm, &b.llm, |l| l.provider.clone()),
            base_url: pick(&o.llm, &b.llm, |l| l.base_url.clone()),
            model: pick(&o.llm, &b.llm, |l| l.model.clone()),
            timeout_secs: pick(&o.llm, &b.llm, |l| l.timeout_secs),
            max_retries: pick(&o.llm, &b.llm, |l| l.max_retries),
            temperature: pick(&o.llm, &b.llm, |l| l.temperature),
            max_tokens: pick(&o.llm, &b.llm, |l| l.max_tokens),
            enabled: pick(&o.llm, &b.llm, |l| l.enabled),
            extraction: pick(&o.llm, &b.llm, |l| l.extraction),
        }),
        hosting: Some(HostingSection {
            api_url: pick(&o.hosting, &b.hosting, |h| h.api_url.clone()),
            timeout_secs: pick(&o.hosting, &b.hosting, |h| h.timeout_secs),
            max_attempts: pick(&o.hosting, &b.hosting, |h| h.max_attempts),
            rate_limit_delay_ms: pick(&o.hosting, &b.hosting, |h| h.rate_limit_delay_ms),
            search_max_results: pick(&o.hosting, &b.hosting, |h| h.search_max_results),
        }),
        thresholds: Some(ThresholdsSection {
            min_repo_size_kb: pick(&o.thresholds, &b.thresholds, |t| t.min_repo_size_kb),
            max_abandoned_years: pick(&o.thresholds, &b.thresholds, |t| t.max_abandoned_years),
            min_stars_for_old_repo: pick(&o.thresholds, &b.thresholds, |t| {
                t.min_stars_for_old_repo
            }),
        }),
        traversal: Some(TraversalSection {
            max_depth: pick(&o.traversal, &b.traversal, |t| t.max_depth),
            max_files_to_analyze: pick(&o.traversal, &b.traversal, |t| t.max_files_to_analyze),
            sample_file_lines: pick(&o.traversal, &b.traversal, |t| t.sample_file_lines),
            max_nodes: pick(&o.traversal, &b.traversal, |t| t.max_nodes),
            max_sampled_files: pick(&o.traversal, &b.traversal, |t| t.max_sampled_files),
            readme_excerpt_chars: pick(&o.traversal, &b.traversal, |t| t.readme_excerpt_chars),
        }),
        concurrency: Some(ConcurrencyConfig {
            num_workers: pick(&o.concurrency, &b.concurrency, |c| c.num_workers),
            pdf_max_pages: pick(&o.concurrency, &b.concurrency, |c| c.pdf_max_pages),
        }),
    }
}

/// Every tunable value of `config` as a file, without secrets. Used to write
/// a starting config for editing.
pub fn template_from(config: &Config) -> ConfigFile {
    ConfigFile {
        api_keys: None,
        llm: Some(LlmSection {
            provider: Some(config.llm.provider.name().to_string()),
            base_url: Some(config.llm.base_url.clone()),
            model: Some(config.llm.model.clone()),
            timeout_secs: Some(config.llm.timeout_secs),
            max_retries: Some(config.llm.max_retries),
            temperature: Some(config.llm.temperature),
            max_tokens: config.llm.max_tokens,
            enabled: Some(config.use_llm),
            extraction: Some(config.llm_extraction),
        }),
        hosting: Some(HostingSection {
            api_url: Some(config.github_api_url.clone()),
            timeout_secs: Some(config.hosting_timeout_secs),
            max_attempts: Some(config.hosting_max_attempts),
            rate_limit_delay_ms: Some(config.rate_limit_delay_ms),
            search_max_results: Some(config.search_max_results),
        }),
        thresholds: Some(ThresholdsSection {
            min_repo_size_kb: Some(config.thresholds.min_repo_size_kb),
            max_abandoned_years: Some(config.thresholds.max_abandoned_years),
            min_stars_for_old_repo: Some(config.thresholds.min_stars_for_old_repo),
        }),
        traversal: Some(TraversalSection {
            max_depth: Some(config.traversal.max_depth),
            max_files_to_analyze: Some(config.traversal.max_files_to_analyze),
            sample_file_lines: Some(config.traversal.sample_file_lines),
            max_nodes: Some(config.traversal.max_nodes),
            max_sampled_files: Some(config.traversal.max_sampled_files),
            readme_excerpt_chars: Some(config.traversal.readme_excerpt_chars),
        }),
        concurrency: Some(ConcurrencyConfig {
            num_workers: Some(config.num_workers),
            pdf_max_pages: Some(config.pdf_max_pages),
        }),
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Apply file values over `config`.
pub fn apply_to_config(file: &ConfigFile, config: &mut Config) {
    if let Some(keys) = &file.api_keys {
        set(&mut config.github_token, keys.github_token.clone().map(Some));
        set(&mut config.llm.api_key, keys.llm_api_key.clone().map(Some));
    }

    if let Some(llm) = &file.llm {
        if let Some(name) = &llm.provider {
            match name.parse::<Provider>() {
                Ok(provider) => {
                    let key = config.llm.api_key.take();
                    config.llm.switch_provider(provider);
                    config.llm.api_key = key;
                }
                Err(e) => tracing::warn!(error = %e, "ignoring [llm] provider"),
            }
        }
        set(&mut config.llm.base_url, llm.base_url.clone());
        set(&mut config.llm.model, llm.model.clone());
        set(&mut config.llm.timeout_secs, llm.timeout_secs);
        set(&mut config.llm.max_retries, llm.max_retries);
        set(&mut config.llm.temperature, llm.temperature);
        set(&mut config.llm.max_tokens, llm.max_tokens.map(Some));
        set(&mut config.use_llm, llm.enabled);
        set(&mut config.llm_extraction, llm.extraction);
    }

    if let Some(hosting) = &file.hosting {
        set(&mut config.github_api_url, hosting.api_url.clone());
        set(&mut config.hosting_timeout_secs, hosting.timeout_secs);
        set(&mut config.hosting_max_attempts, hosting.max_attempts);
        set(&mut config.rate_limit_delay_ms, hosting.rate_limit_delay_ms);
        set(&mut config.search_max_results, hosting.search_max_results);
    }

    if let Some(t) = &file.thresholds {
        set(&mut config.thresholds.min_repo_size_kb, t.min_repo_size_kb);
        set(&mut config.thresholds.max_abandoned_years, t.max_abandoned_years);
        set(&mut config.thresholds.min_stars_for_old_repo, t.min_stars_for_old_repo);
    }

    if let Some(t) = &file.traversal {
        set(&mut config.traversal.max_depth, t.max_depth);
        set(&mut config.traversal.max_files_to_analyze, t.max_files_to_analyze);
        set(&mut config.traversal.sample_file_lines, t.sample_file_lines);
        set(&mut config.traversal.max_nodes, t.max_nodes);
        set(&mut config.traversal.max_sampled_files, t.max_sampled_files);
        set(&mut config.traversal.readme_excerpt_chars, t.readme_excerpt_chars);
    }

    if let Some(c) = &file.concurrency {
        set(&mut config.num_workers, c.num_workers.map(|n| n.max(1)));
        set(&mut config.pdf_max_pages, c.pdf_max_pages);
    }
}

/// Environment variable naming the LLM provider.
pub const LLM_PROVIDER_ENV: &str = "LLM_PROVIDER";
/// Environment variable holding the GitHub token.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_API_TOKEN";

/// Apply environment values over `config`. `var` is normally
/// `|k| std::env::var(k).ok()`; empty values count as unset.
pub fn apply_env(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    let var = |k: &str| var(k).filter(|v| !v.trim().is_empty());

    if let Some(name) = var(LLM_PROVIDER_ENV) {
        match name.parse::<Provider>() {
            Ok(provider) => config.llm.switch_provider(provider),
            Err(e) => tracing::warn!(error = %e, "ignoring {LLM_PROVIDER_ENV}"),
        }
    }
    if let Some(key) = var(config.llm.provider.api_key_env()) {
        config.llm.api_key = Some(key);
    }
    if let Some(token) = var(GITHUB_TOKEN_ENV) {
        config.github_token = Some(token);
    }
}

/// Save the config to `path`, creating parent directories.
pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_toml_parses() {
        let toml_str = "[thresholds]\nmin_repo_size_kb = 20\n\n[llm]\nprovider = \"deepseek\"\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.thresholds.unwrap().min_repo_size_kb, Some(20));
        assert_eq!(parsed.llm.unwrap().provider.as_deref(), Some("deepseek"));
        assert!(parsed.hosting.is_none());
    }

    #[test]
    fn merge_overlay_wins_and_base_survives() {
        let base = ConfigFile {
            hosting: Some(HostingSection {
                timeout_secs: Some(20),
                search_max_results: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            hosting: Some(HostingSection {
                timeout_secs: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        };
        let hosting = merge(base, overlay).hosting.unwrap();
        assert_eq!(hosting.timeout_secs, Some(30));
        assert_eq!(hosting.search_max_results, Some(5));
    }

    #[test]
    fn apply_switches_provider_and_overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            [api_keys]
            llm_api_key = "sk-file"

            [llm]
            provider = "openai"
            model = "gpt-4o"
            extraction = false

            [traversal]
            max_depth = 2

            [concurrency]
            num_workers = 0
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        apply_to_config(&file, &mut config);
        assert_eq!(config.llm.provider, Provider::Openai);
        assert_eq!(config.llm.base_url, "https://api.openai.com/v1");
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-file"));
        assert!(!config.llm_extraction);
        assert_eq!(config.traversal.max_depth, 2);
        assert_eq!(config.num_workers, 1);
    }

    #[test]
    fn unknown_provider_is_ignored() {
        let file = ConfigFile {
            llm: Some(LlmSection {
                provider: Some("skynet".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut config = Config::default();
        apply_to_config(&file, &mut config);
        assert_eq!(config.llm.provider, Provider::Aliyun);
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LLM_PROVIDER", "deepseek"),
            ("DEEPSEEK_API_KEY", "sk-env"),
            ("GITHUB_API_TOKEN", ""),
        ]);
        let mut config = Config {
            github_token: Some("ghp_file".into()),
            ..Default::default()
        };
        config.llm.api_key = Some("sk-file".into());
        apply_env(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.llm.provider, Provider::Deepseek);
        assert_eq!(config.llm.model, "deepseek-chat");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-env"));
        // Empty variables do not clear file values.
        assert_eq!(config.github_token.as_deref(), Some("ghp_file"));
    }

    #[test]
    fn template_round_trips_without_secrets() {
        let mut config = Config {
            github_token: Some("ghp_secret".into()),
            ..Default::default()
        };
        config.llm.api_key = Some("sk-secret".into());
        let template = template_from(&config);
        let text = toml::to_string_pretty(&template).unwrap();
        assert!(!text.contains("secret"));

        let mut rebuilt = Config::default();
        apply_to_config(&toml::from_str(&text).unwrap(), &mut rebuilt);
        assert_eq!(rebuilt.llm.model, config.llm.model);
        assert_eq!(rebuilt.thresholds, config.thresholds);
        assert_eq!(rebuilt.traversal.max_nodes, config.traversal.max_nodes);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ConfigFile {
            thresholds: Some(ThresholdsSection {
                max_abandoned_years: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };
        save_to_path(&config, &path).unwrap();
        assert_eq!(load_from_path(&path), Some(config));
    }
}
