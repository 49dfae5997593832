//! Repository layout analysis.
//!
//! The root profile feeds the Stage 1 rules. The deep profile walks the
//! tree breadth-first within [`TraversalLimits`] and picks the files worth
//! showing to the model.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::hosting::{FileTreeNode, HostingService};

/// Bounds on how much of a repository the deep assessment reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalLimits {
    /// Directory levels listed, the root being level 1.
    pub max_depth: usize,
    /// Key files kept in the deep profile.
    pub max_files_to_analyze: usize,
    /// Leading lines kept from each sampled file.
    pub sample_file_lines: usize,
    /// Total tree nodes collected before the walk stops.
    pub max_nodes: usize,
    /// Key files whose content is fetched.
    pub max_sampled_files: usize,
    /// Combined character budget for all samples.
    pub sample_char_budget: usize,
    pub readme_excerpt_chars: usize,
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_files_to_analyze: 20,
            sample_file_lines: 100,
            max_nodes: 300,
            max_sampled_files: 5,
            sample_char_budget: 8000,
            readme_excerpt_chars: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalDirs {
    pub models: bool,
    pub data: bool,
    pub train: bool,
    pub test: bool,
    pub config: bool,
}

const MODEL_DIRS: &[&str] = &["models", "model", "networks", "network", "nets", "modeling", "arch", "archs"];
const DATA_DIRS: &[&str] = &["data", "dataset", "datasets", "dataloader", "data_loader", "loaders"];
const TRAIN_DIRS: &[&str] = &["train", "training", "tools", "scripts", "engine"];
const TEST_DIRS: &[&str] = &["test", "tests", "eval", "evaluation", "benchmark"];
const CONFIG_DIRS: &[&str] = &["config", "configs", "cfg", "cfgs", "options", "experiments"];

impl CanonicalDirs {
    fn mark(&mut self, dir_name: &str) {
        let lower = dir_name.to_ascii_lowercase();
        let is = |set: &[&str]| set.contains(&lower.as_str());
        self.models |= is(MODEL_DIRS);
        self.data |= is(DATA_DIRS);
        self.train |= is(TRAIN_DIRS);
        self.test |= is(TEST_DIRS);
        self.config |= is(CONFIG_DIRS);
    }

    pub fn present(&self) -> Vec<&'static str> {
        [
            (self.models, "models"),
            (self.data, "data"),
            (self.train, "train"),
            (self.test, "test"),
            (self.config, "config"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// Extended profile from the recursive walk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeepProfile {
    /// File count per lowercase extension (`""` for none).
    pub extension_histogram: BTreeMap<String, usize>,
    pub canonical_dirs: CanonicalDirs,
    /// Paths of implementation-looking code files, highest priority first.
    pub key_files: Vec<String>,
    pub total_files: usize,
    pub max_depth_reached: usize,
    /// The walk stopped at the node limit.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureProfile {
    pub code_file_count: usize,
    pub code_files: Vec<String>,
    pub non_code_file_count: usize,
    pub directory_count: usize,
    pub directories: Vec<String>,
    pub has_typical_impl_files: bool,
    pub has_typical_impl_dirs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep: Option<DeepProfile>,
}

/// Lowercased extension with its leading dot, or `""`.
fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn is_code_file(name: &str, code_extensions: &[String]) -> bool {
    let ext = extension_of(name);
    !ext.is_empty() && code_extensions.iter().any(|c| c.eq_ignore_ascii_case(&ext))
}

fn contains_ci(list: &[String], name: &str) -> bool {
    list.iter().any(|x| x.eq_ignore_ascii_case(name))
}

/// Profile of one directory listing (normally the root).
pub fn profile_root(nodes: &[FileTreeNode], config: &Config) -> StructureProfile {
    let mut profile = StructureProfile::default();
    for node in nodes {
        if node.is_dir() {
            profile.directories.push(node.name.clone());
        } else if is_code_file(&node.name, &config.code_extensions) {
            profile.code_files.push(node.name.clone());
        } else {
            profile.non_code_file_count += 1;
        }
    }
    profile.code_file_count = profile.code_files.len();
    profile.directory_count = profile.directories.len();
    profile.has_typical_impl_files = profile
        .code_files
        .iter()
        .any(|f| contains_ci(&config.typical_impl_files, f));
    profile.has_typical_impl_dirs = profile
        .directories
        .iter()
        .any(|d| contains_ci(&config.typical_impl_dirs, d));
    profile
}

/// A node found by [`walk_tree`] and its level (root entries are level 1).
#[derive(Debug, Clone, PartialEq)]
pub struct WalkedNode {
    pub node: FileTreeNode,
    pub depth: usize,
}

/// Breadth-first listing starting from the already fetched `root`.
///
/// Directories are expanded while their level is below `max_depth`; the walk
/// stops once `max_nodes` nodes are collected. Listing failures below the
/// root skip that directory.
pub async fn walk_tree(
    hosting: &dyn HostingService,
    owner: &str,
    name: &str,
    root: &[FileTreeNode],
    limits: &TraversalLimits,
) -> (Vec<WalkedNode>, bool) {
    let mut out = Vec::new();
    let mut queue = VecDeque::new();
    let mut seen_dirs = HashSet::new();
    let mut truncated = false;

    let mut push_level = |nodes: &[FileTreeNode],
                          depth: usize,
                          out: &mut Vec<WalkedNode>,
                          queue: &mut VecDeque<(String, usize)>|
     -> bool {
        for node in nodes {
            if out.len() >= limits.max_nodes {
                return false;
            }
            if node.is_dir() && depth < limits.max_depth && seen_dirs.insert(node.path.clone()) {
                queue.push_back((node.path.clone(), depth + 1));
            }
            out.push(WalkedNode {
                node: node.clone(),
                depth,
            });
        }
        true
    };

    if !push_level(root, 1, &mut out, &mut queue) {
        truncated = true;
    }

    while !truncated && let Some((path, depth)) = queue.pop_front() {
        match hosting.get_contents(owner, name, &path).await {
            Ok(children) => {
                if !push_level(&children, depth, &mut out, &mut queue) {
                    truncated = true;
                }
            }
            Err(e) => {
                tracing::debug!(repo = %format!("{owner}/{name}"), path = %path, error = %e, "skipping directory");
            }
        }
    }

    (out, truncated)
}

/// Priority of a file name: index of the first key keyword it contains.
fn key_priority(name: &str, keywords: &[String]) -> Option<usize> {
    let lower = name.to_ascii_lowercase();
    keywords
        .iter()
        .position(|k| lower.contains(&k.to_ascii_lowercase()))
}

/// Build the extended profile from a walk.
pub fn deep_profile(walked: &[WalkedNode], truncated: bool, config: &Config) -> DeepProfile {
    let mut profile = DeepProfile {
        truncated,
        ..Default::default()
    };
    let mut ranked: Vec<(usize, usize, &str)> = Vec::new();

    for w in walked {
        profile.max_depth_reached = profile.max_depth_reached.max(w.depth);
        if w.node.is_dir() {
            profile.canonical_dirs.mark(&w.node.name);
            continue;
        }
        profile.total_files += 1;
        *profile
            .extension_histogram
            .entry(extension_of(&w.node.name))
            .or_default() += 1;
        if is_code_file(&w.node.name, &config.code_extensions)
            && let Some(priority) = key_priority(&w.node.name, &config.key_file_keywords)
        {
            ranked.push((priority, w.depth, w.node.path.as_str()));
        }
    }

    ranked.sort();
    profile.key_files = ranked
        .into_iter()
        .take(config.traversal.max_files_to_analyze)
        .map(|(_, _, path)| path.to_string())
        .collect();
    profile
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSample {
    pub path: String,
    pub excerpt: String,
}

/// Fetch the leading lines of the highest-priority key files.
pub async fn sample_key_files(
    hosting: &dyn HostingService,
    owner: &str,
    name: &str,
    key_files: &[String],
    limits: &TraversalLimits,
) -> Vec<FileSample> {
    let mut samples = Vec::new();
    let mut budget = limits.sample_char_budget;

    for path in key_files.iter().take(limits.max_sampled_files) {
        if budget == 0 {
            break;
        }
        let Some(text) = hosting.get_file_text(owner, name, path).await else {
            continue;
        };
        let excerpt: String = text
            .lines()
            .take(limits.sample_file_lines)
            .collect::<Vec<_>>()
            .join("\n");
        let excerpt: String = excerpt.chars().take(budget).collect();
        budget -= excerpt.chars().count();
        samples.push(FileSample {
            path: path.clone(),
            excerpt,
        });
    }
    samples
}
