//! Filter files and the filter program handed to the external tool.
//!
//! Each target may own a filter file, and one shared file applies to every
//! filtered target. Entries are stored one per line. An entry starting with
//! `+ ` or `- ` carries its own sign; any other entry is an include.
//!
//! At sync time the stored files are compiled into signed runtime files
//! which the tool reads in this order: shared, target, exclude-everything.
//! The first matching rule wins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use cloudsave_common::{Error, Result, TargetId};

const SHARED_FILTER_FILE: &str = "shared_filters.txt";
const TARGET_FILTER_DIR: &str = "filters";
const EXCLUDE_ALL_FILE: &str = "exclude_all.filter";
const EXCLUDE_ALL_RULES: &str = "- **\n";

/// Upper bound used by [`probe_sync_path`].
pub const PROBE_FILE_LIMIT: i64 = 9000;

/// Which filter file an operation addresses.
#[derive(Debug, Clone, Copy)]
pub enum FilterKind<'a> {
    /// Filters owned by one target.
    Target(&'a TargetId),
    /// Filters applied to every filtered target.
    Shared,
}

/// One rule of a filter program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRule {
    Include(String),
    Exclude(String),
}

impl FilterRule {
    /// Parse a stored entry. Unsigned entries are includes.
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        if let Some(pattern) = entry.strip_prefix("- ") {
            FilterRule::Exclude(pattern.trim().to_string())
        } else if let Some(pattern) = entry.strip_prefix("+ ") {
            FilterRule::Include(pattern.trim().to_string())
        } else {
            FilterRule::Include(entry.to_string())
        }
    }

    pub fn is_include(&self) -> bool {
        matches!(self, FilterRule::Include(_))
    }

    /// Line in the tool's filter syntax.
    pub fn render(&self) -> String {
        match self {
            FilterRule::Include(p) => format!("+ {}", p),
            FilterRule::Exclude(p) => format!("- {}", p),
        }
    }
}

/// Runtime filter files for one invocation, in precedence order.
#[derive(Debug, Clone)]
pub struct CompiledFilters {
    pub shared: PathBuf,
    pub target: PathBuf,
    pub exclude_all: PathBuf,
}

impl CompiledFilters {
    /// Paths in the order the tool must read them.
    pub fn in_order(&self) -> [&Path; 3] {
        [&self.shared, &self.target, &self.exclude_all]
    }
}

/// Reads, writes and compiles filter files.
#[derive(Debug, Clone)]
pub struct FilterStore {
    settings_dir: PathBuf,
    runtime_dir: PathBuf,
}

impl FilterStore {
    pub fn new(settings_dir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_dir: settings_dir.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Location of a stored filter file.
    pub fn path(&self, kind: FilterKind<'_>) -> PathBuf {
        match kind {
            FilterKind::Shared => self.settings_dir.join(SHARED_FILTER_FILE),
            FilterKind::Target(id) => self
                .settings_dir
                .join(TARGET_FILTER_DIR)
                .join(format!("{}.txt", id.as_str())),
        }
    }

    /// Read a filter file as trimmed, non-empty, de-duplicated lines in file
    /// order. A missing file reads as an empty list.
    pub async fn read(&self, kind: FilterKind<'_>) -> Result<Vec<String>> {
        let path = self.path(kind);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(normalize(content.lines()))
    }

    /// Replace a filter file. An empty list deletes the file, so "no filter"
    /// stays distinguishable from "empty filter".
    ///
    /// # Errors
    /// - An entry contains an embedded newline
    pub async fn write(&self, kind: FilterKind<'_>, lines: &[String]) -> Result<()> {
        if let Some(bad) = lines.iter().find(|l| l.trim().contains(['\n', '\r'])) {
            return Err(Error::Config(format!(
                "Filter entry contains a newline: {:?}",
                bad
            )));
        }

        let path = self.path(kind);
        let lines = normalize(lines.iter().map(String::as_str));

        if lines.is_empty() {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("Removed filter file {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&path, content).await?;
        debug!("Wrote {} filter entries to {}", lines.len(), path.display());
        Ok(())
    }

    /// Whether the target's stored filters contain at least one include.
    pub async fn has_includes(&self, id: &TargetId) -> Result<bool> {
        let lines = self.read(FilterKind::Target(id)).await?;
        Ok(lines.iter().any(|l| FilterRule::parse(l).is_include()))
    }

    /// Ids of targets that currently have a filter file.
    pub async fn targets_with_filters(&self) -> Result<Vec<TargetId>> {
        let dir = self.settings_dir.join(TARGET_FILTER_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match TargetId::parse(stem) {
                Ok(id) => ids.push(id),
                Err(_) => debug!("Ignoring stray filter file {}", path.display()),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Compile the stored filters for `id` into runtime files.
    ///
    /// All three files live in the target's own runtime directory. Only one
    /// sync per target runs at a time, so no other invocation rewrites them
    /// while the tool reads them.
    pub async fn compile(&self, id: &TargetId) -> Result<CompiledFilters> {
        let dir = self.runtime_dir.join(id.as_str());
        fs::create_dir_all(&dir).await?;

        let shared = dir.join("shared.filter");
        let target = dir.join("target.filter");
        let exclude_all = dir.join(EXCLUDE_ALL_FILE);

        fs::write(&shared, render(&self.read(FilterKind::Shared).await?)).await?;
        fs::write(&target, render(&self.read(FilterKind::Target(id)).await?)).await?;
        fs::write(&exclude_all, EXCLUDE_ALL_RULES).await?;

        Ok(CompiledFilters {
            shared,
            target,
            exclude_all,
        })
    }
}

fn normalize<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    lines
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.to_string()))
        .map(String::from)
        .collect()
}

fn render(lines: &[String]) -> String {
    lines
        .iter()
        .map(|l| FilterRule::parse(l).render() + "\n")
        .collect()
}

/// Report how much of the filesystem a filter entry would cover.
///
/// `dir/**` counts files recursively, `dir/*` counts the files directly in
/// `dir`, anything else is 1 for an existing file and 0 otherwise. Counting
/// stops at [`PROBE_FILE_LIMIT`] and returns -1.
///
/// # Errors
/// - `pattern` lies outside `sync_root`
pub fn probe_sync_path(sync_root: &str, pattern: &str) -> Result<i64> {
    if !pattern.starts_with(sync_root) {
        return Err(Error::InvalidTarget(format!(
            "Selection is outside of sync root: {}",
            pattern
        )));
    }

    let (dir, max_depth) = if let Some(dir) = pattern.strip_suffix("/**") {
        (dir, usize::MAX)
    } else if let Some(dir) = pattern.strip_suffix("/*") {
        (dir, 1)
    } else {
        return Ok(i64::from(Path::new(pattern).is_file()));
    };

    // Follows symlinks like the sync itself; loops surface as errors and are skipped.
    let files = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry under {}: {}", dir, e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file());

    let mut count = 0i64;
    for _ in files {
        count += 1;
        if count > PROBE_FILE_LIMIT {
            return Ok(-1);
        }
    }
    Ok(count)
}
