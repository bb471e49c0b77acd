//! Watch rules: which paths under the project root never trigger a restart.
//!
//! Rules are globs written relative to the project root with a leading `/`
//! (`/target/**`). `*` does not cross `/`; `**` does. A rule ending in `/**`
//! also covers the directory itself, so creating `node_modules/` is ignored
//! just like anything inside it.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::utils::path::unix_slashes;

/// Built-in rules: build output, VCS metadata, dependency directories,
/// generated assets, locale files, uploads and temp data.
pub const DEFAULT_IGNORE: &[&str] = &[
    "/target/**",
    "/.git/**",
    "/node_modules/**",
    "/lib/modules/*/public/**",
    "/public/modules/**",
    "/public/uploads/**",
    "/public/css/master-*",
    "/locales/**",
    "/data/temp/**",
];

/// Ordered, immutable set of exclusion rules anchored at a root.
#[derive(Debug, Clone)]
pub struct WatchRules {
    root: PathBuf,
    rules: Vec<String>,
    set: GlobSet,
}

impl WatchRules {
    /// Build the rule set from the defaults plus user additions.
    pub fn new(root: &Path, additions: &[String]) -> Result<Self, globset::Error> {
        let rules: Vec<String> = DEFAULT_IGNORE
            .iter()
            .map(|r| (*r).to_string())
            .chain(additions.iter().map(|r| anchor(r)))
            .collect();

        let mut builder = GlobSetBuilder::new();
        for rule in &rules {
            builder.add(GlobBuilder::new(rule).literal_separator(true).build()?);
            if let Some(dir) = rule.strip_suffix("/**").filter(|d| !d.is_empty()) {
                builder.add(GlobBuilder::new(dir).literal_separator(true).build()?);
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            rules,
            set: builder.build()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a change at `path` must be ignored.
    ///
    /// Paths outside the root are never excluded by these rules.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        let relative = format!("/{}", unix_slashes(relative));
        self.set.is_match(relative.as_str())
    }

    /// Rules rendered as absolute globs, for display.
    pub fn absolute_rules(&self) -> Vec<String> {
        let root = unix_slashes(&self.root);
        let root = root.trim_end_matches('/');
        self.rules.iter().map(|r| format!("{root}{r}")).collect()
    }
}

/// Anchor a user rule at the root (`assets/**` → `/assets/**`).
fn anchor(rule: &str) -> String {
    let rule = rule.replace('\\', "/");
    if rule.starts_with('/') {
        rule
    } else {
        format!("/{rule}")
    }
}
