// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Path filtering, applied before events ever reach the debouncer.
//!
//! Two stages: a cheap built-in blocklist of development and system
//! noise that kills the bulk of useless kernel events, then the
//! per-watch configuration (excluded directories, patterns,
//! extension allowlist, size cap).

use std::{
    collections::BTreeSet,
    path::{Component, Path, PathBuf},
};

use lazy_static::lazy_static;

use crate::error::ConnectorError;

// Substring checks only; these run on every kernel event so they
// have to stay cheap.
const QUICK_IGNORE_FRAGMENTS: &[&str] = &[
    // version control and IDE state
    "/.git/", "/.svn/", "/.hg/", "/.bzr/", "/.vscode/", "/.idea/", "/.vs/",
    // dependency and build output trees
    "/node_modules/", "/.npm/", "/.yarn/", "/dist/", "/build/", "/.next/", "/.nuxt/",
    // python caches and venvs
    "/__pycache__/", "/.pytest_cache/", "/venv/", "/.cache/",
    // system litter and trash
    "/.DS_Store", "/Thumbs.db", "/.Spotlight-V100/", "/.Trashes/", "/.fseventsd/",
    "/.TemporaryItems/",
];

// Leaf-name suffixes for editor droppings and temp files.
const QUICK_IGNORE_SUFFIXES: &[&str] = &[".tmp", ".swp", ".bak", ".cache"];

lazy_static! {
    static ref DEFAULT_EXCLUDE_DIRS: BTreeSet<String> = [
        ".git",
        ".svn",
        ".hg",
        ".bzr",
        "node_modules",
        "__pycache__",
        ".pytest_cache",
        "build",
        "dist",
        "target",
        "out",
        ".idea",
        ".vscode",
        ".vs",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
}

/// Stage one: does this path look like noise nobody wants to index?
pub fn quick_ignore(path: &str) -> bool {
    if QUICK_IGNORE_FRAGMENTS
        .iter()
        .any(|fragment| path.contains(fragment))
    {
        return true;
    }
    if QUICK_IGNORE_SUFFIXES
        .iter()
        .any(|suffix| path.ends_with(suffix))
    {
        return true;
    }

    // hidden and temporary leaf names
    if let Some(leaf) = path.rsplit('/').next() {
        if !leaf.is_empty()
            && (leaf.starts_with('.')
                || leaf.starts_with('~')
                || leaf.ends_with('~')
                || leaf.contains("~$"))
        {
            return true;
        }
    }
    false
}

/// Per-path watch rules.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Root to watch. Must exist and be a directory.
    pub path: PathBuf,
    pub recursive: bool,
    /// Allowlist of lowercased dot-prefixed extensions; empty means
    /// include everything.
    pub include_extensions: BTreeSet<String>,
    /// Simple glob patterns (`*` wildcards) or plain substrings.
    pub exclude_patterns: BTreeSet<String>,
    /// Directory names that are pruned wholesale wherever they
    /// appear under the root.
    pub exclude_directories: BTreeSet<String>,
    pub max_file_size: u64,
    pub watch_files: bool,
    pub watch_directories: bool,
}

impl WatchConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WatchConfig {
            path: path.into(),
            recursive: true,
            include_extensions: BTreeSet::new(),
            exclude_patterns: BTreeSet::new(),
            exclude_directories: DEFAULT_EXCLUDE_DIRS.clone(),
            max_file_size: 50 * 1024 * 1024,
            watch_files: true,
            watch_directories: true,
        }
    }

    /// Normalise and install the extension allowlist: lowercase,
    /// leading dot.
    pub fn set_include_extensions<I, S>(&mut self, extensions: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.include_extensions = extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.as_ref().trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .filter(|ext| ext.len() > 1)
            .collect();
    }

    pub fn validate(&self) -> Result<(), ConnectorError> {
        if !self.path.is_dir() {
            return Err(ConnectorError::InvalidPath(format!(
                "{} does not exist or is not a directory",
                self.path.display()
            )));
        }
        if self.max_file_size == 0 {
            return Err(ConnectorError::InvalidPath(String::from(
                "max_file_size must be greater than zero",
            )));
        }
        if !self.watch_files && !self.watch_directories {
            return Err(ConnectorError::InvalidPath(String::from(
                "watching neither files nor directories",
            )));
        }
        Ok(())
    }

    /// Whether an event at `path` belongs to this watch root.
    pub fn applies_to(&self, path: &Path) -> bool {
        if !path.starts_with(&self.path) {
            return false;
        }
        if self.recursive {
            return true;
        }
        path.parent() == Some(self.path.as_path())
    }

    /// Stage two: the configured rules.
    pub fn should_ignore(&self, path: &Path) -> bool {
        for component in path.components() {
            if let Component::Normal(name) = component {
                if self
                    .exclude_directories
                    .contains(&name.to_string_lossy().to_string())
                {
                    return true;
                }
            }
        }

        let path_str = path.to_string_lossy();
        if self
            .exclude_patterns
            .iter()
            .any(|pattern| matches_pattern(&path_str, pattern))
        {
            return true;
        }

        let is_dir = path.is_dir();
        if !self.include_extensions.is_empty() && !is_dir {
            let extension = path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            if !self.include_extensions.contains(&extension) {
                return true;
            }
        }

        if let Ok(meta) = path.metadata() {
            if meta.is_file() && meta.len() > self.max_file_size {
                return true;
            }
        }
        false
    }
}

/// Simple glob matching: `*` wildcards, everything else literal. A
/// pattern without wildcards is a substring check.
fn matches_pattern(path: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return path.contains(pattern);
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = path;
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(at) => {
                // no leading wildcard means the first segment anchors
                if index == 0 && at != 0 {
                    return false;
                }
                rest = &rest[at + segment.len()..];
            }
            None => return false,
        }
    }
    // no trailing wildcard means the last segment anchors at the end
    match segments.last() {
        Some(last) if !last.is_empty() => path.ends_with(last),
        _ => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quick_ignore_noise() {
        assert!(quick_ignore("/home/em/proj/.git/HEAD"));
        assert!(quick_ignore("/home/em/proj/node_modules/left-pad/index.js"));
        assert!(quick_ignore("/home/em/notes/.secret.md"));
        assert!(quick_ignore("/home/em/doc.docx~"));
        assert!(quick_ignore("/home/em/~$report.docx"));
        assert!(quick_ignore("/home/em/build.swp"));

        assert!(!quick_ignore("/home/em/notes/todo.md"));
        assert!(!quick_ignore("/home/em/catalog.txt"));
    }

    #[test]
    fn filter_chain_keeps_only_matching_extension() {
        let mut config = WatchConfig::new("/proj");
        config.set_include_extensions([".md"]);

        let survivors: Vec<&str> = ["/proj/a.md", "/proj/b.txt", "/proj/node_modules/c.md"]
            .into_iter()
            .filter(|p| !config.should_ignore(Path::new(p)))
            .collect();
        assert_eq!(survivors, vec!["/proj/a.md"]);
    }

    #[test]
    fn adding_a_pattern_never_adds_deliveries() {
        let paths = [
            "/proj/a.md",
            "/proj/b.txt",
            "/proj/sub/c.rs",
            "/proj/data.tmp",
        ];

        let mut config = WatchConfig::new("/proj");
        let before: Vec<&str> = paths
            .into_iter()
            .filter(|p| !config.should_ignore(Path::new(p)))
            .collect();

        config.exclude_patterns.insert(String::from("*.tmp"));
        config.exclude_patterns.insert(String::from("sub"));
        let after: Vec<&str> = paths
            .into_iter()
            .filter(|p| !config.should_ignore(Path::new(p)))
            .collect();

        assert!(after.iter().all(|p| before.contains(p)));
        assert!(after.len() < before.len());
    }

    #[test]
    fn extension_normalisation() {
        let mut config = WatchConfig::new("/proj");
        config.set_include_extensions(["MD", ".Txt", " rs "]);
        assert!(config.include_extensions.contains(".md"));
        assert!(config.include_extensions.contains(".txt"));
        assert!(config.include_extensions.contains(".rs"));
        assert_eq!(config.include_extensions.len(), 3);

        assert!(!config.should_ignore(Path::new("/proj/README.MD")));
    }

    #[test]
    fn glob_patterns() {
        assert!(matches_pattern("/p/cache.tmp", "*.tmp"));
        assert!(!matches_pattern("/p/cache.tmp.old", "*.tmp"));
        assert!(matches_pattern("/p/logs/app.log", "*/logs/*"));
        assert!(matches_pattern("/p/a/b", "a"));
        assert!(!matches_pattern("/p/a/b", "c"));
        assert!(matches_pattern("abc", "a*c"));
        assert!(!matches_pattern("abx", "a*c"));
    }

    #[test]
    fn excluded_directory_component_prunes() {
        let config = WatchConfig::new("/proj");
        assert!(config.should_ignore(Path::new("/proj/target/debug/out.rs")));
        assert!(config.should_ignore(Path::new("/proj/__pycache__/m.pyc")));
        assert!(!config.should_ignore(Path::new("/proj/src/main.rs")));
    }

    #[test]
    fn oversized_file_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let big = tmp.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 2048]).unwrap();

        let mut config = WatchConfig::new(tmp.path());
        config.max_file_size = 1024;
        assert!(config.should_ignore(&big));

        config.max_file_size = 4096;
        assert!(!config.should_ignore(&big));
    }

    #[test]
    fn validation() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(WatchConfig::new(tmp.path()).validate().is_ok());

        assert!(WatchConfig::new("/no/such/dir/here").validate().is_err());

        let mut bad_size = WatchConfig::new(tmp.path());
        bad_size.max_file_size = 0;
        assert!(bad_size.validate().is_err());

        let mut nothing = WatchConfig::new(tmp.path());
        nothing.watch_files = false;
        nothing.watch_directories = false;
        assert!(nothing.validate().is_err());
    }

    #[test]
    fn non_recursive_scope() {
        let mut config = WatchConfig::new("/proj");
        config.recursive = false;
        assert!(config.applies_to(Path::new("/proj/a.md")));
        assert!(!config.applies_to(Path::new("/proj/sub/a.md")));
        assert!(!config.applies_to(Path::new("/other/a.md")));

        config.recursive = true;
        assert!(config.applies_to(Path::new("/proj/sub/a.md")));
    }
}
