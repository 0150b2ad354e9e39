//! Hot reload: watch a function's code directory and respawn its runner.

use crate::controller::RunnerController;
use crate::error::{CoreError, Result};
use crate::runtime::Runtime;
use async_trait::async_trait;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Quiet period before a burst of changes triggers a reload.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Something that swaps in fresh code after a change.
#[async_trait]
pub trait Reload: Send + Sync {
    /// Returns `false` when nothing was running.
    async fn reload(&self) -> Result<bool>;
}

#[async_trait]
impl Reload for RunnerController {
    async fn reload(&self) -> Result<bool> {
        self.replace().await
    }
}

/// File holding extra ignore patterns, gitignore syntax.
pub const IGNORE_FILE: &str = ".funignore";

const DEFAULT_IGNORED: [&str; 9] = [
    ".git",
    ".svn",
    ".env",
    ".DS_Store",
    "template.packaged.yml",
    ".nas.yml",
    ".fun/nas",
    ".fun/tmp",
    ".fun/package",
];

fn runtime_ignored(runtime: Runtime) -> &'static [&'static str] {
    match runtime {
        Runtime::Nodejs6 | Runtime::Nodejs8 | Runtime::Nodejs10 | Runtime::Nodejs12 => {
            &[".fun/python"]
        }
        Runtime::Python27 | Runtime::Python3 => &["node_modules"],
        Runtime::Php72 => &["node_modules", ".fun/python"],
        _ => &[],
    }
}

/// The packaging ignore rules, applied to watch events.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    root: PathBuf,
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Defaults, runtime-specific entries and `<root>/.funignore`.
    pub fn load(root: &Path, runtime: Runtime) -> Result<Self> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut builder = GitignoreBuilder::new(&root);

        for pattern in DEFAULT_IGNORED.iter().chain(runtime_ignored(runtime)) {
            builder
                .add_line(None, pattern)
                .map_err(|e| CoreError::Config(format!("bad ignore pattern {pattern:?}: {e}")))?;
        }

        let ignore_file = root.join(IGNORE_FILE);
        if ignore_file.is_file() {
            if let Some(e) = builder.add(&ignore_file) {
                tracing::warn!(file = %ignore_file.display(), error = %e, "Skipping invalid ignore rules");
            }
        }

        let matcher = builder
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build ignore rules: {e}")))?;
        Ok(Self { root, matcher })
    }

    /// Whether a change at `path` should be ignored.
    ///
    /// Paths outside the root and the root itself are ignored.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        if relative.as_os_str().is_empty() {
            return true;
        }
        self.matcher
            .matched_path_or_any_parents(relative, path.is_dir())
            .is_ignore()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Keeps a code directory watch alive. Dropping it stops watching.
#[derive(Debug)]
pub struct CodeWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl CodeWatcher {
    /// Watch `code_dir` and reload `target` after changes.
    pub fn spawn(
        code_dir: &Path,
        runtime: Runtime,
        target: Arc<dyn Reload>,
        debounce: Duration,
    ) -> Result<Self> {
        let rules = IgnoreRules::load(code_dir, runtime)?;
        let root = rules.root().to_path_buf();
        let (tx, rx) = mpsc::channel(128);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        if rules.is_ignored(&path) {
                            continue;
                        }
                        if tx.blocking_send(path).is_err() {
                            tracing::debug!("Watch channel closed");
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Watcher error"),
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        tracing::info!(dir = %root.display(), debounce_ms = debounce.as_millis() as u64, "Watching code for changes");
        let task = tokio::spawn(run_reload_loop(rx, target, debounce));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop watching.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Reload once per burst of changes.
///
/// A burst ends after `debounce` without new paths. Returns when the sender
/// side closes, flushing a pending reload first.
pub async fn run_reload_loop<R: Reload + ?Sized>(
    mut rx: mpsc::Receiver<PathBuf>,
    target: Arc<R>,
    debounce: Duration,
) {
    let mut pending: Vec<PathBuf> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            incoming = rx.recv() => match incoming {
                Some(path) => {
                    tracing::debug!(path = %path.display(), "Code change detected");
                    pending.push(path);
                    deadline = Some(Instant::now() + debounce);
                }
                None => {
                    if !pending.is_empty() {
                        reload(target.as_ref(), pending.len()).await;
                    }
                    break;
                }
            },
            _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
                deadline = None;
                let changed = std::mem::take(&mut pending).len();
                reload(target.as_ref(), changed).await;
            }
        }
    }
}

async fn reload<R: Reload + ?Sized>(target: &R, changed: usize) {
    match target.reload().await {
        Ok(true) => tracing::info!(changed, "Reloaded after code change"),
        Ok(false) => tracing::debug!(changed, "No active runner to reload"),
        Err(e) => tracing::error!(error = %e, "Failed to reload runner"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules = IgnoreRules::load(dir.path(), Runtime::Nodejs8).unwrap();
        let root = rules.root().to_path_buf();

        assert!(rules.is_ignored(&root.join(".git/HEAD")));
        assert!(rules.is_ignored(&root.join(".fun/tmp/x")));
        assert!(rules.is_ignored(&root.join(".fun/python/lib/a.py")));
        assert!(!rules.is_ignored(&root.join("index.js")));
        assert!(!rules.is_ignored(&root.join("node_modules/a/index.js")));
    }

    #[test]
    fn test_runtime_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules = IgnoreRules::load(dir.path(), Runtime::Python3).unwrap();
        let root = rules.root().to_path_buf();
        assert!(rules.is_ignored(&root.join("node_modules/a/index.js")));
        assert!(!rules.is_ignored(&root.join(".fun/python/lib/a.py")));
    }

    #[test]
    fn test_funignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "*.log\nbuild/\n").unwrap();
        let rules = IgnoreRules::load(dir.path(), Runtime::Nodejs8).unwrap();
        let root = rules.root().to_path_buf();

        assert!(rules.is_ignored(&root.join("debug.log")));
        assert!(rules.is_ignored(&root.join("build/out.js")));
        assert!(!rules.is_ignored(&root.join("src/app.js")));
    }

    #[test]
    fn test_outside_root_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let rules = IgnoreRules::load(dir.path(), Runtime::Nodejs8).unwrap();
        assert!(rules.is_ignored(Path::new("/somewhere/else.js")));
        assert!(rules.is_ignored(rules.root()));
    }
}
