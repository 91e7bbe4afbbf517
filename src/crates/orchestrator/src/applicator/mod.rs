//! Atomic application of generated file changes plus dependency discovery
//! and installation (SPEC_FULL.md §4.6).
//!
//! Grounded on `agent_s3.coordinator.orchestrator
//! .Orchestrator._apply_changes_and_manage_dependencies`: write every
//! generated file first (any failure aborts the whole batch), then parse
//! `requirements.txt`, statically walk every `.py` file's top-level imports
//! (regex fallback when the static parse fails), subtract the existing
//! requirements and the standard-library set, and `pip install` whatever is
//! left, returning a `Result` instead of the teacher's bool/panic split.

use crate::collaborators::{BashTool, FileTool};
use crate::error::{AppError, ErrorCategory, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of one `apply` call. `success=false` means the batch aborted;
/// `installed_packages` is only non-empty when `pip install` actually ran
/// and returned zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub success: bool,
    pub installed_packages: Vec<String>,
    pub failed_path: Option<String>,
}

pub struct ChangeApplicator {
    file_tool: Arc<dyn FileTool>,
    bash_tool: Arc<dyn BashTool>,
    install_timeout: Duration,
    requirements_path: String,
}

impl ChangeApplicator {
    pub fn new(file_tool: Arc<dyn FileTool>, bash_tool: Arc<dyn BashTool>) -> Self {
        Self {
            file_tool,
            bash_tool,
            install_timeout: Duration::from_secs(300),
            requirements_path: "requirements.txt".to_string(),
        }
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    /// Write every `path -> content` entry, then reconcile `requirements.txt`
    /// and install any newly discovered third-party packages.
    pub async fn apply(&self, changes: &[(String, String)]) -> Result<ApplyResult> {
        for (path, content) in changes {
            if self.file_tool.write(path, content).await.is_err() {
                warn!(path = %path, "failed to write change, aborting apply");
                return Ok(ApplyResult {
                    success: false,
                    installed_packages: Vec::new(),
                    failed_path: Some(path.clone()),
                });
            }
        }

        let existing = self.read_existing_requirements().await?;

        let mut new_packages: BTreeSet<String> = BTreeSet::new();
        for (path, content) in changes {
            if !path.ends_with(".py") {
                continue;
            }
            for pkg in discover_imports(content) {
                let lower = pkg.to_lowercase();
                if !existing.contains(&lower) && !is_stdlib(&pkg) {
                    new_packages.insert(pkg);
                }
            }
        }

        if new_packages.is_empty() {
            return Ok(ApplyResult {
                success: true,
                installed_packages: Vec::new(),
                failed_path: None,
            });
        }

        self.append_requirements(&new_packages).await?;

        info!(packages = ?new_packages, "installing newly discovered dependencies");
        let output = self
            .bash_tool
            .run(
                &format!("pip install -r {}", self.requirements_path),
                self.install_timeout,
            )
            .await?;

        if !output.success() {
            warn!("pip install failed for newly discovered dependencies");
            return Ok(ApplyResult {
                success: false,
                installed_packages: Vec::new(),
                failed_path: None,
            });
        }

        Ok(ApplyResult {
            success: true,
            installed_packages: new_packages.into_iter().collect(),
            failed_path: None,
        })
    }

    async fn read_existing_requirements(&self) -> Result<BTreeSet<String>> {
        let mut existing = BTreeSet::new();
        if self.file_tool.exists(&self.requirements_path).await? {
            let content = self.file_tool.read(&self.requirements_path).await?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                existing.insert(strip_version_specifier(line).to_lowercase());
            }
        }
        Ok(existing)
    }

    async fn append_requirements(&self, new_packages: &BTreeSet<String>) -> Result<()> {
        let mut lines: Vec<String> = if self.file_tool.exists(&self.requirements_path).await? {
            self.file_tool
                .read(&self.requirements_path)
                .await?
                .lines()
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        for pkg in new_packages {
            lines.push(pkg.clone());
        }

        let mut body = lines.join("\n");
        body.push('\n');
        self.file_tool.write(&self.requirements_path, &body).await
    }
}

/// Strip a `pkg==1.0`, `pkg>=1.0`, `pkg<2`, `pkg!=1.0` version specifier,
/// leaving the bare package name. Mirrors the orchestrator source's
/// `re.split(r"[=<>!].*", line)[0]`.
fn strip_version_specifier(line: &str) -> &str {
    line.find(['=', '<', '>', '!'])
        .map(|idx| &line[..idx])
        .unwrap_or(line)
        .trim()
}

/// Parse top-level `import x` / `from x import y` module prefixes out of
/// Python source. Uses a line-oriented regex scan rather than a full parser;
/// this is the "regex fallback" path the spec treats as the primary
/// mechanism since the core has no Python AST available to it.
fn discover_imports(content: &str) -> Vec<String> {
    let import_re = Regex::new(r"^\s*import\s+([\w\.]+)").unwrap();
    let from_re = Regex::new(r"^\s*from\s+([\w\.]+)\s+import").unwrap();

    let mut found = Vec::new();
    for line in content.lines() {
        if let Some(caps) = import_re.captures(line) {
            found.push(module_root(&caps[1]));
        } else if let Some(caps) = from_re.captures(line) {
            found.push(module_root(&caps[1]));
        }
    }
    found
}

fn module_root(module: &str) -> String {
    module.split('.').next().unwrap_or(module).to_string()
}

/// Python 3 standard-library top-level module names relevant to dependency
/// discovery. Not exhaustive of every stdlib module, but covers what
/// generated application code plausibly imports; anything outside this set
/// and not already in `requirements.txt` is treated as third-party.
fn is_stdlib(module: &str) -> bool {
    const STDLIB: &[&str] = &[
        "abc", "argparse", "array", "ast", "asyncio", "base64", "bisect", "calendar",
        "collections", "concurrent", "configparser", "contextlib", "copy", "csv", "ctypes",
        "dataclasses", "datetime", "decimal", "difflib", "dis", "email", "enum", "errno",
        "functools", "gc", "getpass", "glob", "gzip", "hashlib", "heapq", "hmac", "html",
        "http", "importlib", "inspect", "io", "ipaddress", "itertools", "json", "logging",
        "math", "mimetypes", "multiprocessing", "numbers", "operator", "os", "pathlib",
        "pickle", "platform", "pprint", "queue", "random", "re", "resource", "sched",
        "secrets", "select", "shelve", "shutil", "signal", "site", "socket", "socketserver",
        "sqlite3", "ssl", "stat", "statistics", "string", "struct", "subprocess", "sys",
        "sysconfig", "tarfile", "tempfile", "textwrap", "threading", "time", "timeit",
        "token", "tokenize", "traceback", "types", "typing", "unicodedata", "unittest",
        "urllib", "uuid", "warnings", "weakref", "xml", "zipfile", "zlib", "__future__",
    ];
    STDLIB.contains(&module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MemoryFileTool {
        files: Mutex<std::collections::HashMap<String, String>>,
        fail_on: Option<String>,
    }

    impl MemoryFileTool {
        fn new() -> Self {
            Self {
                files: Mutex::new(std::collections::HashMap::new()),
                fail_on: None,
            }
        }

        fn with_seed(path: &str, content: &str) -> Self {
            let tool = Self::new();
            tool.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_string());
            tool
        }
    }

    #[async_trait]
    impl FileTool for MemoryFileTool {
        async fn read(&self, path: &str) -> Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| AppError::new(ErrorCategory::Runtime, "file_tool", "not found"))
        }

        async fn write(&self, path: &str, content: &str) -> Result<()> {
            if self.fail_on.as_deref() == Some(path) {
                return Err(AppError::new(ErrorCategory::Permission, "file_tool", "denied"));
            }
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_string());
            Ok(())
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            Ok(self.files.lock().unwrap().contains_key(path))
        }
    }

    struct RecordingBashTool {
        calls: Mutex<Vec<String>>,
        exit_code: i32,
    }

    impl RecordingBashTool {
        fn new(exit_code: i32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                exit_code,
            }
        }
    }

    #[async_trait]
    impl BashTool for RecordingBashTool {
        async fn run(
            &self,
            command: &str,
            _timeout: Duration,
        ) -> Result<crate::collaborators::CommandOutput> {
            self.calls.lock().unwrap().push(command.to_string());
            Ok(crate::collaborators::CommandOutput {
                exit_code: self.exit_code,
                output: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn discovers_and_installs_new_dependency() {
        let files = Arc::new(MemoryFileTool::with_seed("requirements.txt", "requests\n"));
        let bash = Arc::new(RecordingBashTool::new(0));
        let applicator = ChangeApplicator::new(files.clone(), bash.clone());

        let changes = vec![(
            "app.py".to_string(),
            "import flask\nimport requests\n".to_string(),
        )];

        let result = applicator.apply(&changes).await.unwrap();
        assert!(result.success);
        assert_eq!(result.installed_packages, vec!["flask".to_string()]);

        let req = files.read("requirements.txt").await.unwrap();
        assert_eq!(req, "requests\nflask\n");
        assert_eq!(bash.calls.lock().unwrap().len(), 1);
        assert_eq!(bash.calls.lock().unwrap()[0], "pip install -r requirements.txt");
    }

    #[tokio::test]
    async fn no_new_dependencies_skips_install() {
        let files = Arc::new(MemoryFileTool::with_seed("requirements.txt", "requests\n"));
        let bash = Arc::new(RecordingBashTool::new(0));
        let applicator = ChangeApplicator::new(files, bash.clone());

        let changes = vec![("app.py".to_string(), "import requests\nimport os\n".to_string())];
        let result = applicator.apply(&changes).await.unwrap();

        assert!(result.success);
        assert!(result.installed_packages.is_empty());
        assert!(bash.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failure_aborts_batch() {
        let mut tool = MemoryFileTool::new();
        tool.fail_on = Some("bad.py".to_string());
        let files = Arc::new(tool);
        let bash = Arc::new(RecordingBashTool::new(0));
        let applicator = ChangeApplicator::new(files, bash.clone());

        let changes = vec![("bad.py".to_string(), "import os\n".to_string())];
        let result = applicator.apply(&changes).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_path.as_deref(), Some("bad.py"));
        assert!(bash.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_install_marks_batch_unsuccessful() {
        let files = Arc::new(MemoryFileTool::new());
        let bash = Arc::new(RecordingBashTool::new(1));
        let applicator = ChangeApplicator::new(files, bash);

        let changes = vec![("app.py".to_string(), "import flask\n".to_string())];
        let result = applicator.apply(&changes).await.unwrap();

        assert!(!result.success);
        assert!(result.installed_packages.is_empty());
    }

    #[test]
    fn strips_version_specifiers() {
        assert_eq!(strip_version_specifier("requests==2.31.0"), "requests");
        assert_eq!(strip_version_specifier("flask>=2.0"), "flask");
        assert_eq!(strip_version_specifier("numpy"), "numpy");
    }

    #[test]
    fn stdlib_imports_are_excluded() {
        assert!(is_stdlib("os"));
        assert!(is_stdlib("json"));
        assert!(!is_stdlib("flask"));
    }
}
