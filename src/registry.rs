use crate::schema::{ParameterSchema, TaskConfig};
use crate::util::display_name;
use anyhow::Context;
use pulldown_cmark::{html, Parser};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_SCRIPT_EXTENSION: &str = ".py";

/// Documentation candidates, checked in this order.
const README_CANDIDATES: [&str; 4] = ["README.md", "README.txt", "readme.md", "readme.txt"];

/// One discovered task: a directory with an executable program plus
/// optional docs and parameter schema. Immutable for the lifetime of a
/// discovery pass; replaced wholesale on re-discovery.
#[derive(Debug, Clone)]
pub struct PluginDefinition {
    /// Task directory, also the working directory for runs.
    pub dir: PathBuf,
    /// Directory name; the task's identity.
    pub name: String,
    /// Operator-facing name derived from the directory name.
    pub display_name: String,
    /// Resolved executable script. None means the task is inert but still
    /// listed, so the presentation layer can show it as "not found".
    pub script: Option<PathBuf>,
    /// Rendered documentation: HTML for Markdown sources, raw text
    /// otherwise, or a displayable error string on read failure.
    pub docs: Option<String>,
    pub config: TaskConfig,
}

impl PluginDefinition {
    pub fn is_runnable(&self) -> bool {
        self.script.is_some()
    }

    pub fn schema(&self) -> ParameterSchema {
        self.config.parameters()
    }
}

/// Discovers task definitions from the immediate subdirectories of a root.
pub struct PluginRegistry {
    root: PathBuf,
    script_extension: String,
}

impl PluginRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            script_extension: DEFAULT_SCRIPT_EXTENSION.to_string(),
        }
    }

    /// Override the task-program file extension (tests use shell scripts).
    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.script_extension = ext.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the discovery root if it does not exist yet.
    pub fn ensure_root(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create task root {:?}", self.root))
    }

    /// Discover every task under the root, ordered by directory name.
    ///
    /// A missing root yields an empty sequence; the caller decides whether
    /// to create it. Per-task problems (no script, unreadable docs,
    /// malformed config) degrade inside the definition and never abort
    /// discovery of siblings.
    pub fn discover(&self) -> Vec<PluginDefinition> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("task root {:?} not readable: {}", self.root, e);
                return Vec::new();
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort_by_key(|path| path.file_name().map(|n| n.to_os_string()));

        let plugins: Vec<PluginDefinition> =
            dirs.iter().map(|dir| self.load_plugin(dir)).collect();
        info!("discovered {} tasks under {:?}", plugins.len(), self.root);
        plugins
    }

    fn load_plugin(&self, dir: &Path) -> PluginDefinition {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let script = find_script(dir, &self.script_extension);
        if script.is_none() {
            warn!("no {} script found in {:?}", self.script_extension, dir);
        }
        PluginDefinition {
            display_name: display_name(&name),
            script,
            docs: load_docs(dir),
            config: TaskConfig::load(dir),
            dir: dir.to_path_buf(),
            name,
        }
    }
}

/// First file in directory-listing order whose name ends with the
/// task-program extension.
fn find_script(dir: &Path, extension: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .map(|entry| entry.path())
        .find(|path| {
            path.is_file()
                && path
                    .file_name()
                    .map(|n| n.to_string_lossy().ends_with(extension))
                    .unwrap_or(false)
        })
}

fn load_docs(dir: &Path) -> Option<String> {
    for candidate in README_CANDIDATES {
        let path = dir.join(candidate);
        if !path.exists() {
            continue;
        }
        let docs = match std::fs::read_to_string(&path) {
            Ok(content) if candidate.ends_with(".md") => render_markdown(&content),
            Ok(content) => content,
            // Displayed as-is rather than raised.
            Err(e) => format!("Error loading README: {}", e),
        };
        return Some(docs);
    }
    None
}

fn render_markdown(source: &str) -> String {
    let mut out = String::new();
    html::push_html(&mut out, Parser::new(source));
    out
}
