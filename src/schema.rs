use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Per-task configuration file name, stored inside the task directory.
pub const CONFIG_FILE: &str = "task.yaml";

const DEFAULT_INPUT_FORMATS: &str = ".csv,.xlsx,.txt";
const DEFAULT_OUTPUT_FORMAT: &str = "excel";

/// Per-task configuration document.
///
/// `parameters` holds the declarative parameter specs as a serialized JSON
/// document; a malformed blob degrades to an empty schema instead of failing
/// discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    #[serde(default = "default_input_formats")]
    pub input_formats: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_parameters")]
    pub parameters: String,
}

fn default_input_formats() -> String {
    DEFAULT_INPUT_FORMATS.to_string()
}

fn default_output_format() -> String {
    DEFAULT_OUTPUT_FORMAT.to_string()
}

fn default_parameters() -> String {
    "{}".to_string()
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            input_formats: default_input_formats(),
            output_format: default_output_format(),
            parameters: default_parameters(),
        }
    }
}

impl TaskConfig {
    /// Load the configuration for a task directory.
    ///
    /// On first access with no existing file, writes the defaults and
    /// persists them immediately. An unreadable or malformed file degrades
    /// to the defaults; it never aborts discovery.
    pub fn load(task_dir: &Path) -> Self {
        let path = task_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save(task_dir) {
                warn!("failed to write default config {:?}: {:#}", path, e);
            }
            return config;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("malformed config {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("failed to read config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Write the whole document. Used for first-time default creation.
    pub fn save(&self, task_dir: &Path) -> anyhow::Result<()> {
        let path = task_dir.join(CONFIG_FILE);
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content).with_context(|| format!("failed to write {:?}", path))?;
        Ok(())
    }

    /// Input file extensions allowed for this task.
    pub fn input_formats(&self) -> Vec<String> {
        self.input_formats
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parse the parameter blob. A malformed blob yields the empty schema.
    pub fn parameters(&self) -> ParameterSchema {
        match ParameterSchema::from_blob(&self.parameters) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("malformed parameter blob, using empty schema: {}", e);
                ParameterSchema::default()
            }
        }
    }
}

/// Rewrite only the `parameters` field of a task's config file, leaving
/// every other field in the document untouched (including fields this
/// version does not know about).
pub fn save_parameters(task_dir: &Path, schema: &ParameterSchema) -> anyhow::Result<()> {
    let path = task_dir.join(CONFIG_FILE);
    let mut doc: serde_yaml::Value = if path.exists() {
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("failed to read {:?}", path))?;
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse {:?}", path))?
    } else {
        serde_yaml::to_value(TaskConfig::default())?
    };

    let mapping = doc
        .as_mapping_mut()
        .context("config document is not a mapping")?;
    mapping.insert(
        serde_yaml::Value::String("parameters".to_string()),
        serde_yaml::Value::String(schema.to_blob()?),
    );

    let content = serde_yaml::to_string(&doc)?;
    std::fs::write(&path, content).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

/// One declared parameter: a tagged union of the four supported kinds,
/// each carrying only the data needed to render and serialize a value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterSpec {
    Text {
        #[serde(default)]
        label: String,
        #[serde(default)]
        default: String,
    },
    Choice {
        #[serde(default)]
        label: String,
        #[serde(default)]
        default: String,
        #[serde(default)]
        options: Vec<String>,
    },
    Boolean {
        #[serde(default)]
        label: String,
        #[serde(default)]
        default: bool,
    },
    #[serde(rename = "file-path")]
    FilePath {
        #[serde(default)]
        label: String,
        #[serde(default)]
        default: String,
    },
}

impl ParameterSpec {
    pub fn label(&self) -> &str {
        match self {
            ParameterSpec::Text { label, .. }
            | ParameterSpec::Choice { label, .. }
            | ParameterSpec::Boolean { label, .. }
            | ParameterSpec::FilePath { label, .. } => label,
        }
    }

    /// The value this parameter starts out with.
    pub fn default_value(&self) -> ParameterValue {
        match self {
            ParameterSpec::Text { default, .. } | ParameterSpec::Choice { default, .. } => {
                ParameterValue::Text(default.clone())
            }
            ParameterSpec::Boolean { default, .. } => ParameterValue::Boolean(*default),
            ParameterSpec::FilePath { default, .. } => {
                ParameterValue::Path(PathBuf::from(default))
            }
        }
    }
}

/// Mapping of parameter name to spec for one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    pub specs: BTreeMap<String, ParameterSpec>,
}

impl ParameterSchema {
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        let specs: BTreeMap<String, ParameterSpec> = serde_json::from_str(blob)?;
        Ok(Self { specs })
    }

    pub fn to_blob(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.specs).context("failed to serialize parameter specs")
    }

    /// Seed one value per declared parameter from its default.
    pub fn default_values(&self) -> ParameterValues {
        self.specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default_value()))
            .collect()
    }
}

/// A concrete value the operator supplied for one parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Text(String),
    Boolean(bool),
    Path(PathBuf),
}

impl ParameterValue {
    /// Realize the value as the string a child process sees in its
    /// environment: booleans become "1"/"0", everything else its text.
    pub fn env_value(&self) -> String {
        match self {
            ParameterValue::Text(s) => s.clone(),
            ParameterValue::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
            ParameterValue::Path(p) => p.to_string_lossy().to_string(),
        }
    }
}

pub type ParameterValues = BTreeMap<String, ParameterValue>;

/// Realize parameter values as environment entries keyed by the
/// upper-cased parameter name.
pub fn env_overlay(values: &ParameterValues) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(name, value)| (name.to_uppercase(), value.env_value()))
        .collect()
}
