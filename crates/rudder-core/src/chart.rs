//! Chart model and archive loading
//!
//! A chart is the packaged bundle a release is instantiated from: a
//! `Chart.yaml`, raw default values, templates and subcharts. Subcharts are
//! either unpacked under `charts/<name>/` or nested as `charts/*.tgz`.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tar::{Archive, Builder, EntryType, Header};

use crate::error::{CoreError, Result};
use crate::values::Values;

const CHART_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";
const TEMPLATES_DIR: &str = "templates/";
const CHARTS_DIR: &str = "charts/";

/// Contents of `Chart.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    pub name: String,

    /// Chart version, kept verbatim (repositories do not always publish strict semver)
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ChartDependency>,
}

fn default_api_version() -> String {
    "v2".to_string()
}

impl ChartMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            api_version: default_api_version(),
            name: name.into(),
            version: version.into(),
            app_version: None,
            description: None,
            dependencies: Vec::new(),
        }
    }

    /// Parsed semver of the chart version, when it is one
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(self.version.trim_start_matches('v')).ok()
    }
}

/// Dependency declared in `Chart.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDependency {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Comma separated value paths; the first one that resolves to a bool decides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ChartDependency {
    /// Name the subchart's values are scoped under
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn is_enabled(&self, values: &Values) -> bool {
        let Some(condition) = &self.condition else {
            return true;
        };

        for path in condition.split(',') {
            if let Some(JsonValue::Bool(enabled)) = values.get(path.trim()) {
                return *enabled;
            }
        }
        true
    }
}

/// A single template file, named by its path relative to the chart root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartTemplate {
    pub name: String,
    pub data: String,
}

impl ChartTemplate {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Base file name, e.g. `_helpers.tpl` for `templates/_helpers.tpl`
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Helper templates are loaded for imports but never rendered on their own
    pub fn is_helper(&self) -> bool {
        self.file_name().starts_with('_')
    }

    pub fn is_notes(&self) -> bool {
        self.file_name().ends_with("NOTES.txt")
    }
}

/// A loaded chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub metadata: ChartMetadata,

    pub templates: Vec<ChartTemplate>,

    /// Raw `values.yaml` text
    #[serde(default)]
    pub values: String,

    #[serde(default)]
    pub dependencies: Vec<Chart>,
}

impl Chart {
    pub fn new(metadata: ChartMetadata) -> Self {
        Self {
            metadata,
            templates: Vec::new(),
            values: String::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_template(mut self, name: impl Into<String>, data: impl Into<String>) -> Self {
        self.templates.push(ChartTemplate::new(name, data));
        self
    }

    pub fn with_values(mut self, values: impl Into<String>) -> Self {
        self.values = values.into();
        self
    }

    pub fn with_dependency(mut self, chart: Chart) -> Self {
        self.dependencies.push(chart);
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    /// Parsed default values
    pub fn default_values(&self) -> Result<Values> {
        Values::from_yaml(&self.values)
    }

    /// This chart followed by every nested subchart, depth first
    pub fn charts(&self) -> Vec<&Chart> {
        let mut out = vec![self];
        for dep in &self.dependencies {
            out.extend(dep.charts());
        }
        out
    }

    /// Subcharts enabled against `values`, paired with the name their values are scoped under
    pub fn enabled_dependencies(&self, values: &Values) -> Vec<(&str, &Chart)> {
        self.dependencies
            .iter()
            .filter_map(|chart| {
                let declared = self
                    .metadata
                    .dependencies
                    .iter()
                    .find(|dep| dep.name == chart.metadata.name);
                match declared {
                    Some(dep) if !dep.is_enabled(values) => None,
                    Some(dep) => Some((dep.effective_name(), chart)),
                    None => Some((chart.name(), chart)),
                }
            })
            .collect()
    }

    /// Load a chart from a gzip'd tar archive
    pub fn from_archive(data: &[u8]) -> Result<Self> {
        let mut archive = Archive::new(GzDecoder::new(data));
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().replace('\\', "/");
            let path = path.trim_start_matches("./").to_string();
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            files.insert(path, buf);
        }

        let root = files
            .keys()
            .filter_map(|path| path.strip_suffix("/Chart.yaml"))
            .find(|root| !root.contains('/'))
            .map(str::to_string)
            .ok_or_else(|| CoreError::Archive {
                message: "no Chart.yaml at the archive root".to_string(),
            })?;

        let prefix = format!("{root}/");
        let scoped = files
            .into_iter()
            .filter_map(|(path, data)| {
                path.strip_prefix(&prefix)
                    .map(|rest| (rest.to_string(), data))
            })
            .collect();

        Self::from_files(scoped)
    }

    /// Build a chart from files keyed by their path relative to the chart root
    pub fn from_files(files: BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let raw = files.get(CHART_FILE).ok_or_else(|| CoreError::MissingField {
            field: CHART_FILE.to_string(),
        })?;
        let metadata: ChartMetadata = serde_yaml::from_slice(raw)?;
        if metadata.name.is_empty() {
            return Err(CoreError::InvalidChart {
                message: "chart name must not be empty".to_string(),
            });
        }

        let values = match files.get(VALUES_FILE) {
            Some(data) => utf8(VALUES_FILE, data)?,
            None => String::new(),
        };

        let mut templates = Vec::new();
        let mut nested: BTreeMap<String, BTreeMap<String, Vec<u8>>> = BTreeMap::new();
        let mut dependencies = Vec::new();

        for (path, data) in &files {
            if path.starts_with(TEMPLATES_DIR) {
                templates.push(ChartTemplate::new(path.clone(), utf8(path, data)?));
            } else if let Some(rest) = path.strip_prefix(CHARTS_DIR) {
                match rest.split_once('/') {
                    Some((sub, inner)) => {
                        nested
                            .entry(sub.to_string())
                            .or_default()
                            .insert(inner.to_string(), data.clone());
                    }
                    None if rest.ends_with(".tgz") || rest.ends_with(".tar.gz") => {
                        dependencies.push(Chart::from_archive(data)?);
                    }
                    None => {}
                }
            }
        }

        for (_, sub_files) in nested {
            dependencies.push(Chart::from_files(sub_files)?);
        }

        Ok(Self {
            metadata,
            templates,
            values,
            dependencies,
        })
    }

    /// Package the chart as a gzip'd tar archive rooted at `<name>/`
    pub fn to_archive(&self) -> Result<Vec<u8>> {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let root = self.name();

        append_file(
            &mut builder,
            &format!("{root}/{CHART_FILE}"),
            serde_yaml::to_string(&self.metadata)?.as_bytes(),
        )?;
        append_file(
            &mut builder,
            &format!("{root}/{VALUES_FILE}"),
            self.values.as_bytes(),
        )?;
        for template in &self.templates {
            append_file(
                &mut builder,
                &format!("{root}/{}", template.name),
                template.data.as_bytes(),
            )?;
        }
        for dep in &self.dependencies {
            let nested = dep.to_archive()?;
            append_file(
                &mut builder,
                &format!("{root}/{CHARTS_DIR}{}-{}.tgz", dep.name(), dep.version()),
                &nested,
            )?;
        }

        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }
}

fn utf8(path: &str, data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|e| CoreError::InvalidChart {
        message: format!("{path} is not valid UTF-8: {e}"),
    })
}

fn append_file<W: std::io::Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}
