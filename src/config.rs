use image::{imageops::FilterType, ImageFormat};
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub trait Validatable {
    fn get_path(&self) -> PathBuf;
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub server: ServerConfig,
    pub artifact: ArtifactConfig,
    pub model: ModelConfig,
    pub labels: LabelsConfig,
    #[serde(default)]
    pub image: ImageConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where the split model archive lives and where it gets rebuilt.
#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactConfig {
    pub fragments_dir: PathBuf,
    pub base_name: String,
    #[serde(default = "default_fragment_marker")]
    pub fragment_marker: String,
    pub output_path: PathBuf,
    /// Number of fragments the split produced.
    pub expected_fragments: usize,
    /// Index of the first numeric suffix: 0 for `split -d`, 1 for tools
    /// that count from one. Alphabetic suffixes always start at `a..a`.
    #[serde(default)]
    pub numeric_start: u64,
}

fn default_fragment_marker() -> String {
    ".part".to_string()
}

impl Validatable for ArtifactConfig {
    fn get_path(&self) -> PathBuf {
        self.output_path.clone()
    }

    fn validate(&self) -> Result<(), String> {
        if self.base_name.trim().is_empty() {
            return Err("artifact.base_name must not be empty".to_string());
        }
        if self.fragment_marker.is_empty() {
            return Err("artifact.fragment_marker must not be empty".to_string());
        }
        if self.expected_fragments == 0 {
            return Err("artifact.expected_fragments must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub layout: TensorLayout,
    #[serde(default)]
    pub filter: ResizeFilter,
    #[serde(default)]
    pub apply_softmax: bool,
    #[serde(default)]
    pub preload: bool,
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_input_size() -> u32 {
    224
}

fn default_load_timeout_secs() -> u64 {
    120
}

impl ModelConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_instances == 0 {
            return Err("model.num_instances must be at least 1".to_string());
        }
        if self.input_size == 0 {
            return Err("model.input_size must be at least 1".to_string());
        }
        if self.load_timeout_secs == 0 {
            return Err("model.load_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Nhwc,
    Nchw,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelsConfig {
    pub labels_file: String,
    pub labels_dir: PathBuf,
}

impl Validatable for LabelsConfig {
    fn get_path(&self) -> PathBuf {
        self.labels_dir.join(&self.labels_file)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Labels file not found: {:?}", self.get_path()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_supported_formats")]
    pub supported_formats: Vec<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            supported_formats: default_supported_formats(),
        }
    }
}

fn default_supported_formats() -> Vec<String> {
    vec!["png".to_string(), "jpeg".to_string()]
}

impl ImageConfig {
    pub fn formats(&self) -> Result<Vec<ImageFormat>, String> {
        self.supported_formats
            .iter()
            .map(|name| {
                ImageFormat::from_extension(name.to_lowercase())
                    .ok_or_else(|| format!("{} is not a known image format", name))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    load_configuration(&configuration_directory, environment)
}

pub fn load_configuration(
    configuration_directory: &Path,
    environment: Environment,
) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = settings.try_deserialize::<Config>()?;

    let checks = [
        config.artifact.validate(),
        config.model.validate(),
        config.labels.validate(),
        config.image.formats().map(|_| ()),
    ];
    for check in checks {
        if let Err(e) = check {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const BASE: &str = r#"
log_level: info
server:
  host: 127.0.0.1
  port: 8000
artifact:
  fragments_dir: model
  base_name: skin_lesion.onnx.zip
  output_path: model/skin_lesion.onnx.zip
  expected_fragments: 3
model:
  num_instances: 2
  input_size: 224
labels:
  labels_file: labels.txt
  labels_dir: LABELS_DIR
"#;

    fn write_config_dir(base: &str, local: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("labels.txt"), "nevus\nmelanoma\n").unwrap();
        let base = base.replace("LABELS_DIR", &dir.path().display().to_string());
        fs::write(dir.path().join("base.yaml"), base).unwrap();
        if let Some(local) = local {
            fs::write(dir.path().join("local.yaml"), local).unwrap();
        }
        dir
    }

    #[test]
    fn test_load_configuration_applies_defaults() {
        let dir = write_config_dir(BASE, None);
        let config = load_configuration(dir.path(), Environment::Local).unwrap();

        assert_eq!(config.server.get_address(), "127.0.0.1:8000");
        assert_eq!(config.server.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(config.artifact.fragment_marker, ".part");
        assert_eq!(config.artifact.expected_fragments, 3);
        assert_eq!(config.artifact.numeric_start, 0);
        assert_eq!(config.model.layout, TensorLayout::Nhwc);
        assert_eq!(config.model.filter, ResizeFilter::Triangle);
        assert!(!config.model.apply_softmax);
        assert_eq!(
            config.image.formats().unwrap(),
            vec![ImageFormat::Png, ImageFormat::Jpeg]
        );
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let local = r#"
log_level: debug
model:
  layout: nchw
  filter: catmullrom
  preload: true
"#;
        let dir = write_config_dir(BASE, Some(local));
        let config = load_configuration(dir.path(), Environment::Local).unwrap();

        assert_eq!(config.log_level.as_str(), "debug");
        assert_eq!(config.model.layout, TensorLayout::Nchw);
        assert_eq!(config.model.filter, ResizeFilter::CatmullRom);
        assert!(config.model.preload);
        assert_eq!(config.model.num_instances, 2);
    }

    #[test]
    fn test_zero_instances_is_rejected() {
        let local = "model:\n  num_instances: 0\n";
        let dir = write_config_dir(BASE, Some(local));

        assert!(load_configuration(dir.path(), Environment::Local).is_err());
    }

    #[test]
    fn test_fragment_count_is_required() {
        let dir = write_config_dir(&BASE.replace("  expected_fragments: 3\n", ""), None);

        assert!(load_configuration(dir.path(), Environment::Local).is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert!(Environment::try_from("Production".to_string()).is_ok());
        assert!(Environment::try_from("staging".to_string()).is_err());
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }
}
