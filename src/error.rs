use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Payload error: {0}")]
    Payload(String),
    #[error("Sink error: {0}")]
    Sink(String),
    #[error("{unit} failed during {stage}: {source}")]
    Unit {
        unit: String,
        stage: &'static str,
        #[source]
        source: Box<AppError>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Wrap an error with the unit and processing stage it came from.
    pub fn in_unit(self, unit: impl Into<String>, stage: &'static str) -> Self {
        AppError::Unit {
            unit: unit.into(),
            stage,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
