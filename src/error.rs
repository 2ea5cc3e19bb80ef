use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Container engine errors
    #[error("External command failed: {command}")]
    ExternalCommand { command: String, stderr: String },

    // Registry errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("{0}")]
    Validation(String),

    #[error("Maximum number of sandboxes ({max}) reached for tenant '{tenant_id}'")]
    QuotaExceeded { tenant_id: String, max: usize },

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    // Directory mirror errors (logged, never surfaced to clients)
    #[error("Directory mirror error: {0}")]
    Mirror(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ManagerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// HTTP status code this error is reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthorized => 401,
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } => 409,
            Self::QuotaExceeded { .. } => 429,
            _ => 500,
        }
    }

    /// Captured diagnostic stream, if the error came from an external command.
    pub fn details(&self) -> Option<&str> {
        match self {
            Self::ExternalCommand { stderr, .. } => Some(stderr.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
