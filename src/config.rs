use std::env;
use std::fmt;
use std::path::PathBuf;

/// Startup settings for the daemon, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Workspace to open before the first request, if any.
    pub workspace: Option<PathBuf>,
    pub telemetry: TelemetryConfig,
}

impl DaemonConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let workspace = match env::var("SCOREBOOK_WORKSPACE") {
            Ok(raw) if !raw.trim().is_empty() => {
                let path = PathBuf::from(raw.trim());
                if path.exists() && !path.is_dir() {
                    return Err(ConfigError::WorkspaceNotDirectory { path });
                }
                Some(path)
            }
            _ => None,
        };

        let log_level = env::var("SCOREBOOK_LOG_LEVEL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            workspace,
            telemetry: TelemetryConfig { log_level },
        })
    }
}

/// Tracing controls. `RUST_LOG` still wins when set.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

#[derive(Debug)]
pub enum ConfigError {
    WorkspaceNotDirectory { path: PathBuf },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::WorkspaceNotDirectory { path } => write!(
                f,
                "SCOREBOOK_WORKSPACE must be a directory, got {}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
