use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub log_level: String,
    pub format: LogFormat,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        Self::from_lookup(default_service_name, default_service_version, |key| {
            env::var(key).ok()
        })
    }

    /// Same as [`TelemetryConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup<F>(
        default_service_name: &str,
        default_service_version: &str,
        lookup: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name =
            lookup("SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string());
        let service_version =
            lookup("SERVICE_VERSION").unwrap_or_else(|| default_service_version.to_string());
        let environment = lookup("DEPLOYMENT_ENV").unwrap_or_else(|| "dev".into());
        let log_level = lookup("LOG_LEVEL")
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".into());
        let format = lookup("LOG_FORMAT")
            .map(|v| match v.to_lowercase().as_str() {
                "text" | "pretty" | "plain" => LogFormat::Text,
                _ => LogFormat::Json,
            })
            .unwrap_or(LogFormat::Json);

        Self {
            service_name,
            service_version,
            environment,
            log_level,
            format,
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn json_logs(&self) -> bool {
        self.format == LogFormat::Json
    }
}
