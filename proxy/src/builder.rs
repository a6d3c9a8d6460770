use std::sync::Arc;

use error_stack::{Report, ResultExt};

use crate::{
    config::{ProxyConfig, BROWSER_USER_AGENT, CREDENTIAL_ENV_PREFIX},
    credentials::{Credential, CredentialPool},
    database::{memory::InMemoryMetricsStore, sqlite::SqliteMetricsStore, SharedMetricsStore},
    visibility::ModelVisibility,
    Error, Proxy,
};

/// Configure and build a [Proxy].
#[derive(Default)]
pub struct ProxyBuilder {
    config: ProxyConfig,
    credentials: Vec<(String, String)>,
    client: Option<reqwest::Client>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
            credentials: Vec::new(),
            client: None,
        }
    }

    pub fn with_config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Load configuration from a TOML file.
    pub async fn with_config_from_path(
        mut self,
        path: &std::path::Path,
    ) -> Result<Self, Report<Error>> {
        let data = tokio::fs::read_to_string(path)
            .await
            .change_context(Error::ReadingConfig)
            .attach_printable_lazy(|| path.display().to_string())?;
        self.config = toml::from_str(&data)
            .change_context(Error::ReadingConfig)
            .attach_printable_lazy(|| path.display().to_string())?;
        Ok(self)
    }

    /// Add one raw credential blob under a label. The label shows up in logs
    /// and credential usage breakdowns.
    pub fn with_credential(mut self, label: impl Into<String>, raw: impl Into<String>) -> Self {
        self.credentials.push((label.into(), raw.into()));
        self
    }

    /// Read credentials from `SMITHERY_COOKIE_1`, `SMITHERY_COOKIE_2`, ...
    /// stopping at the first gap in the numbering.
    pub fn with_credentials_from_env(mut self) -> Self {
        for i in 1.. {
            let name = format!("{CREDENTIAL_ENV_PREFIX}{i}");
            match std::env::var(&name) {
                Ok(raw) if !raw.trim().is_empty() => self.credentials.push((name, raw)),
                _ => break,
            }
        }
        self
    }

    /// Use a preconfigured HTTP client instead of building one from the
    /// configuration.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub async fn build(self) -> Result<Proxy, Report<Error>> {
        let Self {
            config,
            credentials,
            client,
        } = self;

        let parsed: Vec<Credential> = credentials
            .iter()
            .filter_map(|(label, raw)| match Credential::from_json(raw, label) {
                Ok(credential) => Some(credential),
                Err(e) => {
                    tracing::warn!(credential = %label, error = ?e, "Skipping unparseable credential");
                    None
                }
            })
            .collect();

        let pool = CredentialPool::new(parsed)?;
        tracing::info!(credentials = pool.len(), "Loaded credential pool");

        let client = match client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .user_agent(config.user_agent.as_deref().unwrap_or(BROWSER_USER_AGENT))
                .timeout(config.request_timeout())
                .build()
                .change_context(Error::ReadingConfig)?,
        };

        let metrics: SharedMetricsStore = match &config.metrics_db_path {
            Some(path) => {
                tracing::info!(path, "Using SQLite metrics store");
                Arc::new(SqliteMetricsStore::new(path).await?)
            }
            None => Arc::new(InMemoryMetricsStore::new(
                config.metrics_max_in_memory_records,
            )),
        };

        let visibility = ModelVisibility::new(
            config.known_models.clone(),
            &config.hidden_models,
            config.visibility_path.clone(),
        );

        Ok(Proxy {
            pool,
            client,
            metrics,
            visibility,
            chat_url: config.chat_url,
            system_prompt: config.system_prompt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOB: &str = r#"{"access_token": "tok", "expires_at": 123}"#;

    #[tokio::test]
    async fn build_with_in_memory_metrics() {
        let config = crate::config::ProxyConfig {
            visibility_path: None,
            ..Default::default()
        };
        let proxy = ProxyBuilder::new()
            .with_config(config)
            .with_credential("COOKIE_1", BLOB)
            .build()
            .await
            .unwrap();
        assert_eq!(proxy.credentials().len(), 1);
        assert!(proxy.visibility().is_hidden("gemini-2.5-pro"));
    }

    #[tokio::test]
    async fn invalid_credentials_are_skipped() {
        let config = crate::config::ProxyConfig {
            visibility_path: None,
            ..Default::default()
        };
        let proxy = ProxyBuilder::new()
            .with_config(config)
            .with_credential("COOKIE_1", "not json")
            .with_credential("COOKIE_2", BLOB)
            .build()
            .await
            .unwrap();
        assert_eq!(proxy.credentials().len(), 1);
        assert_eq!(proxy.credentials()[0].name(), "COOKIE_2");
    }

    #[tokio::test]
    async fn no_credentials_fails() {
        let result = ProxyBuilder::new().build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn config_file_round_trip() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "chat_url = \"http://localhost:1/api/chat\"\n").unwrap();

        let builder = ProxyBuilder::new()
            .with_config_from_path(&path)
            .await
            .unwrap();
        assert_eq!(builder.config.chat_url, "http://localhost:1/api/chat");

        let missing = ProxyBuilder::new()
            .with_config_from_path(&dir.path().join("missing.toml"))
            .await;
        assert!(missing.is_err());
    }
}
