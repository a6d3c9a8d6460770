use error_stack::{Report, ResultExt};
use serde::Deserialize;
use smithery_proxy::config::ProxyConfig;

use crate::{Cli, Error};

/// Server-side settings that sit alongside the proxy configuration in the
/// same TOML file.
#[derive(Deserialize, Debug, Default)]
pub struct ServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Bearer token required on every endpoint. Unset or the literal "1"
    /// disables authentication.
    pub api_master_key: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct LocalConfig {
    #[serde(flatten)]
    pub server: ServerSettings,
    #[serde(flatten)]
    pub proxy: ProxyConfig,
}

/// Load the configuration file when one was given, otherwise start from
/// defaults. CLI flags and environment variables override file values.
pub fn load_config(cmd: &Cli) -> Result<LocalConfig, Report<Error>> {
    let mut config = match &cmd.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .change_context(Error::BuildingProxy)
                .attach_printable_lazy(|| path.clone())?;
            toml::from_str::<LocalConfig>(&data)
                .change_context(Error::BuildingProxy)
                .attach_printable_lazy(|| path.clone())?
        }
        None => LocalConfig {
            server: ServerSettings::default(),
            proxy: ProxyConfig::default(),
        },
    };

    if let Some(host) = &cmd.host {
        config.server.host = Some(host.clone());
    }
    if let Some(port) = cmd.port {
        config.server.port = Some(port);
    }
    if let Some(api_key) = &cmd.api_master_key {
        config.server.api_master_key = Some(api_key.clone());
    }
    if let Some(database_path) = &cmd.database_path {
        config.proxy.metrics_db_path = Some(database_path.clone());
    }

    Ok(config)
}

/// The effective API key: `None` means authentication is disabled.
pub fn effective_api_key(settings: &ServerSettings) -> Option<String> {
    settings
        .api_master_key
        .as_deref()
        .filter(|key| !key.is_empty() && *key != "1")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> Cli {
        Cli {
            config: None,
            no_dotenv: true,
            database_path: None,
            host: None,
            port: None,
            api_master_key: None,
        }
    }

    #[test]
    fn defaults_without_a_file() {
        let config = load_config(&cli()).unwrap();
        assert_eq!(config.server.port, None);
        assert_eq!(config.proxy.chat_url, "https://smithery.ai/api/chat");
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let dir = temp_dir::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            port = 9000
            api_master_key = "secret"
            chat_url = "http://localhost:1/api/chat"
            "#,
        )
        .unwrap();

        let mut cmd = cli();
        cmd.config = Some(path.display().to_string());
        cmd.port = Some(9100);
        cmd.database_path = Some("./metrics.db".to_string());

        let config = load_config(&cmd).unwrap();
        assert_eq!(config.server.port, Some(9100));
        assert_eq!(config.server.api_master_key.as_deref(), Some("secret"));
        assert_eq!(config.proxy.chat_url, "http://localhost:1/api/chat");
        assert_eq!(config.proxy.metrics_db_path.as_deref(), Some("./metrics.db"));
    }

    #[test]
    fn master_key_sentinel_disables_auth() {
        let settings = ServerSettings {
            api_master_key: Some("1".to_string()),
            ..Default::default()
        };
        assert_eq!(effective_api_key(&settings), None);

        let settings = ServerSettings {
            api_master_key: Some("secret".to_string()),
            ..Default::default()
        };
        assert_eq!(effective_api_key(&settings).as_deref(), Some("secret"));

        assert_eq!(effective_api_key(&ServerSettings::default()), None);
    }
}
