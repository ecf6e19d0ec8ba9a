use serde::Deserialize;

fn default_http_port() -> u16 {
    8080
}

fn default_api_base_url() -> String {
    "https://api.spacetraders.io/v2".to_string()
}

/// Environment-driven daemon configuration (deserialized with `envy`).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfiguration {
    pub database_url: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    pub agent_token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

impl ServerConfiguration {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: ServerConfiguration = envy::from_iter(vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/sf".to_string()),
            ("AGENT_TOKEN".to_string(), "token".to_string()),
        ])
        .unwrap();
        assert_eq!(config.http_port, 8080);
        assert!(config.api_base_url.contains("api.spacetraders.io"));
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let result: Result<ServerConfiguration, _> = envy::from_iter(vec![("AGENT_TOKEN".to_string(), "token".to_string())]);
        assert!(result.is_err());
    }
}
