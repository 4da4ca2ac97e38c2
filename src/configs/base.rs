use serde::{Deserialize, Serialize};

use crate::common::types::AnyResult;
use crate::configs::*;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub player: PlayerConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        let config_str = std::fs::read_to_string(config_path)?;
        if config_str.is_empty() {
            return Err(format!("{} is empty", config_path).into());
        }

        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> AnyResult<Self> {
        let config: Config = toml::from_str(config_str)?;
        if config.client.user_id == 0 {
            return Err("client.user_id must be set".into());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[client]
user_id = 1234567890
auto_move_players = true
node_selection = "least_load"

[[nodes]]
identifier = "main"
host = "127.0.0.1"
port = 2333
password = "youshallnotpass"

[[nodes]]
host = "10.0.0.2"
port = 2334
password = "secret"
resume = false

[player]
history_size = 10
autoplay = true

[logging]
level = "debug"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::parse(SAMPLE).expect("sample config should parse");
        assert_eq!(config.client.user_id, 1234567890);
        assert!(config.client.auto_move_players);
        assert_eq!(config.client.node_selection, NodeSelection::LeastLoad);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].id(), "main");
        assert_eq!(config.nodes[1].id(), "10.0.0.2:2334");
        assert!(config.nodes[0].resume);
        assert!(!config.nodes[1].resume);
        assert_eq!(config.player.history_size, 10);
        assert!(config.player.autoplay);
        assert_eq!(config.player.max_stuck_attempts, 3);
        assert_eq!(
            config.logging.and_then(|l| l.level).as_deref(),
            Some("debug")
        );
    }

    #[test]
    fn test_missing_user_id_is_rejected() {
        assert!(Config::parse("[[nodes]]\nhost = \"a\"\nport = 1\npassword = \"p\"\n").is_err());
    }
}
