//! Pluggable key/value persistence for session ids and player snapshots.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;

use crate::common::types::{AnyResult, GuildId};

/// Key holding a node's last session id.
pub fn node_session_key(node_id: &str) -> String {
    format!("node:{node_id}:session")
}

/// Key holding a player's snapshot.
pub fn player_key(guild_id: &GuildId) -> String {
    format!("player:{guild_id}")
}

pub const PLAYER_KEY_PATTERN: &str = "player:*";

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> AnyResult<Option<String>>;
    async fn set(&self, key: &str, value: String) -> AnyResult<()>;
    async fn remove(&self, key: &str) -> AnyResult<()>;
    /// Keys matching a glob pattern (`*` and `?`), or every key.
    async fn keys(&self, pattern: Option<&str>) -> AnyResult<Vec<String>>;
    async fn clear(&self) -> AnyResult<()>;
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn glob_to_regex(pattern: &str) -> AnyResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    Ok(Regex::new(&expr)?)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> AnyResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> AnyResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> AnyResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: Option<&str>) -> AnyResult<Vec<String>> {
        let matcher = pattern.map(glob_to_regex).transpose()?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| matcher.as_ref().is_none_or(|re| re.is_match(k)))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> AnyResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basics() {
        let store = MemoryStore::new();
        store.set("a", "1".into()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_glob_keys() {
        let store = MemoryStore::new();
        for key in ["player:1", "player:22", "node:main:session", "player.x"] {
            store.set(key, String::new()).await.unwrap();
        }

        assert_eq!(
            store.keys(Some(PLAYER_KEY_PATTERN)).await.unwrap(),
            vec!["player:1", "player:22"]
        );
        assert_eq!(store.keys(Some("player:?")).await.unwrap(), vec!["player:1"]);
        assert_eq!(store.keys(Some("node:*:session")).await.unwrap().len(), 1);
        assert_eq!(store.keys(None).await.unwrap().len(), 4);

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(node_session_key("main"), "node:main:session");
        assert_eq!(player_key(&GuildId::from("9")), "player:9");
    }
}
