//! Room code resolution.

use std::collections::HashMap;

use async_trait::async_trait;

use dialbridge_common::BridgeResult;
use dialbridge_common::config::RoomsConfig;

/// Maps a dialled code to a conference room id.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// `Ok(None)` means the code is unknown.
    async fn resolve(&self, code: &str) -> BridgeResult<Option<String>>;
}

/// Directory backed by the configured code table.
#[derive(Debug, Clone, Default)]
pub struct StaticRoomDirectory {
    mapping: HashMap<String, String>,
}

impl StaticRoomDirectory {
    pub fn new(mapping: HashMap<String, String>) -> Self {
        Self { mapping }
    }

    pub fn from_config(rooms: &RoomsConfig) -> Self {
        Self::new(rooms.mapping.clone())
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

#[async_trait]
impl RoomDirectory for StaticRoomDirectory {
    async fn resolve(&self, code: &str) -> BridgeResult<Option<String>> {
        Ok(self.mapping.get(code).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_known_codes_only() {
        let dir = StaticRoomDirectory::new(HashMap::from([("00000".to_string(), "test".to_string())]));
        assert_eq!(dir.resolve("00000").await.unwrap().as_deref(), Some("test"));
        assert_eq!(dir.resolve("12345").await.unwrap(), None);
    }
}
