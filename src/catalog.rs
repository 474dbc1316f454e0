use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

/// Read-only view of the reference data the engine prices against.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn list_master_slots(&self) -> Result<Vec<TimeSlot>, String>;
    async fn get_room(&self, id: Ulid) -> Result<Option<Room>, String>;
    async fn get_promotion(&self, code: &str) -> Result<Option<Promotion>, String>;
    async fn get_combo(&self, id: Ulid) -> Result<Option<ComboOffer>, String>;
}

/// Catalog held in memory, loaded from a JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryCatalog {
    #[serde(default)]
    pub slots: Vec<TimeSlot>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub promotions: Vec<Promotion>,
    #[serde(default)]
    pub combos: Vec<ComboOffer>,
}

impl InMemoryCatalog {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog: Self = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn load_or_empty(path: &Path) -> std::io::Result<Self> {
        match Self::load(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            other => other,
        }
    }

    fn validate(&self) -> std::io::Result<()> {
        for slot in &self.slots {
            if slot.end <= slot.start {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("slot {} ends before it starts", slot.id),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogReader for InMemoryCatalog {
    async fn list_master_slots(&self) -> Result<Vec<TimeSlot>, String> {
        let mut slots = self.slots.clone();
        slots.sort_by_key(|s| s.start);
        Ok(slots)
    }

    async fn get_room(&self, id: Ulid) -> Result<Option<Room>, String> {
        Ok(self.rooms.iter().find(|r| r.id == id).cloned())
    }

    async fn get_promotion(&self, code: &str) -> Result<Option<Promotion>, String> {
        Ok(self
            .promotions
            .iter()
            .find(|p| p.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn get_combo(&self, id: Ulid) -> Result<Option<ComboOffer>, String> {
        Ok(self.combos.iter().find(|c| c.id == id).cloned())
    }
}
