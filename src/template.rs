// Template registry
// Canonical ordered list of default items applied to every new checklist.
// Persisted as a single serialized settings record; structural edits are
// admin-only and go through the service layer.

use serde::{Deserialize, Serialize};

use crate::checklist::{Item, ItemStatus};
use crate::error::{SyncError, SyncResult};

/// One default item definition. The glyph is derived from the status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateEntry {
    pub id: u32,
    pub name: String,
    pub default_status: ItemStatus,
}

/// The canonical, ordered item template shared by all new checklists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRegistry {
    entries: Vec<TemplateEntry>,
    next_id: u32,
}

impl TemplateRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Registry seeded with entry names, all defaulting to NOT_STARTED.
    pub fn with_names(names: &[&str]) -> Self {
        let mut registry = Self::new();
        for name in names {
            registry.add(name, ItemStatus::NotStarted);
        }
        registry
    }

    /// Entries in canonical order.
    pub fn entries(&self) -> &[TemplateEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Append a new entry and return its id.
    pub fn add(&mut self, name: &str, default_status: ItemStatus) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TemplateEntry {
            id,
            name: name.trim().to_string(),
            default_status,
        });
        id
    }

    /// Remove an entry by id.
    pub fn remove(&mut self, id: u32) -> SyncResult<()> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        if self.entries.len() == before {
            return Err(SyncError::NotFound {
                entity: "template entry",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Rename an entry by id.
    pub fn rename(&mut self, id: u32, name: &str) -> SyncResult<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(SyncError::NotFound {
                entity: "template entry",
                id: id.to_string(),
            })?;
        entry.name = name.trim().to_string();
        Ok(())
    }

    /// Deep-copy the current snapshot into fresh items with empty details.
    /// Item ids follow the template entry ids, preserving order.
    pub fn instantiate(&self) -> Vec<Item> {
        self.entries
            .iter()
            .map(|entry| Item::new(entry.id, &entry.name, entry.default_status))
            .collect()
    }

    /// Rebuild an existing item list against the current template (the
    /// "propagate to existing checklists" merge).
    ///
    /// Walks the template in order; an old item matching by name
    /// (case-insensitive) carries over its status, glyph, details and
    /// modification metadata under the template entry's id. Entries with no
    /// match become fresh default items. Old items absent from the template
    /// are dropped.
    pub fn rebuild_items(&self, existing: &[Item]) -> Vec<Item> {
        self.entries
            .iter()
            .map(|entry| {
                match existing
                    .iter()
                    .find(|item| item.name.eq_ignore_ascii_case(&entry.name))
                {
                    Some(old) => Item {
                        id: entry.id,
                        name: entry.name.clone(),
                        status: old.status,
                        glyph: old.glyph.clone(),
                        details: old.details.clone(),
                        modified_at: old.modified_at,
                        modified_by: old.modified_by.clone(),
                    },
                    None => Item::new(entry.id, &entry.name, entry.default_status),
                }
            })
            .collect()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::DetailsPatch;
    use chrono::Utc;

    #[test]
    fn test_add_assigns_sequential_ids() {
        let mut registry = TemplateRegistry::new();
        assert_eq!(registry.add("Bank A", ItemStatus::NotStarted), 1);
        assert_eq!(registry.add("Bank B", ItemStatus::NotStarted), 2);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_remove_unknown_id_is_not_found() {
        let mut registry = TemplateRegistry::with_names(&["Bank A"]);
        assert!(registry.remove(99).is_err());
        assert!(registry.remove(1).is_ok());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_rename_by_id() {
        let mut registry = TemplateRegistry::with_names(&["Bank A"]);
        registry.rename(1, "Bank Alpha").unwrap();
        assert_eq!(registry.entries()[0].name, "Bank Alpha");
        assert!(registry.rename(7, "x").is_err());
    }

    #[test]
    fn test_ids_are_not_reused_after_remove() {
        let mut registry = TemplateRegistry::with_names(&["Bank A", "Bank B"]);
        registry.remove(2).unwrap();
        assert_eq!(registry.add("Bank C", ItemStatus::NotStarted), 3);
    }

    #[test]
    fn test_instantiate_copies_defaults_with_empty_details() {
        let registry = TemplateRegistry::with_names(&["Bank A", "Bank B"]);
        let items = registry.instantiate();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "Bank A");
        assert_eq!(items[0].status, ItemStatus::NotStarted);
        assert_eq!(items[0].glyph, ItemStatus::NotStarted.glyph());
        assert_eq!(items[0].details.login, "");
        assert!(items[0].modified_at.is_none());
    }

    #[test]
    fn test_rebuild_preserves_matching_items_case_insensitive() {
        let registry = TemplateRegistry::with_names(&["Bank A", "Bank B"]);

        // Existing item matches "Bank A" only by case-insensitive name.
        let mut old = Item::new(5, "BANK A", ItemStatus::NotStarted);
        old.advance("u1", Utc::now());
        old.update_details(
            &DetailsPatch {
                login: Some("alice".into()),
                ..Default::default()
            },
            "u1",
            Utc::now(),
        );

        let rebuilt = registry.rebuild_items(&[old]);

        assert_eq!(rebuilt.len(), 2);
        // Carried over: status, glyph, details, attribution. Renamed and
        // re-keyed to the template entry.
        assert_eq!(rebuilt[0].id, 1);
        assert_eq!(rebuilt[0].name, "Bank A");
        assert_eq!(rebuilt[0].status, ItemStatus::InProgress);
        assert_eq!(rebuilt[0].details.login, "alice");
        assert_eq!(rebuilt[0].modified_by.as_deref(), Some("u1"));
        // Unmatched entry gets template defaults.
        assert_eq!(rebuilt[1].name, "Bank B");
        assert_eq!(rebuilt[1].status, ItemStatus::NotStarted);
        assert!(rebuilt[1].modified_at.is_none());
    }

    #[test]
    fn test_rebuild_drops_items_absent_from_template() {
        let registry = TemplateRegistry::with_names(&["Bank A"]);
        let orphan = Item::new(9, "Old Bank", ItemStatus::Approved);

        let rebuilt = registry.rebuild_items(&[orphan]);

        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].name, "Bank A");
    }

    #[test]
    fn test_registry_serde_round_trip() {
        let registry = TemplateRegistry::with_names(&["Bank A", "Bank B"]);
        let json = serde_json::to_string(&registry).unwrap();
        let back: TemplateRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.count(), 2);
        assert_eq!(back.entries()[1].name, "Bank B");
    }
}
