// Checklist aggregate and item state machine
// Status is a fixed 4-state cycle; the only external transition is
// "advance". Details merge field-wise with last-writer-wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Maximum checklist name length in characters.
pub const MAX_NAME_LEN: usize = 50;

// ============================================================================
// STATUS CYCLE
// ============================================================================

/// Item status. Cycles NOT_STARTED → IN_PROGRESS → APPROVED → DECLINED and
/// back to NOT_STARTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    NotStarted,
    InProgress,
    Approved,
    Declined,
}

/// The fixed cycle order. `advance` walks this modulo its length.
const STATUS_CYCLE: [ItemStatus; 4] = [
    ItemStatus::NotStarted,
    ItemStatus::InProgress,
    ItemStatus::Approved,
    ItemStatus::Declined,
];

impl ItemStatus {
    /// Next status in the cycle.
    pub fn next(self) -> ItemStatus {
        let idx = STATUS_CYCLE
            .iter()
            .position(|s| *s == self)
            .unwrap_or(0);
        STATUS_CYCLE[(idx + 1) % STATUS_CYCLE.len()]
    }

    /// Canonical display glyph for this status.
    pub fn glyph(self) -> &'static str {
        match self {
            ItemStatus::NotStarted => "⬜️",
            ItemStatus::InProgress => "🟡",
            ItemStatus::Approved => "✅",
            ItemStatus::Declined => "❌",
        }
    }
}

impl Default for ItemStatus {
    fn default() -> Self {
        ItemStatus::NotStarted
    }
}

// ============================================================================
// DETAILS
// ============================================================================

/// Per-item private detail fields. All free text, may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Details {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

/// Partial details update. Absent fields are preserved on merge.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DetailsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Details {
    /// Merge a partial update into this record. Field-level last-writer-wins:
    /// supplied fields overwrite, absent fields are untouched. Idempotent.
    pub fn merge(&mut self, patch: &DetailsPatch) {
        if let Some(login) = &patch.login {
            self.login = login.clone();
        }
        if let Some(password) = &patch.password {
            self.password = password.clone();
        }
        if let Some(phone) = &patch.phone {
            self.phone = phone.clone();
        }
        if let Some(email) = &patch.email {
            self.email = email.clone();
        }
    }
}

// ============================================================================
// ITEM
// ============================================================================

/// A unit of work inside a checklist. The id is unique within its checklist
/// only, assigned from the template entry that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: u32,
    pub name: String,
    pub status: ItemStatus,
    /// Display glyph. Tracks `status.glyph()` except after an explicit
    /// glyph override, which the next advance corrects.
    pub glyph: String,
    #[serde(default)]
    pub details: Details,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
}

impl Item {
    /// Fresh item with the given default status and empty details.
    pub fn new(id: u32, name: &str, status: ItemStatus) -> Self {
        Self {
            id,
            name: name.to_string(),
            status,
            glyph: status.glyph().to_string(),
            details: Details::default(),
            modified_at: None,
            modified_by: None,
        }
    }

    /// Advance the status one step along the cycle and stamp attribution.
    /// Always restores the canonical glyph for the resulting status.
    pub fn advance(&mut self, user_id: &str, now: DateTime<Utc>) {
        self.status = self.status.next();
        self.glyph = self.status.glyph().to_string();
        self.modified_at = Some(now);
        self.modified_by = Some(user_id.to_string());
    }

    /// Merge a partial details update and stamp attribution.
    pub fn update_details(&mut self, patch: &DetailsPatch, user_id: &str, now: DateTime<Utc>) {
        self.details.merge(patch);
        self.modified_at = Some(now);
        self.modified_by = Some(user_id.to_string());
    }

    /// Display-only glyph override. Leaves status untouched; the next
    /// advance replaces the glyph with the canonical one.
    pub fn override_glyph(&mut self, emoji: &str, user_id: &str, now: DateTime<Utc>) {
        self.glyph = emoji.to_string();
        self.modified_at = Some(now);
        self.modified_by = Some(user_id.to_string());
    }
}

// ============================================================================
// CHECKLIST
// ============================================================================

/// A named, ordered collection of items scoped to a group. Item ordering is
/// fixed at creation from the template registry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checklist {
    pub id: String,
    pub name: String,
    pub group_id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default)]
    pub archived: bool,
    /// Compare-and-swap counter; bumped by the store on every update.
    #[serde(default)]
    pub revision: i64,
    pub items: Vec<Item>,
}

impl Checklist {
    /// Build a new checklist from a validated name and an item snapshot.
    pub fn new(name: &str, group_id: &str, created_by: &str, items: Vec<Item>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            group_id: group_id.to_string(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            archived: false,
            revision: 0,
            items,
        }
    }

    /// Mutable item lookup by id.
    pub fn item_mut(&mut self, item_id: u32) -> Option<&mut Item> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    /// Item lookup by id.
    pub fn item(&self, item_id: u32) -> Option<&Item> {
        self.items.iter().find(|item| item.id == item_id)
    }
}

/// Validate and normalize a checklist name: trimmed, 1–50 characters.
/// Failures are reported to the caller only and never broadcast.
pub fn validate_name(raw: &str) -> SyncResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(SyncError::Validation("checklist name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(SyncError::Validation(format!(
            "checklist name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

// ============================================================================
// TESTS
// ============================================================================
