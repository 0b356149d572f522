// Wire-level message definitions for the session protocol
// JSON text frames, tagged by "type" with camelCase payload fields. Ids
// are parsed into their canonical types here and nowhere else: checklist
// ids are strings, item ids are integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checklist::{Checklist, Details, DetailsPatch, ItemStatus};
use crate::template::TemplateEntry;

/// Inbound messages from a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Scope this session to a group; answered with a snapshot.
    #[serde(rename_all = "camelCase")]
    Join { group_id: String },
    #[serde(rename_all = "camelCase")]
    Create {
        name: String,
        user_id: String,
        group_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Advance {
        checklist_id: String,
        item_id: u32,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateDetails {
        checklist_id: String,
        item_id: u32,
        details: DetailsPatch,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateGlyph {
        checklist_id: String,
        item_id: u32,
        emoji: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Delete { checklist_id: String },
}

/// Outbound events fanned out to sessions (and direct replies such as
/// `snapshot` and `error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Snapshot { checklists: Vec<Checklist> },
    #[serde(rename_all = "camelCase")]
    ChecklistCreated { checklist: Checklist },
    #[serde(rename_all = "camelCase")]
    ItemStatusChanged {
        checklist_id: String,
        item_id: u32,
        status: ItemStatus,
        glyph: String,
        modified_by: String,
        modified_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ItemDetailsChanged {
        checklist_id: String,
        item_id: u32,
        details: Details,
        modified_by: String,
        modified_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ItemGlyphChanged {
        checklist_id: String,
        item_id: u32,
        glyph: String,
        modified_by: String,
        modified_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ChecklistDeleted { checklist_id: String },
    #[serde(rename_all = "camelCase")]
    TemplateChanged { template: Vec<TemplateEntry> },
    /// Caller-only failure report; never fanned out.
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "join", "groupId": "g1"})).unwrap();
        assert!(matches!(msg, ClientMessage::Join { group_id } if group_id == "g1"));
    }

    #[test]
    fn test_parse_create() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "create",
            "name": "Q1 Banks",
            "userId": "u1",
            "groupId": "g1"
        }))
        .unwrap();
        match msg {
            ClientMessage::Create {
                name,
                user_id,
                group_id,
            } => {
                assert_eq!(name, "Q1 Banks");
                assert_eq!(user_id, "u1");
                assert_eq!(group_id, "g1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_details_with_partial_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "updateDetails",
            "checklistId": "c1",
            "itemId": 2,
            "details": {"phone": "+1 555 0100"},
            "userId": "u1"
        }))
        .unwrap();
        match msg {
            ClientMessage::UpdateDetails {
                item_id, details, ..
            } => {
                assert_eq!(item_id, 2);
                assert_eq!(details.phone.as_deref(), Some("+1 555 0100"));
                assert!(details.login.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_reject_non_integer_item_id() {
        let result = serde_json::from_value::<ClientMessage>(json!({
            "type": "advance",
            "checklistId": "c1",
            "itemId": "two",
            "userId": "u1"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_status_changed_event_shape() {
        let event = ServerEvent::ItemStatusChanged {
            checklist_id: "c1".into(),
            item_id: 1,
            status: ItemStatus::InProgress,
            glyph: ItemStatus::InProgress.glyph().into(),
            modified_by: "u1".into(),
            modified_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "itemStatusChanged");
        assert_eq!(json["checklistId"], "c1");
        assert_eq!(json["itemId"], 1);
        assert_eq!(json["status"], "IN_PROGRESS");
        assert!(json.get("modifiedBy").is_some());
        assert!(json.get("modifiedAt").is_some());
    }

    #[test]
    fn test_deleted_event_shape() {
        let event = ServerEvent::ChecklistDeleted {
            checklist_id: "c1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "checklistDeleted");
        assert_eq!(json["checklistId"], "c1");
    }
}
