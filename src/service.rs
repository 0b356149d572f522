// Checklist service
// Aggregate operations behind the session gateway and the HTTP surface.
// Every mutation follows the same ordering: validate, apply in memory,
// persist (compare-and-swap), then broadcast. A mutation that fails to
// persist is never broadcast.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::auth::{User, UserDirectory, VerifiedIdentity};
use crate::checklist::{validate_name, Checklist, DetailsPatch, Item, ItemStatus};
use crate::error::{SyncError, SyncResult};
use crate::hub::Hub;
use crate::protocol::ServerEvent;
use crate::store::Store;
use crate::template::{TemplateEntry, TemplateRegistry};

/// Settings key holding the serialized template registry.
const TEMPLATE_KEY: &str = "template_registry";
/// Settings key holding the serialized user directory.
const USERS_KEY: &str = "user_directory";

/// Owns the store, the broadcaster and the two in-process registries. The
/// registries are process-wide singletons behind read-write locks and are
/// re-persisted on every mutation.
pub struct ChecklistService {
    store: Store,
    hub: Arc<Hub>,
    templates: RwLock<TemplateRegistry>,
    users: RwLock<UserDirectory>,
}

impl ChecklistService {
    /// Load the registries from the settings records and build the service.
    pub async fn load(store: Store, hub: Arc<Hub>) -> SyncResult<Self> {
        let templates = match store.get_setting(TEMPLATE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => TemplateRegistry::new(),
        };
        let users = match store.get_setting(USERS_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => UserDirectory::new(),
        };
        Ok(Self {
            store,
            hub,
            templates: RwLock::new(templates),
            users: RwLock::new(users),
        })
    }

    /// The broadcaster, for sessions to subscribe through.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Non-archived checklists for a group (the snapshot payload).
    pub async fn snapshot(&self, group_id: &str) -> SyncResult<Vec<Checklist>> {
        self.store.list_active(group_id).await
    }

    /// Current template entries in canonical order.
    pub async fn template_entries(&self) -> Vec<TemplateEntry> {
        self.templates.read().await.entries().to_vec()
    }

    // ========================================================================
    // CHECKLIST MUTATIONS
    // ========================================================================

    /// Create a checklist from the current template snapshot.
    pub async fn create_checklist(
        &self,
        name: &str,
        user_id: &str,
        group_id: &str,
    ) -> SyncResult<Checklist> {
        let name = validate_name(name)?;
        let items = self.templates.read().await.instantiate();
        let checklist = Checklist::new(&name, group_id, user_id, items);

        self.store.insert(&checklist).await?;
        info!(checklist_id = %checklist.id, group_id, user_id, "checklist created");

        self.hub.publish(
            group_id,
            ServerEvent::ChecklistCreated {
                checklist: checklist.clone(),
            },
        );
        Ok(checklist)
    }

    /// Advance an item one step along the status cycle. The only external
    /// status transition.
    pub async fn advance_item(
        &self,
        checklist_id: &str,
        item_id: u32,
        user_id: &str,
    ) -> SyncResult<Item> {
        let mut checklist = self.active_checklist(checklist_id).await?;
        let item = checklist.item_mut(item_id).ok_or(SyncError::NotFound {
            entity: "item",
            id: item_id.to_string(),
        })?;

        item.advance(user_id, chrono::Utc::now());
        let updated = item.clone();

        self.store.update(&mut checklist).await?;
        info!(
            checklist_id,
            item_id,
            user_id,
            status = ?updated.status,
            "item advanced"
        );

        self.hub.publish(
            &checklist.group_id,
            ServerEvent::ItemStatusChanged {
                checklist_id: checklist_id.to_string(),
                item_id,
                status: updated.status,
                glyph: updated.glyph.clone(),
                modified_by: user_id.to_string(),
                modified_at: updated.modified_at.unwrap_or_else(chrono::Utc::now),
            },
        );
        Ok(updated)
    }

    /// Merge a partial details update into an item.
    pub async fn update_details(
        &self,
        checklist_id: &str,
        item_id: u32,
        patch: &DetailsPatch,
        user_id: &str,
    ) -> SyncResult<Item> {
        let mut checklist = self.active_checklist(checklist_id).await?;
        let item = checklist.item_mut(item_id).ok_or(SyncError::NotFound {
            entity: "item",
            id: item_id.to_string(),
        })?;

        item.update_details(patch, user_id, chrono::Utc::now());
        let updated = item.clone();

        self.store.update(&mut checklist).await?;

        self.hub.publish(
            &checklist.group_id,
            ServerEvent::ItemDetailsChanged {
                checklist_id: checklist_id.to_string(),
                item_id,
                details: updated.details.clone(),
                modified_by: user_id.to_string(),
                modified_at: updated.modified_at.unwrap_or_else(chrono::Utc::now),
            },
        );
        Ok(updated)
    }

    /// Display-only glyph override. Status is untouched and the next
    /// advance restores the canonical glyph.
    pub async fn update_glyph(
        &self,
        checklist_id: &str,
        item_id: u32,
        emoji: &str,
        user_id: &str,
    ) -> SyncResult<Item> {
        let mut checklist = self.active_checklist(checklist_id).await?;
        let item = checklist.item_mut(item_id).ok_or(SyncError::NotFound {
            entity: "item",
            id: item_id.to_string(),
        })?;

        item.override_glyph(emoji, user_id, chrono::Utc::now());
        let updated = item.clone();

        self.store.update(&mut checklist).await?;

        self.hub.publish(
            &checklist.group_id,
            ServerEvent::ItemGlyphChanged {
                checklist_id: checklist_id.to_string(),
                item_id,
                glyph: updated.glyph.clone(),
                modified_by: user_id.to_string(),
                modified_at: updated.modified_at.unwrap_or_else(chrono::Utc::now),
            },
        );
        Ok(updated)
    }

    /// Soft-delete a checklist. It disappears from active lists and is
    /// never resurrected; exactly one `checklistDeleted` event is emitted.
    pub async fn delete_checklist(&self, checklist_id: &str) -> SyncResult<()> {
        let mut checklist = self.active_checklist(checklist_id).await?;
        checklist.archived = true;

        self.store.update(&mut checklist).await?;
        info!(checklist_id, group_id = %checklist.group_id, "checklist archived");

        self.hub.publish(
            &checklist.group_id,
            ServerEvent::ChecklistDeleted {
                checklist_id: checklist_id.to_string(),
            },
        );
        Ok(())
    }

    /// Fetch a checklist, treating archived ones as gone.
    async fn active_checklist(&self, checklist_id: &str) -> SyncResult<Checklist> {
        match self.store.get(checklist_id).await? {
            Some(checklist) if !checklist.archived => Ok(checklist),
            _ => Err(SyncError::NotFound {
                entity: "checklist",
                id: checklist_id.to_string(),
            }),
        }
    }

    // ========================================================================
    // TEMPLATE ADMINISTRATION
    // ========================================================================

    /// Append a template entry. Admin only.
    pub async fn add_template_entry(
        &self,
        admin_id: &str,
        name: &str,
        default_status: ItemStatus,
    ) -> SyncResult<u32> {
        self.require_admin(admin_id).await?;
        let mut templates = self.templates.write().await;
        let mut next = templates.clone();
        let id = next.add(name, default_status);
        self.persist_templates(&next).await?;
        *templates = next;
        Ok(id)
    }

    /// Remove a template entry by id. Admin only.
    pub async fn remove_template_entry(&self, admin_id: &str, entry_id: u32) -> SyncResult<()> {
        self.require_admin(admin_id).await?;
        let mut templates = self.templates.write().await;
        let mut next = templates.clone();
        next.remove(entry_id)?;
        self.persist_templates(&next).await?;
        *templates = next;
        Ok(())
    }

    /// Rename a template entry by id. Admin only.
    pub async fn rename_template_entry(
        &self,
        admin_id: &str,
        entry_id: u32,
        name: &str,
    ) -> SyncResult<()> {
        self.require_admin(admin_id).await?;
        let mut templates = self.templates.write().await;
        let mut next = templates.clone();
        next.rename(entry_id, name)?;
        self.persist_templates(&next).await?;
        *templates = next;
        Ok(())
    }

    /// Propagate the current template to every non-archived checklist in
    /// the deployment, then tell all groups to refetch. Admin only.
    ///
    /// Items matching a template entry by case-insensitive name keep their
    /// status, glyph, details and attribution; everything else is rebuilt
    /// from template defaults. Per-item events are not emitted; clients
    /// reload on `templateChanged`.
    pub async fn sync_templates(&self, admin_id: &str) -> SyncResult<usize> {
        self.require_admin(admin_id).await?;
        let templates = self.templates.read().await.clone();

        let mut synced = 0;
        for mut checklist in self.store.list_all_active().await? {
            checklist.items = templates.rebuild_items(&checklist.items);
            self.store.update(&mut checklist).await?;
            synced += 1;
        }
        info!(checklists = synced, admin_id, "template propagated");

        self.hub.publish_all(ServerEvent::TemplateChanged {
            template: templates.entries().to_vec(),
        });
        Ok(synced)
    }

    async fn persist_templates(&self, templates: &TemplateRegistry) -> SyncResult<()> {
        let raw = serde_json::to_string(templates)?;
        self.store.put_setting(TEMPLATE_KEY, &raw).await
    }

    // ========================================================================
    // USERS & ACCESS
    // ========================================================================

    /// Resolve a verified identity against the whitelist and refresh the
    /// stored display names. Unknown users are denied.
    pub async fn authenticate(&self, identity: &VerifiedIdentity) -> SyncResult<User> {
        let mut users = self.users.write().await;
        if !users.is_whitelisted(&identity.user_id) {
            warn!(user_id = %identity.user_id, "authentication denied: not whitelisted");
            return Err(SyncError::Unauthorized(format!(
                "user {} is not whitelisted",
                identity.user_id
            )));
        }

        let mut next = users.clone();
        next.update_profile(identity);
        self.persist_users(&next).await?;
        let user = next.get(&identity.user_id).cloned().ok_or_else(|| {
            SyncError::Unauthorized(format!("user {} is not whitelisted", identity.user_id))
        })?;
        *users = next;
        Ok(user)
    }

    /// Whitelist a user. Admin only, except for bootstrapping an empty
    /// directory (the first grant seeds the deployment).
    pub async fn grant_user(&self, admin_id: &str, user: User) -> SyncResult<()> {
        let mut users = self.users.write().await;
        if !users.is_empty() && !users.is_admin(admin_id) {
            return Err(SyncError::Unauthorized(format!(
                "user {} may not manage the whitelist",
                admin_id
            )));
        }

        let mut next = users.clone();
        next.grant(user);
        self.persist_users(&next).await?;
        *users = next;
        Ok(())
    }

    /// Remove a user from the whitelist. Admin only.
    pub async fn revoke_user(&self, admin_id: &str, user_id: &str) -> SyncResult<()> {
        self.require_admin(admin_id).await?;
        let mut users = self.users.write().await;
        let mut next = users.clone();
        if !next.revoke(user_id) {
            return Err(SyncError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            });
        }
        self.persist_users(&next).await?;
        *users = next;
        Ok(())
    }

    /// Set or clear the admin flag. Admin only; touches nothing else.
    pub async fn set_admin(&self, admin_id: &str, user_id: &str, admin: bool) -> SyncResult<()> {
        self.require_admin(admin_id).await?;
        let mut users = self.users.write().await;
        let mut next = users.clone();
        let known = if admin {
            next.promote(user_id)
        } else {
            next.demote(user_id)
        };
        if !known {
            return Err(SyncError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            });
        }
        self.persist_users(&next).await?;
        *users = next;
        Ok(())
    }

    /// Whether the user may authenticate at all.
    pub async fn is_whitelisted(&self, user_id: &str) -> bool {
        self.users.read().await.is_whitelisted(user_id)
    }

    async fn require_admin(&self, user_id: &str) -> SyncResult<()> {
        if self.users.read().await.is_admin(user_id) {
            Ok(())
        } else {
            Err(SyncError::Unauthorized(format!(
                "user {} is not an administrator",
                user_id
            )))
        }
    }

    async fn persist_users(&self, users: &UserDirectory) -> SyncResult<()> {
        let raw = serde_json::to_string(users)?;
        self.store.put_setting(USERS_KEY, &raw).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
