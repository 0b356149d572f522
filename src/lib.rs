// Group Checklist Sync - Core Library
// Exposes the domain modules for use in the server binary, the bot
// dispatcher, and tests

pub mod auth;
pub mod checklist;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod service;
pub mod session;
pub mod store;
pub mod template;

// Re-export commonly used types
pub use auth::{IdentityVerifier, SignedPayloadVerifier, User, UserDirectory, VerifiedIdentity};
pub use checklist::{Checklist, Details, DetailsPatch, Item, ItemStatus, MAX_NAME_LEN};
pub use error::{SyncError, SyncResult};
pub use hub::Hub;
pub use protocol::{ClientMessage, ServerEvent};
pub use service::ChecklistService;
pub use session::Session;
pub use store::Store;
pub use template::{TemplateEntry, TemplateRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
