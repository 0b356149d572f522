// Session gateway
// Per-connection bridge between a WebSocket and the checklist service. A
// session holds no state until the client joins a group; the join reply is
// a snapshot and every later mutation in the group arrives through the
// hub subscription. Disconnects clean up nothing but the subscription.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerEvent};
use crate::service::ChecklistService;

/// Time between heartbeat pings to the client.
#[cfg(not(test))]
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
#[cfg(test)]
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

/// Max idle time before the connection is considered dead.
#[cfg(not(test))]
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(test)]
const CLIENT_TIMEOUT: Duration = Duration::from_millis(100);

/// One authenticated connection. Created by the WebSocket upgrade handler
/// after the handshake has been verified.
pub struct Session {
    service: Arc<ChecklistService>,
    /// Authenticated platform user. Client-supplied `userId` fields are
    /// accepted on the wire but calls are tagged with this identity.
    user_id: String,
    group_id: Option<String>,
}

enum Shutdown {
    ClientClosed,
    StreamClosed,
    HeartbeatTimeout,
    Network,
}

impl Session {
    pub fn new(service: Arc<ChecklistService>, user_id: String) -> Self {
        Self {
            service,
            user_id,
            group_id: None,
        }
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let mut events: Option<broadcast::Receiver<ServerEvent>> = None;
        let mut last_seen = Instant::now();
        let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);

        let shutdown = loop {
            let step = tokio::select! {
                _ = heartbeat.tick() => {
                    self.heartbeat_tick(&mut sink, last_seen).await
                }
                frame = stream.next() => {
                    last_seen = Instant::now();
                    self.handle_frame(&mut sink, &mut events, frame).await
                }
                event = recv_event(&mut events) => {
                    self.forward_event(&mut sink, &mut events, event).await
                }
            };
            if let Err(shutdown) = step {
                break shutdown;
            }
        };

        match shutdown {
            Shutdown::HeartbeatTimeout => {
                warn!(user_id = %self.user_id, "session heartbeat timeout");
                let _ = sink.send(Message::Close(None)).await;
            }
            Shutdown::Network => {
                debug!(user_id = %self.user_id, "session send failed");
            }
            Shutdown::ClientClosed | Shutdown::StreamClosed => {
                debug!(user_id = %self.user_id, "session closed");
            }
        }
    }

    async fn heartbeat_tick(
        &self,
        sink: &mut SplitSink<WebSocket, Message>,
        last_seen: Instant,
    ) -> Result<(), Shutdown> {
        if last_seen.elapsed() > CLIENT_TIMEOUT {
            return Err(Shutdown::HeartbeatTimeout);
        }
        sink.send(Message::Ping(Vec::new()))
            .await
            .map_err(|_| Shutdown::Network)
    }

    async fn handle_frame(
        &mut self,
        sink: &mut SplitSink<WebSocket, Message>,
        events: &mut Option<broadcast::Receiver<ServerEvent>>,
        frame: Option<Result<Message, axum::Error>>,
    ) -> Result<(), Shutdown> {
        let Some(frame) = frame else {
            return Err(Shutdown::StreamClosed);
        };
        let Ok(message) = frame else {
            return Err(Shutdown::StreamClosed);
        };

        match message {
            Message::Text(text) => self.handle_text(sink, events, &text).await,
            Message::Close(_) => Err(Shutdown::ClientClosed),
            // Pings are answered by axum; pongs and binary frames only
            // refresh the idle clock.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => Ok(()),
        }
    }

    async fn handle_text(
        &mut self,
        sink: &mut SplitSink<WebSocket, Message>,
        events: &mut Option<broadcast::Receiver<ServerEvent>>,
        text: &str,
    ) -> Result<(), Shutdown> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(error) => {
                warn!(user_id = %self.user_id, %error, "malformed session message");
                return send_json(
                    sink,
                    &ServerEvent::Error {
                        code: "bad_message".into(),
                        message: "unparseable message".into(),
                    },
                )
                .await;
            }
        };

        // A join (re)scopes the subscription before the snapshot is read,
        // so no event between the two is lost.
        let joining = matches!(&message, ClientMessage::Join { .. });
        if let ClientMessage::Join { group_id } = &message {
            *events = Some(self.service.hub().subscribe(group_id));
        }

        match self.dispatch(message).await {
            Ok(Some(reply)) => send_json(sink, &reply).await,
            Ok(None) => Ok(()),
            // Failures are reported to this caller only; fan-out never
            // carries errors.
            Err(error) => {
                if joining {
                    // The join did not take effect; fall back to the group
                    // the session was scoped to before, if any.
                    *events = self
                        .group_id
                        .as_ref()
                        .map(|group_id| self.service.hub().subscribe(group_id));
                }
                send_json(
                    sink,
                    &ServerEvent::Error {
                        code: error.code().into(),
                        message: error.to_string(),
                    },
                )
                .await
            }
        }
    }

    /// Translate one inbound message into a service call. Returns the
    /// direct reply, if any; fan-out events travel through the hub.
    pub async fn dispatch(&mut self, message: ClientMessage) -> SyncResult<Option<ServerEvent>> {
        match message {
            ClientMessage::Join { group_id } => {
                let checklists = self.service.snapshot(&group_id).await?;
                self.group_id = Some(group_id);
                Ok(Some(ServerEvent::Snapshot { checklists }))
            }
            ClientMessage::Create { name, group_id, .. } => {
                self.require_joined()?;
                self.service
                    .create_checklist(&name, &self.user_id, &group_id)
                    .await?;
                Ok(None)
            }
            ClientMessage::Advance {
                checklist_id,
                item_id,
                ..
            } => {
                self.require_joined()?;
                self.service
                    .advance_item(&checklist_id, item_id, &self.user_id)
                    .await?;
                Ok(None)
            }
            ClientMessage::UpdateDetails {
                checklist_id,
                item_id,
                details,
                ..
            } => {
                self.require_joined()?;
                self.service
                    .update_details(&checklist_id, item_id, &details, &self.user_id)
                    .await?;
                Ok(None)
            }
            ClientMessage::UpdateGlyph {
                checklist_id,
                item_id,
                emoji,
                ..
            } => {
                self.require_joined()?;
                self.service
                    .update_glyph(&checklist_id, item_id, &emoji, &self.user_id)
                    .await?;
                Ok(None)
            }
            ClientMessage::Delete { checklist_id } => {
                self.require_joined()?;
                self.service.delete_checklist(&checklist_id).await?;
                Ok(None)
            }
        }
    }

    fn require_joined(&self) -> SyncResult<()> {
        if self.group_id.is_some() {
            Ok(())
        } else {
            Err(SyncError::Validation("join a group first".into()))
        }
    }

    async fn forward_event(
        &mut self,
        sink: &mut SplitSink<WebSocket, Message>,
        events: &mut Option<broadcast::Receiver<ServerEvent>>,
        event: Result<ServerEvent, broadcast::error::RecvError>,
    ) -> Result<(), Shutdown> {
        match event {
            Ok(event) => send_json(sink, &event).await,
            // A lagged or re-created topic means missed events; recover
            // with a fresh snapshot instead of replay.
            Err(_) => {
                let Some(group_id) = self.group_id.clone() else {
                    *events = None;
                    return Ok(());
                };
                *events = Some(self.service.hub().subscribe(&group_id));
                match self.service.snapshot(&group_id).await {
                    Ok(checklists) => {
                        send_json(sink, &ServerEvent::Snapshot { checklists }).await
                    }
                    Err(error) => {
                        warn!(user_id = %self.user_id, %error, "resync snapshot failed");
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Await the next hub event, or park forever while no group is joined.
async fn recv_event(
    events: &mut Option<broadcast::Receiver<ServerEvent>>,
) -> Result<ServerEvent, broadcast::error::RecvError> {
    match events {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), Shutdown> {
    match serde_json::to_string(event) {
        Ok(body) => sink
            .send(Message::Text(body))
            .await
            .map_err(|_| Shutdown::Network),
        Err(error) => {
            warn!(%error, "event failed to serialize");
            Ok(())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::User;
    use crate::checklist::ItemStatus;
    use crate::hub::Hub;
    use crate::store::Store;

    async fn service() -> Arc<ChecklistService> {
        let store = Store::open_in_memory().unwrap();
        let service = ChecklistService::load(store, Arc::new(Hub::new()))
            .await
            .unwrap();
        service
            .grant_user(
                "",
                User {
                    id: "admin".into(),
                    first_name: String::new(),
                    last_name: String::new(),
                    username: String::new(),
                    is_admin: true,
                },
            )
            .await
            .unwrap();
        service
            .add_template_entry("admin", "Bank A", ItemStatus::NotStarted)
            .await
            .unwrap();
        Arc::new(service)
    }

    #[tokio::test]
    async fn test_join_replies_with_group_snapshot() {
        let service = service().await;
        service
            .create_checklist("Q1 Banks", "admin", "g1")
            .await
            .unwrap();
        service
            .create_checklist("Other", "admin", "g2")
            .await
            .unwrap();

        let mut session = Session::new(service, "admin".into());
        let reply = session
            .dispatch(ClientMessage::Join {
                group_id: "g1".into(),
            })
            .await
            .unwrap();

        match reply {
            Some(ServerEvent::Snapshot { checklists }) => {
                assert_eq!(checklists.len(), 1);
                assert_eq!(checklists[0].name, "Q1 Banks");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mutations_before_join_are_rejected() {
        let service = service().await;
        let mut session = Session::new(service, "admin".into());

        let err = session
            .dispatch(ClientMessage::Create {
                name: "Q1 Banks".into(),
                user_id: "admin".into(),
                group_id: "g1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_attribution_uses_the_authenticated_identity() {
        let service = service().await;
        let mut session = Session::new(service.clone(), "real-user".into());
        session
            .dispatch(ClientMessage::Join {
                group_id: "g1".into(),
            })
            .await
            .unwrap();
        session
            .dispatch(ClientMessage::Create {
                name: "Q1 Banks".into(),
                // A spoofed wire-level user id must not win attribution.
                user_id: "spoofed".into(),
                group_id: "g1".into(),
            })
            .await
            .unwrap();

        let snapshot = service.snapshot("g1").await.unwrap();
        let checklist_id = snapshot[0].id.clone();
        session
            .dispatch(ClientMessage::Advance {
                checklist_id: checklist_id.clone(),
                item_id: 1,
                user_id: "spoofed".into(),
            })
            .await
            .unwrap();

        let snapshot = service.snapshot("g1").await.unwrap();
        assert_eq!(snapshot[0].created_by, "real-user");
        assert_eq!(
            snapshot[0].items[0].modified_by.as_deref(),
            Some("real-user")
        );
    }

    #[tokio::test]
    async fn test_dispatch_surfaces_not_found_to_the_caller() {
        let service = service().await;
        let mut session = Session::new(service, "admin".into());
        session
            .dispatch(ClientMessage::Join {
                group_id: "g1".into(),
            })
            .await
            .unwrap();

        let err = session
            .dispatch(ClientMessage::Delete {
                checklist_id: "no-such-id".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_rejoin_switches_groups() {
        let service = service().await;
        service
            .create_checklist("Other", "admin", "g2")
            .await
            .unwrap();

        let mut session = Session::new(service, "admin".into());
        session
            .dispatch(ClientMessage::Join {
                group_id: "g1".into(),
            })
            .await
            .unwrap();
        let reply = session
            .dispatch(ClientMessage::Join {
                group_id: "g2".into(),
            })
            .await
            .unwrap();

        match reply {
            Some(ServerEvent::Snapshot { checklists }) => {
                assert_eq!(checklists.len(), 1);
                assert_eq!(checklists[0].group_id, "g2");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
