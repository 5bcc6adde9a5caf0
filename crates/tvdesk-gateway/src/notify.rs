//! Notification dispatch and the per-connection notification list.
//!
//! Dispatch runs on its own task. The persisted row is the durable record;
//! the live push is best effort and nothing is retried.

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use tvdesk_types::api::DispatchNotificationRequest;
use tvdesk_types::events::ServerEvent;
use tvdesk_types::models::{NotificationKind, NotificationScope, is_guest_id};

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::i18n::{self, DEFAULT_LOCALE};
use crate::registry::ConnectionId;
use crate::store::NewNotification;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Recipient user ids for a scope, deduplicated in order. Guests never receive
/// notifications and `except` (usually the actor) is skipped.
pub fn resolve_recipients(scope: &NotificationScope, admin_ids: &[String], except: Option<&str>) -> Vec<String> {
    let mut candidates: Vec<&str> = Vec::new();
    match scope {
        NotificationScope::User { user_id } => candidates.push(user_id),
        NotificationScope::Admins => candidates.extend(admin_ids.iter().map(String::as_str)),
        NotificationScope::Both { user_id } => {
            candidates.push(user_id);
            candidates.extend(admin_ids.iter().map(String::as_str));
        }
    }

    let mut out: Vec<String> = Vec::new();
    for id in candidates {
        let id = id.trim();
        if id.is_empty() || is_guest_id(id) || Some(id) == except || out.iter().any(|o| o == id) {
            continue;
        }
        out.push(id.to_string());
    }
    out
}

fn needs_admins(scope: &NotificationScope) -> bool {
    matches!(scope, NotificationScope::Admins | NotificationScope::Both { .. })
}

impl Dispatcher {
    /// Fire-and-forget dispatch. Failures are logged, never returned.
    pub fn dispatch_notification(&self, request: DispatchNotificationRequest) -> JoinHandle<()> {
        self.spawn_dispatch(request.kind, request.scope, request.data, None)
    }

    pub(crate) fn spawn_dispatch(
        &self,
        kind: NotificationKind,
        scope: NotificationScope,
        data: serde_json::Value,
        except: Option<String>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher
                .deliver(kind, &scope, &data, except.as_deref())
                .await
            {
                error!("Dispatching {} notification failed: {:#}", kind.as_str(), e);
            }
        })
    }

    async fn deliver(
        &self,
        kind: NotificationKind,
        scope: &NotificationScope,
        data: &serde_json::Value,
        except: Option<&str>,
    ) -> Result<()> {
        let admin_ids = if needs_admins(scope) {
            self.inner.store.find_admin_ids().await?
        } else {
            Vec::new()
        };

        let recipients = resolve_recipients(scope, &admin_ids, except);
        if recipients.is_empty() {
            debug!("{} notification has no recipients", kind.as_str());
            return Ok(());
        }

        let mut delivered = 0;
        for user_id in &recipients {
            match self.deliver_to(user_id, kind, data).await {
                Ok(live) => delivered += live,
                Err(e) => error!("{} notification for {} failed: {:#}", kind.as_str(), user_id, e),
            }
        }

        info!(
            "{} notification sent to {} recipients ({} live sockets)",
            kind.as_str(),
            recipients.len(),
            delivered
        );
        Ok(())
    }

    /// Persist one recipient's copy in their locale, then push it live.
    async fn deliver_to(&self, user_id: &str, kind: NotificationKind, data: &serde_json::Value) -> Result<usize> {
        let locale = self
            .inner
            .store
            .find_user_locale(user_id)
            .await?
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string());
        let (title, body) = i18n::render(kind, &locale, data);

        let notification = self
            .inner
            .store
            .create_notification(NewNotification {
                user_id: user_id.to_string(),
                kind,
                title,
                body,
                data: data.clone(),
            })
            .await?;

        let live = self.inner.live.read().await;
        Ok(live
            .connections
            .send_to_user(user_id, &ServerEvent::Notification(notification)))
    }

    pub async fn fetch_notifications(
        &self,
        id: ConnectionId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<(), GatewayError> {
        let identity = self.identity_of(id).await?;
        let event = if identity.is_guest() {
            ServerEvent::NotificationsList {
                notifications: Vec::new(),
                unread_count: 0,
                has_more: false,
            }
        } else {
            self.notification_page(&identity.user_id, limit, offset)
                .await?
        };
        self.send_to(id, event).await;
        Ok(())
    }

    /// Mark the given (or all) notifications read and refresh every socket of the user.
    pub async fn mark_notifications_read(&self, id: ConnectionId, ids: Option<Vec<String>>) -> Result<(), GatewayError> {
        let identity = self.identity_of(id).await?;
        if identity.is_guest() {
            return self.fetch_notifications(id, None, None).await;
        }

        let changed = self
            .inner
            .store
            .mark_notifications_read(&identity.user_id, ids)
            .await?;
        debug!("{} marked {} notifications read", identity.user_id, changed);

        let event = self
            .notification_page(&identity.user_id, None, None)
            .await?;
        self.inner
            .live
            .read()
            .await
            .connections
            .send_to_user(&identity.user_id, &event);
        Ok(())
    }

    async fn notification_page(
        &self,
        user_id: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<ServerEvent, GatewayError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let page = self
            .inner
            .store
            .list_notifications(user_id, limit, offset.unwrap_or(0))
            .await?;
        Ok(ServerEvent::NotificationsList {
            notifications: page.notifications,
            unread_count: page.unread_count,
            has_more: page.has_more,
        })
    }
}
