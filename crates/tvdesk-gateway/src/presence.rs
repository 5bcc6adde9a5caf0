//! Global presence: the live, derived list of connected identities.

use std::collections::HashMap;

use tvdesk_types::models::Identity;

use crate::registry::ConnectionRegistry;

/// Current presence snapshot.
///
/// One entry per `userId`. A user with several connections keeps the position
/// of their first connection and the identity of their latest one.
pub fn snapshot(registry: &ConnectionRegistry) -> Vec<Identity> {
    dedupe_by_user(registry.ordered().into_iter().map(|c| &c.identity))
}

pub(crate) fn dedupe_by_user<'a>(identities: impl IntoIterator<Item = &'a Identity>) -> Vec<Identity> {
    let mut out: Vec<Identity> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for identity in identities {
        match index.get(identity.user_id.as_str()) {
            Some(&i) => out[i] = identity.clone(),
            None => {
                index.insert(identity.user_id.as_str(), out.len());
                out.push(identity.clone());
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tvdesk_types::models::Role;
    use uuid::Uuid;

    fn identity(user_id: &str, name: &str) -> Identity {
        Identity {
            user_id: user_id.into(),
            role: Role::User,
            display_name: name.into(),
        }
    }

    #[test]
    fn snapshot_follows_registration_order() {
        let mut registry = ConnectionRegistry::default();
        for user in ["c", "a", "b"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.insert(Uuid::new_v4(), identity(user, user), tx);
        }
        let ids: Vec<String> = snapshot(&registry).into_iter().map(|i| i.user_id).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn duplicate_users_collapse_last_write_wins() {
        let list = [
            identity("u1", "Old name"),
            identity("u2", "Bo"),
            identity("u1", "New name"),
        ];
        let deduped = dedupe_by_user(&list);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].user_id, "u1");
        assert_eq!(deduped[0].display_name, "New name");
        assert_eq!(deduped[1].user_id, "u2");
    }

    #[test]
    fn removed_connections_leave_the_snapshot() {
        let mut registry = ConnectionRegistry::default();
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert(keep, identity("u1", "Ana"), tx.clone());
        registry.insert(gone, identity("u2", "Bo"), tx);
        registry.remove(gone);

        let snap = snapshot(&registry);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].user_id, "u1");
    }
}
