use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use chatsync_core::{EventKind, PushEvent, UserId};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    connection::{ConnectionManager, ConnectionState, Subscription},
    lock,
};

struct PresenceInner {
    online: Mutex<HashSet<UserId>>,
    revision: watch::Sender<u64>,
}

impl PresenceInner {
    fn replace(&self, roster: &[UserId]) {
        let next: HashSet<UserId> = roster.iter().cloned().collect();
        let changed = {
            let mut online = lock(&self.online);
            if *online == next {
                false
            } else {
                *online = next;
                true
            }
        };
        debug!(online = roster.len(), changed, "roster received");
        if changed {
            self.revision.send_modify(|r| *r += 1);
        }
    }

    fn clear(&self) {
        let changed = {
            let mut online = lock(&self.online);
            let had_entries = !online.is_empty();
            online.clear();
            had_entries
        };
        if changed {
            debug!("connection left connected state; presence cleared");
            self.revision.send_modify(|r| *r += 1);
        }
    }
}

/// Server-authoritative view of which peers are online.
///
/// Unknown peers read as offline, including before the first roster arrives.
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
    _roster: Subscription,
    _state: Subscription,
}

impl PresenceTracker {
    pub fn new(connection: &ConnectionManager) -> Self {
        let (revision, _) = watch::channel(0);
        let inner = Arc::new(PresenceInner {
            online: Mutex::new(HashSet::new()),
            revision,
        });

        let roster = {
            let inner = Arc::clone(&inner);
            connection.on(EventKind::Roster, move |event| {
                if let PushEvent::Roster(ids) = event {
                    inner.replace(ids);
                }
            })
        };
        let state = {
            let inner = Arc::clone(&inner);
            connection.on_state(move |state| {
                if state != ConnectionState::Connected {
                    inner.clear();
                }
            })
        };

        Self {
            inner,
            _roster: roster,
            _state: state,
        }
    }

    pub fn is_online(&self, peer_id: &str) -> bool {
        lock(&self.inner.online).contains(peer_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = lock(&self.inner.online).iter().cloned().collect();
        users.sort();
        users
    }

    pub fn online_count(&self) -> usize {
        lock(&self.inner.online).len()
    }

    /// Bumps whenever the presence set actually changes.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Barrier,
        thread,
        time::Duration,
    };

    use super::*;
    use crate::connection::ConnectionConfig;

    fn roster(ids: &[&str]) -> PushEvent {
        PushEvent::Roster(ids.iter().map(|id| (*id).to_owned()).collect())
    }

    #[test]
    fn unknown_peers_are_offline_before_first_roster() {
        let connection = ConnectionManager::new(ConnectionConfig::default());
        let presence = PresenceTracker::new(&connection);
        assert!(!presence.is_online("u1"));
        assert!(presence.online_users().is_empty());
    }

    #[test]
    fn roster_replaces_previous_set() {
        let connection = ConnectionManager::new(ConnectionConfig::default());
        let presence = PresenceTracker::new(&connection);
        connection.force_state(ConnectionState::Connected);

        connection.emit(&roster(&["A"]));
        assert!(presence.is_online("A"));

        connection.emit(&roster(&["B"]));
        assert!(!presence.is_online("A"));
        assert_eq!(presence.online_users(), vec!["B".to_owned()]);
    }

    #[test]
    fn connection_loss_clears_immediately() {
        let connection = ConnectionManager::new(ConnectionConfig::default());
        let presence = PresenceTracker::new(&connection);
        connection.force_state(ConnectionState::Connected);
        connection.emit(&roster(&["u1", "u2"]));
        assert_eq!(presence.online_count(), 2);

        connection.force_state(ConnectionState::Connecting);
        assert!(!presence.is_online("u1"));
        assert_eq!(presence.online_count(), 0);
    }

    #[test]
    fn identical_roster_does_not_bump_revision() {
        let connection = ConnectionManager::new(ConnectionConfig::default());
        let presence = PresenceTracker::new(&connection);
        let revision = presence.watch_revision();

        connection.emit(&roster(&["u1", "u2"]));
        assert_eq!(*revision.borrow(), 1);
        connection.emit(&roster(&["u2", "u1"]));
        assert_eq!(*revision.borrow(), 1);
    }

    #[test]
    fn roster_in_flight_during_close_does_not_outlive_it() {
        let connection = ConnectionManager::new(ConnectionConfig::default());
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let _slow_handler = {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            connection.on(EventKind::Roster, move |_| {
                entered.wait();
                release.wait();
            })
        };
        let presence = PresenceTracker::new(&connection);
        connection.force_state(ConnectionState::Connected);

        let emitter = {
            let connection = connection.clone();
            thread::spawn(move || connection.emit(&roster(&["u1"])))
        };
        entered.wait();
        let closer = {
            let connection = connection.clone();
            thread::spawn(move || connection.close())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!closer.is_finished());

        release.wait();
        emitter.join().unwrap();
        closer.join().unwrap();

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!presence.is_online("u1"));
        assert_eq!(presence.online_count(), 0);
    }

    #[test]
    fn dropping_tracker_detaches_its_handlers() {
        let connection = ConnectionManager::new(ConnectionConfig::default());
        let presence = PresenceTracker::new(&connection);
        assert_eq!(connection.listener_count(EventKind::Roster), 1);
        drop(presence);
        assert_eq!(connection.listener_count(EventKind::Roster), 0);
    }
}
