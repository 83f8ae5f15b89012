//! Staffer and user directories plus the active session set.
//!
//! Owned by the dispatcher task and mutated nowhere else. Both directories
//! are ordered maps so that every scan visits accounts in the same order.

use std::collections::BTreeMap;
use std::sync::Arc;

use hotline_core::{ConnectionId, SessionId};
use serde::Serialize;

use crate::channel::ChannelHandle;

/// Which directory a record lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Service agent who accepts calls.
    Staffer,
    /// Caller looking for a staffer.
    User,
}

impl Role {
    /// Lowercase label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staffer => "staffer",
            Self::User => "user",
        }
    }
}

/// Lifecycle of a participant record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParticipantState {
    /// Not yet initialised.
    #[default]
    Unknown,
    /// Removed from the directory after its connection broke.
    Offline,
    /// Logged in and free.
    Idle,
    /// Part of a session.
    Busy,
}

/// One logged-in staffer or user.
#[derive(Clone, Debug)]
pub struct Participant {
    /// Connection the record is bound to.
    pub channel: Arc<ChannelHandle>,
    /// Account identifier, unique within the role.
    pub account: String,
    /// Affinity tag.
    pub agent: String,
    /// Lifecycle state.
    pub state: ParticipantState,
    /// Sequence number of the last transition to idle. Lower means idle longer.
    pub idle_since: u64,
}

impl Participant {
    /// Whether this record is bound to `conn`.
    pub fn is_on(&self, conn: &ConnectionId) -> bool {
        self.channel.id() == conn
    }
}

/// A matched staffer/user pair relaying traffic.
#[derive(Clone, Debug)]
pub struct Session {
    /// Session identity, for logs.
    pub id: SessionId,
    /// Staffer account.
    pub staffer: String,
    /// User account.
    pub user: String,
    /// Staffer's connection.
    pub staffer_channel: Arc<ChannelHandle>,
    /// User's connection.
    pub user_channel: Arc<ChannelHandle>,
}

impl Session {
    /// Whether `conn` is either side of this session.
    pub fn involves(&self, conn: &ConnectionId) -> bool {
        self.staffer_channel.id() == conn || self.user_channel.id() == conn
    }

    /// The side of the session that is not `conn`.
    pub fn peer_of(&self, conn: &ConnectionId) -> Option<(Role, &Arc<ChannelHandle>)> {
        if self.staffer_channel.id() == conn {
            Some((Role::User, &self.user_channel))
        } else if self.user_channel.id() == conn {
            Some((Role::Staffer, &self.staffer_channel))
        } else {
            None
        }
    }
}

/// Counts published after every dispatcher step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryStats {
    /// Logged-in staffers.
    pub staffers: usize,
    /// Logged-in users.
    pub users: usize,
    /// Live sessions.
    pub sessions: usize,
}

/// Directories and sessions.
#[derive(Debug, Default)]
pub struct Directory {
    staffers: BTreeMap<String, Participant>,
    users: BTreeMap<String, Participant>,
    sessions: Vec<Session>,
    idle_seq: u64,
}

impl Directory {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self, role: Role) -> &BTreeMap<String, Participant> {
        match role {
            Role::Staffer => &self.staffers,
            Role::User => &self.users,
        }
    }

    fn book_mut(&mut self, role: Role) -> &mut BTreeMap<String, Participant> {
        match role {
            Role::Staffer => &mut self.staffers,
            Role::User => &mut self.users,
        }
    }

    fn next_idle_seq(&mut self) -> u64 {
        self.idle_seq += 1;
        self.idle_seq
    }

    /// Whether `account` is registered under `role`.
    pub fn contains(&self, role: Role, account: &str) -> bool {
        self.book(role).contains_key(account)
    }

    /// Look up a record.
    pub fn get(&self, role: Role, account: &str) -> Option<&Participant> {
        self.book(role).get(account)
    }

    /// Staffer records in account order.
    pub fn staffers(&self) -> impl Iterator<Item = &Participant> {
        self.staffers.values()
    }

    /// Register a new idle record. Returns `false` and changes nothing if the
    /// account is taken.
    pub fn register(
        &mut self,
        role: Role,
        channel: Arc<ChannelHandle>,
        account: &str,
        agent: &str,
    ) -> bool {
        if self.contains(role, account) {
            return false;
        }
        let idle_since = self.next_idle_seq();
        let record = Participant {
            channel,
            account: account.to_owned(),
            agent: agent.to_owned(),
            state: ParticipantState::Idle,
            idle_since,
        };
        let _ = self.book_mut(role).insert(account.to_owned(), record);
        true
    }

    /// Move a record back to idle, restarting its idle clock.
    pub fn mark_idle(&mut self, role: Role, account: &str) {
        let seq = self.next_idle_seq();
        if let Some(p) = self.book_mut(role).get_mut(account) {
            if p.state != ParticipantState::Idle {
                p.state = ParticipantState::Idle;
                p.idle_since = seq;
            }
        }
    }

    /// Mark a record busy.
    pub fn mark_busy(&mut self, role: Role, account: &str) {
        if let Some(p) = self.book_mut(role).get_mut(account) {
            p.state = ParticipantState::Busy;
        }
    }

    /// Pair a staffer and a user. Both must be registered; both become busy.
    pub fn begin_session(&mut self, staffer: &str, user: &str) -> Option<&Session> {
        let staffer_channel = Arc::clone(&self.staffers.get(staffer)?.channel);
        let user_channel = Arc::clone(&self.users.get(user)?.channel);
        self.mark_busy(Role::Staffer, staffer);
        self.mark_busy(Role::User, user);
        self.sessions.push(Session {
            id: SessionId::new(),
            staffer: staffer.to_owned(),
            user: user.to_owned(),
            staffer_channel,
            user_channel,
        });
        self.sessions.last()
    }

    /// The session `conn` takes part in, if any.
    pub fn session_for(&self, conn: &ConnectionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.involves(conn))
    }

    /// Remove and return the session `conn` takes part in.
    pub fn take_session_for(&mut self, conn: &ConnectionId) -> Option<Session> {
        let idx = self.sessions.iter().position(|s| s.involves(conn))?;
        Some(self.sessions.remove(idx))
    }

    /// Remove every record bound to `conn` from both directories.
    ///
    /// Returned records are marked [`ParticipantState::Offline`]. Calling
    /// this twice for the same connection returns nothing the second time.
    pub fn remove_channel(&mut self, conn: &ConnectionId) -> Vec<(Role, Participant)> {
        let mut removed = Vec::new();
        for role in [Role::Staffer, Role::User] {
            let book = self.book_mut(role);
            let accounts: Vec<String> = book
                .values()
                .filter(|p| p.is_on(conn))
                .map(|p| p.account.clone())
                .collect();
            for account in accounts {
                if let Some(mut p) = book.remove(&account) {
                    p.state = ParticipantState::Offline;
                    removed.push((role, p));
                }
            }
        }
        removed
    }

    /// Current counts.
    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            staffers: self.staffers.len(),
            users: self.users.len(),
            sessions: self.sessions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_channel;

    #[test]
    fn register_rejects_duplicate_account() {
        let mut dir = Directory::new();
        let (a, _ra) = test_channel();
        let (b, _rb) = test_channel();
        assert!(dir.register(Role::Staffer, a, "s1", "sales"));
        assert!(!dir.register(Role::Staffer, Arc::clone(&b), "s1", "support"));
        assert_eq!(dir.get(Role::Staffer, "s1").unwrap().agent, "sales");

        // Same account name in the other role is independent.
        assert!(dir.register(Role::User, b, "s1", "sales"));
        assert_eq!(dir.stats(), DirectoryStats { staffers: 1, users: 1, sessions: 0 });
    }

    #[test]
    fn new_records_are_idle() {
        let mut dir = Directory::new();
        let (a, _ra) = test_channel();
        assert!(dir.register(Role::User, a, "u1", "sales"));
        assert_eq!(dir.get(Role::User, "u1").unwrap().state, ParticipantState::Idle);
    }

    #[test]
    fn staffers_iterate_in_account_order() {
        let mut dir = Directory::new();
        let mut keep = Vec::new();
        for name in ["carol", "alice", "bob"] {
            let (ch, rx) = test_channel();
            keep.push(rx);
            assert!(dir.register(Role::Staffer, ch, name, "a"));
        }
        let order: Vec<&str> = dir.staffers().map(|p| p.account.as_str()).collect();
        assert_eq!(order, ["alice", "bob", "carol"]);
    }

    #[test]
    fn session_lifecycle() {
        let mut dir = Directory::new();
        let (s, _rs) = test_channel();
        let (u, _ru) = test_channel();
        let (other, _ro) = test_channel();
        assert!(dir.register(Role::Staffer, Arc::clone(&s), "s1", "a"));
        assert!(dir.register(Role::User, Arc::clone(&u), "u1", "a"));

        let session = dir.begin_session("s1", "u1").unwrap();
        assert!(session.involves(s.id()));
        assert!(session.involves(u.id()));
        assert!(!session.involves(other.id()));
        assert_eq!(dir.get(Role::Staffer, "s1").unwrap().state, ParticipantState::Busy);
        assert_eq!(dir.get(Role::User, "u1").unwrap().state, ParticipantState::Busy);

        let (peer_role, peer) = dir.session_for(u.id()).unwrap().peer_of(u.id()).unwrap();
        assert_eq!(peer_role, Role::Staffer);
        assert_eq!(peer.id(), s.id());

        let taken = dir.take_session_for(s.id()).unwrap();
        assert_eq!(taken.staffer, "s1");
        assert!(dir.session_for(u.id()).is_none());
        assert_eq!(dir.stats().sessions, 0);
    }

    #[test]
    fn begin_session_requires_both_parties() {
        let mut dir = Directory::new();
        let (s, _rs) = test_channel();
        assert!(dir.register(Role::Staffer, s, "s1", "a"));
        assert!(dir.begin_session("s1", "ghost").is_none());
        assert_eq!(dir.get(Role::Staffer, "s1").unwrap().state, ParticipantState::Idle);
    }

    #[test]
    fn mark_idle_restarts_idle_clock() {
        let mut dir = Directory::new();
        let (s, _rs) = test_channel();
        let (u, _ru) = test_channel();
        assert!(dir.register(Role::Staffer, s, "s1", "a"));
        assert!(dir.register(Role::User, u, "u1", "a"));
        let before = dir.get(Role::Staffer, "s1").unwrap().idle_since;

        let _ = dir.begin_session("s1", "u1");
        dir.mark_idle(Role::Staffer, "s1");
        let after = dir.get(Role::Staffer, "s1").unwrap();
        assert_eq!(after.state, ParticipantState::Idle);
        let after_seq = after.idle_since;
        assert!(after_seq > before);

        // Already idle: clock untouched.
        dir.mark_idle(Role::Staffer, "s1");
        assert_eq!(dir.get(Role::Staffer, "s1").unwrap().idle_since, after_seq);
    }

    #[test]
    fn remove_channel_scans_both_directories() {
        let mut dir = Directory::new();
        let (shared, _r1) = test_channel();
        let (other, _r2) = test_channel();
        assert!(dir.register(Role::Staffer, Arc::clone(&shared), "s1", "a"));
        assert!(dir.register(Role::User, Arc::clone(&shared), "u1", "a"));
        assert!(dir.register(Role::User, other, "u2", "a"));

        let removed = dir.remove_channel(shared.id());
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|(_, p)| p.state == ParticipantState::Offline));
        assert!(!dir.contains(Role::Staffer, "s1"));
        assert!(!dir.contains(Role::User, "u1"));
        assert!(dir.contains(Role::User, "u2"));

        assert!(dir.remove_channel(shared.id()).is_empty());
    }

    #[test]
    fn one_connection_may_hold_several_records() {
        let mut dir = Directory::new();
        let (ch, _r) = test_channel();
        assert!(dir.register(Role::User, Arc::clone(&ch), "u1", "a"));
        assert!(dir.register(Role::User, Arc::clone(&ch), "u2", "a"));
        assert!(dir.register(Role::Staffer, Arc::clone(&ch), "s1", "a"));
        assert_eq!(dir.remove_channel(ch.id()).len(), 3);
    }
}
