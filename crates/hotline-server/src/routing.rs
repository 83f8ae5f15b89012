//! Pure matching decisions over a directory snapshot.

use hotline_core::{ConnectionId, ErrorCode};
use hotline_settings::SelectionPolicy;

use crate::directory::{Directory, Participant, ParticipantState, Role};

/// Whether `staffer` may take a call from `caller`.
///
/// Idle, same affinity tag, not the caller's own connection, and its
/// connection not already part of a session under another login.
pub fn is_eligible(directory: &Directory, staffer: &Participant, caller: &Participant) -> bool {
    staffer.state == ParticipantState::Idle
        && staffer.agent == caller.agent
        && staffer.channel.id() != caller.channel.id()
        && directory.session_for(staffer.channel.id()).is_none()
}

/// Pick a staffer for an unqualified call.
///
/// Candidates are visited in account order.
pub fn select_staffer<'a>(
    directory: &'a Directory,
    caller: &Participant,
    policy: SelectionPolicy,
) -> Option<&'a Participant> {
    let mut eligible = directory
        .staffers()
        .filter(|s| is_eligible(directory, s, caller));
    match policy {
        SelectionPolicy::LowestAccount => eligible.next(),
        SelectionPolicy::LongestIdle => eligible.min_by(|a, b| {
            a.idle_since
                .cmp(&b.idle_since)
                .then_with(|| a.account.cmp(&b.account))
        }),
    }
}

/// Check that `caller` is a user logged in on `conn` and free to call.
pub fn check_caller<'a>(
    directory: &'a Directory,
    caller: &str,
    conn: &ConnectionId,
) -> Result<&'a Participant, ErrorCode> {
    let record = directory
        .get(Role::User, caller)
        .filter(|p| p.is_on(conn))
        .ok_or(ErrorCode::UserNotLogin)?;
    if directory.session_for(conn).is_some() {
        return Err(ErrorCode::AllBusy);
    }
    Ok(record)
}

/// Resolve the staffer account a call should be routed to.
pub fn resolve_callee(
    directory: &Directory,
    caller: &Participant,
    callee: Option<&str>,
    policy: SelectionPolicy,
) -> Result<String, ErrorCode> {
    match callee {
        Some(account) => {
            let staffer = directory
                .get(Role::Staffer, account)
                .ok_or(ErrorCode::StafferNotLogin)?;
            if is_eligible(directory, staffer, caller) {
                Ok(staffer.account.clone())
            } else {
                Err(ErrorCode::AllBusy)
            }
        }
        None => select_staffer(directory, caller, policy)
            .map(|s| s.account.clone())
            .ok_or(ErrorCode::AllBusy),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::channel::test_channel;

    struct Fixture {
        dir: Directory,
        receivers: Vec<mpsc::Receiver<String>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: Directory::new(),
                receivers: Vec::new(),
            }
        }

        fn login(&mut self, role: Role, account: &str, agent: &str) -> ConnectionId {
            let (ch, rx) = test_channel();
            self.receivers.push(rx);
            let id = ch.id().clone();
            assert!(self.dir.register(role, ch, account, agent));
            id
        }

        fn user(&self, account: &str) -> &Participant {
            self.dir.get(Role::User, account).unwrap()
        }
    }

    #[test]
    fn lowest_account_picks_first_eligible() {
        let mut f = Fixture::new();
        let _ = f.login(Role::Staffer, "zed", "a");
        let _ = f.login(Role::Staffer, "amy", "b");
        let _ = f.login(Role::Staffer, "bob", "a");
        let _ = f.login(Role::User, "u1", "a");

        let picked = resolve_callee(&f.dir, f.user("u1"), None, SelectionPolicy::LowestAccount);
        assert_eq!(picked.unwrap(), "bob");
    }

    #[test]
    fn longest_idle_picks_oldest() {
        let mut f = Fixture::new();
        let _ = f.login(Role::Staffer, "bob", "a");
        let _ = f.login(Role::Staffer, "amy", "a");
        let _ = f.login(Role::User, "u1", "a");

        // bob registered first, so he has been idle longest.
        let picked = resolve_callee(&f.dir, f.user("u1"), None, SelectionPolicy::LongestIdle);
        assert_eq!(picked.unwrap(), "bob");

        // After a busy spell bob's idle clock restarts and amy wins.
        f.dir.mark_busy(Role::Staffer, "bob");
        f.dir.mark_idle(Role::Staffer, "bob");
        let picked = resolve_callee(&f.dir, f.user("u1"), None, SelectionPolicy::LongestIdle);
        assert_eq!(picked.unwrap(), "amy");
    }

    #[test]
    fn no_matching_agent_is_all_busy() {
        let mut f = Fixture::new();
        let _ = f.login(Role::Staffer, "s1", "b");
        let _ = f.login(Role::User, "u1", "a");
        let res = resolve_callee(&f.dir, f.user("u1"), None, SelectionPolicy::LowestAccount);
        assert_eq!(res, Err(ErrorCode::AllBusy));
    }

    #[test]
    fn busy_staffers_are_skipped() {
        let mut f = Fixture::new();
        let _ = f.login(Role::Staffer, "s1", "a");
        let _ = f.login(Role::Staffer, "s2", "a");
        let _ = f.login(Role::User, "u1", "a");
        f.dir.mark_busy(Role::Staffer, "s1");
        let res = resolve_callee(&f.dir, f.user("u1"), None, SelectionPolicy::LowestAccount);
        assert_eq!(res.unwrap(), "s2");
    }

    #[test]
    fn named_callee_errors() {
        let mut f = Fixture::new();
        let _ = f.login(Role::Staffer, "s1", "a");
        let _ = f.login(Role::Staffer, "s2", "b");
        let _ = f.login(Role::User, "u1", "a");
        let policy = SelectionPolicy::LowestAccount;

        assert_eq!(
            resolve_callee(&f.dir, f.user("u1"), Some("ghost"), policy),
            Err(ErrorCode::StafferNotLogin)
        );
        assert_eq!(
            resolve_callee(&f.dir, f.user("u1"), Some("s2"), policy),
            Err(ErrorCode::AllBusy)
        );
        assert_eq!(resolve_callee(&f.dir, f.user("u1"), Some("s1"), policy).unwrap(), "s1");

        f.dir.mark_busy(Role::Staffer, "s1");
        assert_eq!(
            resolve_callee(&f.dir, f.user("u1"), Some("s1"), policy),
            Err(ErrorCode::AllBusy)
        );
    }

    #[test]
    fn staffer_never_matched_to_own_connection() {
        let mut f = Fixture::new();
        let (ch, rx) = test_channel();
        f.receivers.push(rx);
        assert!(f.dir.register(Role::Staffer, Arc::clone(&ch), "s1", "a"));
        assert!(f.dir.register(Role::User, ch, "u1", "a"));
        let res = resolve_callee(&f.dir, f.user("u1"), None, SelectionPolicy::LowestAccount);
        assert_eq!(res, Err(ErrorCode::AllBusy));
    }

    #[test]
    fn staffer_whose_connection_is_in_session_is_skipped() {
        let mut f = Fixture::new();
        // One connection carries staffer "sa" and user "u1"; u1 is talking to sb.
        let (shared, rx) = test_channel();
        f.receivers.push(rx);
        assert!(f.dir.register(Role::Staffer, Arc::clone(&shared), "sa", "a"));
        assert!(f.dir.register(Role::User, shared, "u1", "a"));
        let _ = f.login(Role::Staffer, "sb", "a");
        let _ = f.login(Role::User, "u2", "a");
        assert!(f.dir.begin_session("sb", "u1").is_some());

        let policy = SelectionPolicy::LowestAccount;
        assert_eq!(resolve_callee(&f.dir, f.user("u2"), None, policy), Err(ErrorCode::AllBusy));
        assert_eq!(
            resolve_callee(&f.dir, f.user("u2"), Some("sa"), policy),
            Err(ErrorCode::AllBusy)
        );
    }

    #[test]
    fn caller_must_be_bound_to_connection() {
        let mut f = Fixture::new();
        let conn = f.login(Role::User, "u1", "a");
        let elsewhere = f.login(Role::User, "u2", "a");

        assert!(check_caller(&f.dir, "u1", &conn).is_ok());
        assert_eq!(check_caller(&f.dir, "u1", &elsewhere).unwrap_err(), ErrorCode::UserNotLogin);
        assert_eq!(check_caller(&f.dir, "ghost", &conn).unwrap_err(), ErrorCode::UserNotLogin);
    }

    #[test]
    fn caller_in_session_is_all_busy() {
        let mut f = Fixture::new();
        let _ = f.login(Role::Staffer, "s1", "a");
        let conn = f.login(Role::User, "u1", "a");
        let _ = f.dir.begin_session("s1", "u1");
        assert_eq!(check_caller(&f.dir, "u1", &conn).unwrap_err(), ErrorCode::AllBusy);
    }
}
