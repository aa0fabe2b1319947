//! Server-side command dispatch.
//!
//! [`Router::handle`] takes one decoded message from one session and decides
//! what happens: it updates the [`Registry`] where the message changes state
//! (names, admin role) and returns the ordered list of [`Action`]s the relay
//! must carry out. It never touches a transport itself.

use tracing::{debug, info, warn};

use crate::{
    config::AdminPolicy,
    message::{ClientMessage, ServerMessage},
    registry::Registry,
    session::SessionId,
};

pub const WELCOME: &str = "Welcome to the chat!";

pub const USAGE: &str = "\
Commands:
:EXIT                    quit the client
:HELP                    print this help
:NAME name               change your username
:PRIVATE name message    send a private message
:ADMIN                   request admin rights
:KICK name               remove a user (admin only)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue a message on a session's connection.
    Send {
        to: SessionId,
        message: ServerMessage,
    },
    /// Close the session's connection once its queued frames are flushed and
    /// drop it from the registry right away.
    Close { target: SessionId },
}

impl Action {
    fn send(to: SessionId, message: ServerMessage) -> Self {
        Action::Send { to, message }
    }

    fn info(to: SessionId, data: impl Into<String>) -> Self {
        Action::Send {
            to,
            message: ServerMessage::info(data),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Router {
    admin_policy: AdminPolicy,
}

impl Router {
    pub fn new(admin_policy: AdminPolicy) -> Self {
        Self { admin_policy }
    }

    pub fn admin_policy(&self) -> AdminPolicy {
        self.admin_policy
    }

    pub fn handle(
        &self,
        registry: &mut Registry,
        from: SessionId,
        message: ClientMessage,
    ) -> Vec<Action> {
        if registry.get(from).is_none() {
            debug!(session = %from, kind = message.kind(), "message from unregistered session");
            return Vec::new();
        }

        match message {
            ClientMessage::ChangeUsername { data } => change_username(registry, from, &data),
            ClientMessage::Message { data, .. } => broadcast(registry, from, data),
            ClientMessage::PrivateMessage { data, receiver, .. } => {
                private_message(registry, from, &receiver, data)
            }
            ClientMessage::RequestAdminRights => self.request_admin(registry, from),
            ClientMessage::KickUser { data, .. } => kick_user(registry, from, &data),
            ClientMessage::Help => vec![Action::info(from, USAGE)],
            ClientMessage::Unknown => {
                warn!(session = %from, "unknown message type");
                vec![Action::info(from, "unknown message type")]
            }
        }
    }

    fn request_admin(&self, registry: &mut Registry, from: SessionId) -> Vec<Action> {
        if registry.grant_admin(from, self.admin_policy) {
            info!(session = %from, policy = ?self.admin_policy, "admin rights granted");
            vec![Action::info(from, "you are now the admin")]
        } else {
            vec![Action::info(from, "admin request denied")]
        }
    }
}

fn change_username(registry: &mut Registry, from: SessionId, name: &str) -> Vec<Action> {
    match registry.assign_name(from, name) {
        Ok(()) => {
            let name = registry
                .get(from)
                .and_then(|session| session.display_name())
                .unwrap_or_default()
                .to_string();
            info!(session = %from, %name, "username changed");
            vec![Action::send(from, ServerMessage::UsernameChanged { data: name })]
        }
        Err(err) => vec![Action::send(
            from,
            ServerMessage::UsernameRejected {
                data: err.to_string(),
            },
        )],
    }
}

// The sender field always carries the registered name, whatever the client put
// there.
fn sender_name(registry: &Registry, from: SessionId) -> Option<String> {
    registry
        .get(from)
        .and_then(|session| session.display_name())
        .map(str::to_string)
}

fn broadcast(registry: &Registry, from: SessionId, data: String) -> Vec<Action> {
    let Some(sender) = sender_name(registry, from) else {
        debug!(session = %from, "ignoring chat message from unnamed session");
        return Vec::new();
    };

    let message = ServerMessage::Message {
        data,
        sender: Some(sender),
    };
    registry
        .active()
        .filter(|session| session.id() != from)
        .map(|session| Action::send(session.id(), message.clone()))
        .collect()
}

fn private_message(
    registry: &Registry,
    from: SessionId,
    receiver: &str,
    data: String,
) -> Vec<Action> {
    let receiver = receiver.trim();
    match registry.find_by_name(receiver) {
        Some(target) => vec![Action::send(
            target.id(),
            ServerMessage::PrivateMessage {
                data,
                sender: sender_name(registry, from),
            },
        )],
        None => vec![Action::info(
            from,
            format!("recipient '{receiver}' not found"),
        )],
    }
}

fn kick_user(registry: &Registry, from: SessionId, target_name: &str) -> Vec<Action> {
    let target_name = target_name.trim();
    let is_admin = registry
        .get(from)
        .is_some_and(|session| session.is_admin());
    if !is_admin {
        return vec![Action::info(from, "not authorized")];
    }

    let target = match registry.find_by_name(target_name) {
        Some(target) => target.id(),
        None => return vec![Action::info(from, format!("user '{target_name}' not found"))],
    };
    if target == from {
        return vec![Action::info(from, "you cannot kick yourself")];
    }

    info!(session = %from, target = %target, name = target_name, "kicking user");
    vec![
        Action::info(target, "you have been removed from the chat"),
        Action::Close { target },
        Action::info(from, format!("user '{target_name}' removed")),
    ]
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::Session;

    fn registry_with(count: u64) -> Registry {
        let mut registry = Registry::new();
        for id in 1..=count {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register(Session::new(SessionId(id), None, tx, false));
        }
        registry
    }

    fn named(names: &[&str]) -> Registry {
        let mut registry = registry_with(names.len() as u64);
        for (index, name) in names.iter().enumerate() {
            registry
                .assign_name(SessionId(index as u64 + 1), name)
                .expect("unique test names");
        }
        registry
    }

    fn recipients(actions: &[Action]) -> Vec<SessionId> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send { to, .. } => Some(*to),
                Action::Close { .. } => None,
            })
            .collect()
    }

    fn chat(data: &str) -> ClientMessage {
        ClientMessage::Message {
            data: data.into(),
            sender: None,
        }
    }

    #[test]
    fn duplicate_name_is_rejected_then_retry_succeeds() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = registry_with(2);

        router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::ChangeUsername {
                data: "alice".into(),
            },
        );
        let rejected = router.handle(
            &mut registry,
            SessionId(2),
            ClientMessage::ChangeUsername {
                data: "alice".into(),
            },
        );
        assert!(matches!(
            rejected.as_slice(),
            [Action::Send { to: SessionId(2), message: ServerMessage::UsernameRejected { data } }]
                if data.contains("already taken")
        ));
        assert_eq!(registry.get(SessionId(2)).and_then(|s| s.display_name()), None);

        let accepted = router.handle(
            &mut registry,
            SessionId(2),
            ClientMessage::ChangeUsername { data: "bob".into() },
        );
        assert_eq!(
            accepted,
            vec![Action::send(
                SessionId(2),
                ServerMessage::UsernameChanged { data: "bob".into() }
            )]
        );
    }

    #[test]
    fn broadcast_reaches_every_other_active_session_once() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob", "carol"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(Session::new(SessionId(4), None, tx, false));

        let actions = router.handle(&mut registry, SessionId(1), chat("hi all"));

        assert_eq!(recipients(&actions), vec![SessionId(2), SessionId(3)]);
        for action in &actions {
            assert!(matches!(
                action,
                Action::Send { message: ServerMessage::Message { data, sender: Some(sender) }, .. }
                    if data == "hi all" && sender == "alice"
            ));
        }
    }

    #[test]
    fn broadcast_uses_registered_name_not_client_claim() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob"]);

        let actions = router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::Message {
                data: "hello".into(),
                sender: Some("mallory".into()),
            },
        );

        assert_eq!(
            actions,
            vec![Action::send(
                SessionId(2),
                ServerMessage::Message {
                    data: "hello".into(),
                    sender: Some("alice".into())
                }
            )]
        );
    }

    #[test]
    fn unnamed_sender_cannot_broadcast() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(Session::new(SessionId(2), None, tx, false));

        assert!(router.handle(&mut registry, SessionId(2), chat("anyone?")).is_empty());
    }

    #[test]
    fn private_message_goes_to_the_receiver_only() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob", "carol"]);

        let actions = router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::PrivateMessage {
                data: "psst".into(),
                receiver: "carol".into(),
                sender: None,
            },
        );

        assert_eq!(
            actions,
            vec![Action::send(
                SessionId(3),
                ServerMessage::PrivateMessage {
                    data: "psst".into(),
                    sender: Some("alice".into())
                }
            )]
        );
    }

    #[test]
    fn private_message_to_unknown_name_informs_sender_only() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob"]);

        let actions = router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::PrivateMessage {
                data: "psst".into(),
                receiver: "nobody".into(),
                sender: None,
            },
        );

        assert_eq!(recipients(&actions), vec![SessionId(1)]);
        assert!(matches!(
            &actions[0],
            Action::Send { message: ServerMessage::Info { data }, .. } if data.contains("not found")
        ));
    }

    #[test]
    fn kick_from_non_admin_is_denied_and_target_untouched() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob"]);

        let actions = router.handle(
            &mut registry,
            SessionId(2),
            ClientMessage::KickUser {
                data: "alice".into(),
                sender: None,
            },
        );

        assert_eq!(actions, vec![Action::info(SessionId(2), "not authorized")]);
        assert!(registry.find_by_name("alice").is_some());
    }

    #[test]
    fn kick_by_admin_notifies_closes_then_confirms() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob"]);
        router.handle(&mut registry, SessionId(1), ClientMessage::RequestAdminRights);

        let actions = router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::KickUser {
                data: "bob".into(),
                sender: None,
            },
        );

        assert_eq!(
            actions,
            vec![
                Action::info(SessionId(2), "you have been removed from the chat"),
                Action::Close {
                    target: SessionId(2)
                },
                Action::info(SessionId(1), "user 'bob' removed"),
            ]
        );
    }

    #[test]
    fn lookups_ignore_surrounding_whitespace_like_names_do() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob", "carol"]);
        router.handle(&mut registry, SessionId(1), ClientMessage::RequestAdminRights);

        let private = router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::PrivateMessage {
                data: "psst".into(),
                receiver: " carol".into(),
                sender: None,
            },
        );
        assert_eq!(recipients(&private), vec![SessionId(3)]);

        let kick = router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::KickUser {
                data: "bob ".into(),
                sender: None,
            },
        );
        assert_eq!(
            kick,
            vec![
                Action::info(SessionId(2), "you have been removed from the chat"),
                Action::Close {
                    target: SessionId(2)
                },
                Action::info(SessionId(1), "user 'bob' removed"),
            ]
        );
    }

    #[test]
    fn kick_of_missing_user_reports_not_found() {
        let router = Router::new(AdminPolicy::FirstRequester);
        let mut registry = named(&["alice"]);
        router.handle(&mut registry, SessionId(1), ClientMessage::RequestAdminRights);

        let actions = router.handle(
            &mut registry,
            SessionId(1),
            ClientMessage::KickUser {
                data: "ghost".into(),
                sender: None,
            },
        );

        assert_eq!(actions, vec![Action::info(SessionId(1), "user 'ghost' not found")]);
    }

    #[test]
    fn oldest_connection_wins_admin() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = named(&["alice", "bob"]);

        let second = router.handle(&mut registry, SessionId(2), ClientMessage::RequestAdminRights);
        let first = router.handle(&mut registry, SessionId(1), ClientMessage::RequestAdminRights);

        assert_eq!(second, vec![Action::info(SessionId(2), "admin request denied")]);
        assert_eq!(first, vec![Action::info(SessionId(1), "you are now the admin")]);
    }

    #[test]
    fn first_requester_wins_admin() {
        let router = Router::new(AdminPolicy::FirstRequester);
        let mut registry = named(&["alice", "bob"]);

        let second = router.handle(&mut registry, SessionId(2), ClientMessage::RequestAdminRights);
        let first = router.handle(&mut registry, SessionId(1), ClientMessage::RequestAdminRights);

        assert_eq!(second, vec![Action::info(SessionId(2), "you are now the admin")]);
        assert_eq!(first, vec![Action::info(SessionId(1), "admin request denied")]);
    }

    #[test]
    fn help_and_unknown_reply_with_info() {
        let router = Router::new(AdminPolicy::OldestConnection);
        let mut registry = registry_with(1);

        assert_eq!(
            router.handle(&mut registry, SessionId(1), ClientMessage::Help),
            vec![Action::info(SessionId(1), USAGE)]
        );
        assert_eq!(
            router.handle(&mut registry, SessionId(1), ClientMessage::Unknown),
            vec![Action::info(SessionId(1), "unknown message type")]
        );
    }
}
