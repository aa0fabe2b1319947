use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::{
    config::AdminPolicy,
    session::{Role, Session, SessionId},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("username cannot be empty")]
    Empty,
    #[error("username '{0}' is already taken")]
    Taken(String),
    #[error("session {0} is not registered")]
    UnknownSession(SessionId),
}

/// Every live session, keyed by id, plus a name index.
///
/// Session ids grow in accept order, so iterating the ordered map yields
/// sessions oldest first. The registry is owned by the relay task and is only
/// touched from there, which makes each check-then-set below atomic with
/// respect to every other message.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: BTreeMap<SessionId, Session>,
    names: HashMap<String, SessionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    /// Gives a session its display name, activating it on first success.
    ///
    /// Leading and trailing whitespace is ignored. Re-assigning the name a
    /// session already holds succeeds; a rename releases the old name.
    pub fn assign_name(&mut self, id: SessionId, name: &str) -> Result<(), NameError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if let Some(holder) = self.names.get(name) {
            if *holder != id {
                return Err(NameError::Taken(name.to_string()));
            }
        }

        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(NameError::UnknownSession(id))?;
        if let Some(previous) = session.display_name() {
            self.names.remove(previous);
        }
        session.set_name(name.to_string());
        self.names.insert(name.to_string(), id);
        Ok(())
    }

    /// Looks a name up the way [`Registry::assign_name`] stores it.
    pub fn find_by_name(&self, name: &str) -> Option<&Session> {
        self.names.get(name.trim()).and_then(|id| self.sessions.get(id))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Drops a session and its name. Removing twice is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let mut session = self.sessions.remove(&id)?;
        if let Some(name) = session.display_name() {
            self.names.remove(name);
        }
        session.mark_closed();
        Some(session)
    }

    /// Sessions in connection order.
    pub fn all(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub(crate) fn all_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn active(&self) -> impl Iterator<Item = &Session> {
        self.all().filter(|session| session.is_active())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn admin_holder(&self) -> Option<&Session> {
        self.all().find(|session| session.is_admin())
    }

    /// Grants the admin role if `policy` allows it and nobody else holds it.
    pub fn grant_admin(&mut self, id: SessionId, policy: AdminPolicy) -> bool {
        if let Some(holder) = self.admin_holder() {
            return holder.id() == id;
        }

        let eligible = match policy {
            AdminPolicy::OldestConnection => self.sessions.keys().next() == Some(&id),
            AdminPolicy::FirstRequester => self.sessions.contains_key(&id),
        };
        if !eligible {
            return false;
        }

        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.set_role(Role::Admin);
                true
            }
            None => false,
        }
    }
}
