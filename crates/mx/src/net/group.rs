use std::fmt;

use super::session::SessionId;

/// A logical identity shared by one or more sessions, e.g. a player reachable
/// from several endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGroup {
    identifier: String,
    members: Vec<SessionId>,
}

impl SessionGroup {
    /// Identifier of the default bucket every new session starts in.
    pub const UNGROUPED: &'static str = "";

    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            members: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_ungrouped(&self) -> bool {
        self.identifier == Self::UNGROUPED
    }

    pub fn members(&self) -> &[SessionId] {
        &self.members
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.members.contains(&session)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn attach(&mut self, session: SessionId) {
        if !self.contains(session) {
            self.members.push(session);
        }
    }

    pub(crate) fn detach(&mut self, session: SessionId) -> bool {
        let before = self.members.len();
        self.members.retain(|&member| member != session);
        self.members.len() != before
    }
}

impl fmt::Display for SessionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ungrouped() {
            write!(f, "<UNGROUPED>")
        } else {
            write!(f, "{}", self.identifier)
        }
    }
}
