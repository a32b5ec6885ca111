use serde::{Deserialize, Serialize};

/// Role tags that gate view capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    BroadcastSender,
    Teacher,
    Student,
}

/// Identity of the signed-in user, passed explicitly to every component of a
/// view session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub display_name: String,
    pub roles: Vec<Role>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Whether the user may post to the broadcast conversation.
    pub fn can_broadcast(&self) -> bool {
        self.has_role(Role::Admin) || self.has_role(Role::BroadcastSender)
    }
}
