//! The role/action permission table.
//!
//! Evaluated once per operation instead of scattering role comparisons
//! through the service. Settings-dependent rules (broadcast posting) are
//! layered on top by the service, which knows the conversation settings.

use palaver_store::ParticipantRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendMessage,
    AddParticipants,
    ManageRoles,
    React,
}

/// Whether `role` may perform `action`, independent of conversation
/// settings.
pub fn role_allows(role: ParticipantRole, action: Action) -> bool {
    use Action::*;
    use ParticipantRole::*;

    match (role, action) {
        (Muted, SendMessage | React) => false,
        (_, SendMessage | React) => true,
        (Admin | Moderator, AddParticipants) => true,
        (_, AddParticipants) => false,
        (Admin, ManageRoles) => true,
        (_, ManageRoles) => false,
    }
}

/// Roles allowed to post when a broadcast channel restricts posting.
pub fn may_post_restricted(role: ParticipantRole) -> bool {
    matches!(role, ParticipantRole::Admin | ParticipantRole::Moderator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParticipantRole::*;

    #[test]
    fn test_muted_never_sends() {
        assert!(!role_allows(Muted, Action::SendMessage));
        assert!(!role_allows(Muted, Action::React));
    }

    #[test]
    fn test_management_requires_admin_or_moderator() {
        assert!(role_allows(Admin, Action::AddParticipants));
        assert!(role_allows(Moderator, Action::AddParticipants));
        assert!(!role_allows(Member, Action::AddParticipants));
        assert!(!role_allows(ReadOnly, Action::AddParticipants));

        assert!(role_allows(Admin, Action::ManageRoles));
        assert!(!role_allows(Moderator, Action::ManageRoles));
    }

    #[test]
    fn test_restricted_posting_roles() {
        assert!(may_post_restricted(Admin));
        assert!(may_post_restricted(Moderator));
        assert!(!may_post_restricted(Member));
        assert!(!may_post_restricted(ReadOnly));
    }
}
