//! Deployment-specific messaging policy.
//!
//! The broadcast eligibility role list and the join-notice wording are
//! domain defaults, not invariants, so they are injected at construction
//! rather than hard-coded in the service.

/// Policy knobs for the messaging service.
#[derive(Debug, Clone)]
pub struct MessagingPolicy {
    /// Domain roles whose active users are auto-enrolled into a new
    /// broadcast channel.
    pub broadcast_eligible_roles: Vec<String>,

    /// Suffix of the system message announcing joined participants, e.g.
    /// `"<names> joined the conversation"`.
    pub join_notice: String,
}

impl Default for MessagingPolicy {
    fn default() -> Self {
        Self {
            broadcast_eligible_roles: vec![
                "admin".to_string(),
                "staff".to_string(),
                "member".to_string(),
            ],
            join_notice: "joined the conversation".to_string(),
        }
    }
}
