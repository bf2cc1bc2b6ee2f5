//! The persistence interface the messaging service is written against.
//!
//! The production backend is a relational database owned by another system;
//! everything this core needs from it is captured here. Implementations must
//! make each method atomic on its own; callers rely on per-operation
//! atomicity, not on application-level locking.

use chrono::{DateTime, Utc};

use palaver_shared::types::{ConversationId, MessageId, UserId};

use crate::error::Result;
use crate::models::{Conversation, Message, Participant, ParticipantRole, Reaction, User};

pub trait ConversationStore: Send + Sync {
    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Atomically create a conversation together with its participant rows.
    ///
    /// For a DIRECT conversation, implementations must reject a second
    /// conversation over the same unordered user pair with
    /// [`crate::StoreError::Conflict`].
    fn create_conversation(
        &self,
        conversation: Conversation,
        participants: Vec<Participant>,
    ) -> Result<()>;

    fn conversation(&self, id: ConversationId) -> Result<Conversation>;

    /// Bump `updated_at`, used for conversation-list ordering.
    fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()>;

    /// Find the DIRECT conversation whose full participant set is exactly
    /// `{a, b}`. Lookup is order-independent and ignores `is_active`.
    fn find_direct_conversation(&self, a: &UserId, b: &UserId) -> Result<Option<Conversation>>;

    /// Conversations where `user` has an active participant row.
    fn conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>>;

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    fn participants(&self, id: ConversationId) -> Result<Vec<Participant>>;

    fn participant(&self, id: ConversationId, user: &UserId) -> Result<Option<Participant>>;

    /// Insert a participant row. Returns `false` (and leaves the existing
    /// row untouched) if the user is already a participant.
    fn add_participant(&self, participant: Participant) -> Result<bool>;

    fn set_participant_active(
        &self,
        id: ConversationId,
        user: &UserId,
        active: bool,
    ) -> Result<()>;

    fn set_participant_role(
        &self,
        id: ConversationId,
        user: &UserId,
        role: ParticipantRole,
    ) -> Result<()>;

    fn set_last_read(&self, id: ConversationId, user: &UserId, at: DateTime<Utc>) -> Result<()>;

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    fn insert_message(&self, message: Message) -> Result<()>;

    fn message(&self, id: MessageId) -> Result<Message>;

    /// All messages of a conversation in creation order.
    fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>>;

    fn last_message(&self, conversation: ConversationId) -> Result<Option<Message>>;

    /// Count messages created strictly after `since`, excluding those sent
    /// by `user`.
    fn unread_count(
        &self,
        conversation: ConversationId,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Append `user` to `read_by` on every message of the conversation not
    /// sent by `user` and not already read by them. Returns the number of
    /// messages changed.
    fn mark_messages_read(&self, conversation: ConversationId, user: &UserId) -> Result<u64>;

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    fn reaction(&self, message: MessageId, user: &UserId) -> Result<Option<Reaction>>;

    fn insert_reaction(&self, reaction: Reaction) -> Result<()>;

    fn update_reaction(&self, message: MessageId, user: &UserId, emoji: &str) -> Result<()>;

    /// Returns `true` if a reaction row was deleted.
    fn delete_reaction(&self, message: MessageId, user: &UserId) -> Result<bool>;

    fn reactions_for_message(&self, message: MessageId) -> Result<Vec<Reaction>>;

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    fn user(&self, id: &UserId) -> Result<Option<User>>;

    fn upsert_user(&self, user: User) -> Result<()>;

    /// Active users whose domain role is one of `roles`.
    fn users_by_roles(&self, roles: &[String]) -> Result<Vec<User>>;
}
