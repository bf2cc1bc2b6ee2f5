//! Domain model structs persisted through the [`crate::ConversationStore`]
//! interface.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to an API or UI layer.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use palaver_shared::types::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationType {
    Direct,
    Group,
    Broadcast,
}

/// Settings for a broadcast channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSettings {
    pub only_admins_can_post: bool,
    pub allow_reactions: bool,
    pub allow_replies: bool,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            only_admins_can_post: true,
            allow_reactions: true,
            allow_replies: false,
        }
    }
}

/// Caller-supplied overrides merged over [`BroadcastSettings::default`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSettingsPatch {
    pub only_admins_can_post: Option<bool>,
    pub allow_reactions: Option<bool>,
    pub allow_replies: Option<bool>,
}

impl BroadcastSettings {
    pub fn merged(patch: BroadcastSettingsPatch) -> Self {
        let defaults = Self::default();
        Self {
            only_admins_can_post: patch
                .only_admins_can_post
                .unwrap_or(defaults.only_admins_can_post),
            allow_reactions: patch.allow_reactions.unwrap_or(defaults.allow_reactions),
            allow_replies: patch.allow_replies.unwrap_or(defaults.allow_replies),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    pub allow_reactions: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            allow_reactions: true,
        }
    }
}

/// Per-conversation settings, tagged by conversation type so each variant
/// carries only its own fixed field set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationSettings {
    Direct,
    Group(GroupSettings),
    Broadcast(BroadcastSettings),
}

impl ConversationSettings {
    pub fn allow_reactions(&self) -> bool {
        match self {
            ConversationSettings::Direct => true,
            ConversationSettings::Group(s) => s.allow_reactions,
            ConversationSettings::Broadcast(s) => s.allow_reactions,
        }
    }

    pub fn allow_replies(&self) -> bool {
        match self {
            ConversationSettings::Broadcast(s) => s.allow_replies,
            _ => true,
        }
    }

    pub fn only_admins_can_post(&self) -> bool {
        match self {
            ConversationSettings::Broadcast(s) => s.only_admins_can_post,
            _ => false,
        }
    }
}

/// A conversation of any type (direct, group, broadcast).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub conversation_type: ConversationType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_by: UserId,
    pub settings: ConversationSettings,
    /// Soft-deactivation flag. This core never hard-deletes conversations.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn direct(created_by: UserId) -> Self {
        Self::new(ConversationType::Direct, None, None, created_by, ConversationSettings::Direct)
    }

    pub fn group(created_by: UserId, name: String, description: Option<String>) -> Self {
        Self::new(
            ConversationType::Group,
            Some(name),
            description,
            created_by,
            ConversationSettings::Group(GroupSettings::default()),
        )
    }

    pub fn broadcast(
        created_by: UserId,
        name: String,
        description: Option<String>,
        settings: BroadcastSettings,
    ) -> Self {
        Self::new(
            ConversationType::Broadcast,
            Some(name),
            description,
            created_by,
            ConversationSettings::Broadcast(settings),
        )
    }

    fn new(
        conversation_type: ConversationType,
        name: Option<String>,
        description: Option<String>,
        created_by: UserId,
        settings: ConversationSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            conversation_type,
            name,
            description,
            created_by,
            settings,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Admin,
    Moderator,
    Member,
    #[serde(rename = "READONLY")]
    ReadOnly,
    Muted,
}

/// Membership of one user in one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    /// `false` hides the conversation from this user's list without
    /// affecting the other participants.
    pub is_active: bool,
    /// Coarse read watermark; messages created after this instant count as
    /// unread for this user.
    pub last_read_at: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(conversation_id: ConversationId, user_id: UserId, role: ParticipantRole) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            user_id,
            role,
            is_active: true,
            last_read_at: now,
            joined_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemAction {
    Join,
}

/// Structured descriptors attached to a message (system actions, the users
/// a system message is about).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_action: Option<SystemAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<UserId>,
}

/// A single message. `sender_id` is absent for SYSTEM messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Users who have read this message. Append-only; never contains the
    /// sender.
    pub read_by: HashSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn text(conversation_id: ConversationId, sender_id: UserId, content: String) -> Self {
        Self::new(conversation_id, Some(sender_id), content, MessageType::Text)
    }

    pub fn system(conversation_id: ConversationId, content: String) -> Self {
        Self::new(conversation_id, None, content, MessageType::System)
    }

    fn new(
        conversation_id: ConversationId,
        sender_id: Option<UserId>,
        content: String,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            content,
            message_type,
            metadata: None,
            reply_to: None,
            read_by: HashSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_reply_to(mut self, reply_to: MessageId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// An emoji reaction. At most one live reaction exists per (message, user).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    pub fn new(message_id: MessageId, user_id: UserId, emoji: impl Into<String>) -> Self {
        Self {
            message_id,
            user_id,
            emoji: emoji.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A known user account. Accounts are owned by the external identity layer;
/// the store only mirrors what fan-out and eligibility checks need.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub image: Option<String>,
    /// Opaque domain role string, matched against broadcast eligibility
    /// policy.
    pub role: String,
    pub is_active: bool,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            image: None,
            role: role.into(),
            is_active: true,
        }
    }
}
