//! The messaging service proper.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use palaver_net::DeliveryRegistry;
use palaver_shared::protocol::{MessageNotice, PushEvent};
use palaver_shared::types::{ConversationId, MessageId, UserId};
use palaver_store::{
    BroadcastSettings, BroadcastSettingsPatch, Conversation, ConversationStore, Message,
    MessageMetadata, Participant, ParticipantRole, Reaction, StoreError, SystemAction,
};

use crate::error::{not_found, MessagingError, Result};
use crate::permissions::{self, Action};
use crate::policy::MessagingPolicy;

/// Outcome of a reaction toggle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReactionOutcome {
    Added,
    Changed,
    Removed,
}

/// A conversation annotated for one user's list view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

pub struct MessagingService {
    store: Arc<dyn ConversationStore>,
    registry: Arc<DeliveryRegistry>,
    policy: MessagingPolicy,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: Arc<DeliveryRegistry>,
        policy: MessagingPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
        }
    }

    // ------------------------------------------------------------------
    // Conversation lifecycle
    // ------------------------------------------------------------------

    /// Return the DIRECT conversation for `{user_a, user_b}`, reactivating
    /// the existing one if the pair has talked before, creating it
    /// otherwise. Order of the arguments does not matter.
    pub fn create_direct_conversation(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Conversation> {
        if user_a == user_b {
            return Err(MessagingError::Invalid(
                "a direct conversation needs two distinct users".into(),
            ));
        }

        if let Some(existing) = self.store.find_direct_conversation(user_a, user_b)? {
            return self.reactivate_direct(existing, user_a, user_b);
        }

        let conversation = Conversation::direct(*user_a);
        let participants = vec![
            Participant::new(conversation.id, *user_a, ParticipantRole::Member),
            Participant::new(conversation.id, *user_b, ParticipantRole::Member),
        ];

        match self
            .store
            .create_conversation(conversation.clone(), participants)
        {
            Ok(()) => {}
            // Lost the race against a concurrent create for the same pair.
            Err(StoreError::Conflict(_)) => {
                let existing = self
                    .store
                    .find_direct_conversation(user_a, user_b)?
                    .ok_or(MessagingError::NotFound("conversation"))?;
                return self.reactivate_direct(existing, user_a, user_b);
            }
            Err(e) => return Err(e.into()),
        }

        // The initiator already holds the result; only the other side needs
        // a push.
        let delivered = self.registry.send(
            user_b,
            PushEvent::NewConversation {
                conversation_id: conversation.id,
            },
        );
        debug!(
            conversation = %conversation.id.short(),
            to = %user_b.short(),
            delivered,
            "created direct conversation"
        );

        Ok(conversation)
    }

    fn reactivate_direct(
        &self,
        conversation: Conversation,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Conversation> {
        self.store
            .set_participant_active(conversation.id, user_a, true)?;
        self.store
            .set_participant_active(conversation.id, user_b, true)?;
        debug!(
            conversation = %conversation.id.short(),
            "reactivated existing direct conversation"
        );
        self.store
            .conversation(conversation.id)
            .map_err(not_found("conversation"))
    }

    /// Create a group conversation with `creator` as ADMIN and every member
    /// as MEMBER.
    pub fn create_group_conversation(
        &self,
        creator: &UserId,
        name: String,
        description: Option<String>,
        member_ids: &[UserId],
    ) -> Result<Conversation> {
        let conversation = Conversation::group(*creator, name, description);

        let mut participants = vec![Participant::new(
            conversation.id,
            *creator,
            ParticipantRole::Admin,
        )];
        let mut seen: HashSet<UserId> = HashSet::from([*creator]);
        for member in member_ids {
            if seen.insert(*member) {
                participants.push(Participant::new(
                    conversation.id,
                    *member,
                    ParticipantRole::Member,
                ));
            }
        }

        let member_count = participants.len();
        self.store
            .create_conversation(conversation.clone(), participants)?;

        info!(
            conversation = %conversation.id.short(),
            members = member_count,
            "created group conversation"
        );
        Ok(conversation)
    }

    /// Create a broadcast channel enrolling every active user with an
    /// eligible role. The creator is ADMIN, everyone else READONLY.
    pub fn create_broadcast_channel(
        &self,
        creator: &UserId,
        name: String,
        description: Option<String>,
        overrides: BroadcastSettingsPatch,
    ) -> Result<Conversation> {
        let settings = BroadcastSettings::merged(overrides);
        let conversation =
            Conversation::broadcast(*creator, name.clone(), description, settings);

        let mut participants = vec![Participant::new(
            conversation.id,
            *creator,
            ParticipantRole::Admin,
        )];
        for user in self
            .store
            .users_by_roles(&self.policy.broadcast_eligible_roles)?
        {
            if user.id != *creator {
                participants.push(Participant::new(
                    conversation.id,
                    user.id,
                    ParticipantRole::ReadOnly,
                ));
            }
        }

        self.store
            .create_conversation(conversation.clone(), participants.clone())?;

        // Best-effort announcement; offline members simply miss the push.
        let mut attempts = 0;
        let mut delivered = 0;
        for participant in &participants {
            if participant.user_id == *creator {
                continue;
            }
            attempts += 1;
            if self.registry.send(
                &participant.user_id,
                PushEvent::NewBroadcastChannel {
                    conversation_id: conversation.id,
                    name: name.clone(),
                },
            ) {
                delivered += 1;
            }
        }

        info!(
            channel = %conversation.id.short(),
            members = participants.len(),
            attempts,
            delivered,
            "created broadcast channel"
        );
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    /// Add users to a conversation. Requires the acting user to be an
    /// active ADMIN or MODERATOR participant. Users already present are
    /// skipped. Returns the ids actually added.
    pub fn add_participants(
        &self,
        conversation_id: ConversationId,
        user_ids: &[UserId],
        acting_user: &UserId,
        role: ParticipantRole,
    ) -> Result<Vec<UserId>> {
        self.store
            .conversation(conversation_id)
            .map_err(not_found("conversation"))?;

        let actor = self
            .active_participant(conversation_id, acting_user)
            .ok_or_else(|| {
                MessagingError::Permission("acting user is not an active participant".into())
            })?;
        if !permissions::role_allows(actor.role, Action::AddParticipants) {
            return Err(MessagingError::Permission(format!(
                "role {:?} may not add participants",
                actor.role
            )));
        }

        let mut added = Vec::new();
        for user_id in user_ids {
            if added.contains(user_id) {
                continue;
            }
            let inserted = self
                .store
                .add_participant(Participant::new(conversation_id, *user_id, role))?;
            if inserted {
                added.push(*user_id);
            }
        }

        if added.is_empty() {
            return Ok(added);
        }

        let names: Vec<String> = added
            .iter()
            .map(|id| {
                self.store
                    .user(id)
                    .ok()
                    .flatten()
                    .map(|u| u.name)
                    .unwrap_or_else(|| id.short())
            })
            .collect();
        let metadata = MessageMetadata {
            system_action: Some(SystemAction::Join),
            user_ids: added.clone(),
        };
        self.send_system_message(
            conversation_id,
            format!("{} {}", names.join(", "), self.policy.join_notice),
            Some(metadata),
        )?;

        info!(
            conversation = %conversation_id.short(),
            added = added.len(),
            "added participants"
        );
        Ok(added)
    }

    /// Change a participant's role. ADMIN only.
    pub fn change_participant_role(
        &self,
        conversation_id: ConversationId,
        target: &UserId,
        role: ParticipantRole,
        acting_user: &UserId,
    ) -> Result<()> {
        self.store
            .conversation(conversation_id)
            .map_err(not_found("conversation"))?;

        let actor = self
            .active_participant(conversation_id, acting_user)
            .ok_or_else(|| {
                MessagingError::Permission("acting user is not an active participant".into())
            })?;
        if !permissions::role_allows(actor.role, Action::ManageRoles) {
            return Err(MessagingError::Permission(format!(
                "role {:?} may not change roles",
                actor.role
            )));
        }

        self.store
            .participant(conversation_id, target)?
            .ok_or(MessagingError::NotFound("participant"))?;
        self.store
            .set_participant_role(conversation_id, target, role)?;
        self.store.touch_conversation(conversation_id, Utc::now())?;

        info!(
            conversation = %conversation_id.short(),
            target = %target.short(),
            role = ?role,
            "changed participant role"
        );
        Ok(())
    }

    /// Soft-leave: hides the conversation from this user's list without
    /// affecting the other participants. A later direct re-request
    /// reactivates the row.
    pub fn leave_conversation(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<()> {
        self.store
            .participant(conversation_id, user)?
            .ok_or(MessagingError::NotFound("participant"))?;
        self.store
            .set_participant_active(conversation_id, user, false)?;
        debug!(
            conversation = %conversation_id.short(),
            user = %user.short(),
            "participant left conversation"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Whether `user` may currently send into this conversation.
    pub fn can_user_send_message(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<bool> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .map_err(not_found("conversation"))?;
        let participant = self.store.participant(conversation_id, user)?;
        Ok(self.check_can_send(&conversation, participant.as_ref()).is_ok())
    }

    /// Send a TEXT message. Authorization is checked before anything is
    /// written; an unauthorized send leaves no message row behind.
    pub fn send_message(
        &self,
        conversation_id: ConversationId,
        sender: &UserId,
        content: String,
        metadata: Option<MessageMetadata>,
        reply_to: Option<MessageId>,
    ) -> Result<Message> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .map_err(not_found("conversation"))?;
        let participant = self.store.participant(conversation_id, sender)?;
        self.check_can_send(&conversation, participant.as_ref())?;

        if let Some(reply_id) = reply_to {
            let target = self.store.message(reply_id).map_err(not_found("message"))?;
            if target.conversation_id != conversation_id {
                return Err(MessagingError::Invalid(
                    "reply target belongs to another conversation".into(),
                ));
            }
            if !conversation.settings.allow_replies() {
                return Err(MessagingError::NotAuthorized(
                    "replies are disabled in this channel".into(),
                ));
            }
        }

        let mut message = Message::text(conversation_id, *sender, content);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        if let Some(reply_id) = reply_to {
            message = message.with_reply_to(reply_id);
        }

        self.store.insert_message(message.clone())?;
        self.store
            .touch_conversation(conversation_id, message.created_at)?;
        self.fan_out_message(&conversation, &message, Some(*sender))?;

        Ok(message)
    }

    /// Persist and fan out a SYSTEM message. No authorization: system
    /// messages are produced by the service itself.
    pub fn send_system_message(
        &self,
        conversation_id: ConversationId,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Result<Message> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .map_err(not_found("conversation"))?;

        let mut message = Message::system(conversation_id, content);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }

        self.store.insert_message(message.clone())?;
        self.store
            .touch_conversation(conversation_id, message.created_at)?;
        self.fan_out_message(&conversation, &message, None)?;

        Ok(message)
    }

    fn check_can_send(
        &self,
        conversation: &Conversation,
        participant: Option<&Participant>,
    ) -> Result<()> {
        let participant = participant.filter(|p| p.is_active).ok_or_else(|| {
            MessagingError::NotAuthorized("sender is not an active participant".into())
        })?;

        if !permissions::role_allows(participant.role, Action::SendMessage) {
            return Err(MessagingError::NotAuthorized(
                "muted participants may not send messages".into(),
            ));
        }

        if conversation.settings.only_admins_can_post()
            && !permissions::may_post_restricted(participant.role)
        {
            return Err(MessagingError::NotAuthorized(
                "only admins may post in this channel".into(),
            ));
        }

        Ok(())
    }

    /// Push `new_message` (and `new_broadcast_message` for broadcast
    /// channels) to every other active participant. Offline participants
    /// are counted, not retried.
    fn fan_out_message(
        &self,
        conversation: &Conversation,
        message: &Message,
        sender: Option<UserId>,
    ) -> Result<()> {
        let notice = MessageNotice {
            id: message.id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: message.created_at,
        };
        let is_broadcast = matches!(
            conversation.conversation_type,
            palaver_store::ConversationType::Broadcast
        );

        let mut recipients = 0;
        let mut delivered = 0;
        for participant in self.store.participants(conversation.id)? {
            if !participant.is_active || Some(participant.user_id) == sender {
                continue;
            }
            recipients += 1;
            if self.registry.send(
                &participant.user_id,
                PushEvent::NewMessage {
                    conversation_id: conversation.id,
                    message: notice.clone(),
                },
            ) {
                delivered += 1;
            }
            if is_broadcast {
                self.registry.send(
                    &participant.user_id,
                    PushEvent::NewBroadcastMessage {
                        conversation_id: conversation.id,
                        channel_name: conversation.name.clone().unwrap_or_default(),
                        message: notice.clone(),
                    },
                );
            }
        }

        debug!(
            conversation = %conversation.id.short(),
            message = %message.id.short(),
            recipients,
            delivered,
            "fanned out message"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Toggle `user`'s reaction on a message: none → added, same emoji →
    /// removed, different emoji → changed.
    pub fn toggle_reaction(
        &self,
        message_id: MessageId,
        user: &UserId,
        emoji: &str,
    ) -> Result<ReactionOutcome> {
        let message = self
            .store
            .message(message_id)
            .map_err(not_found("message"))?;
        let conversation = self
            .store
            .conversation(message.conversation_id)
            .map_err(not_found("conversation"))?;

        let participant = self
            .active_participant(message.conversation_id, user)
            .ok_or_else(|| {
                MessagingError::NotAuthorized("reactor is not an active participant".into())
            })?;
        if !permissions::role_allows(participant.role, Action::React) {
            return Err(MessagingError::NotAuthorized(
                "muted participants may not react".into(),
            ));
        }
        if !conversation.settings.allow_reactions() {
            return Err(MessagingError::NotAuthorized(
                "reactions are disabled in this conversation".into(),
            ));
        }

        let outcome = match self.store.reaction(message_id, user)? {
            None => {
                self.store
                    .insert_reaction(Reaction::new(message_id, *user, emoji))?;
                ReactionOutcome::Added
            }
            Some(existing) if existing.emoji == emoji => {
                self.store.delete_reaction(message_id, user)?;
                ReactionOutcome::Removed
            }
            Some(_) => {
                self.store.update_reaction(message_id, user, emoji)?;
                ReactionOutcome::Changed
            }
        };

        debug!(
            message = %message_id.short(),
            user = %user.short(),
            outcome = ?outcome,
            "toggled reaction"
        );
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Read tracking
    // ------------------------------------------------------------------

    /// Conversations where `user` is an active participant, annotated with
    /// the last message and unread count, newest activity first.
    pub fn user_conversations(&self, user: &UserId) -> Result<Vec<ConversationView>> {
        let mut views = Vec::new();
        for conversation in self.store.conversations_for_user(user)? {
            let participant = self
                .store
                .participant(conversation.id, user)?
                .ok_or(MessagingError::NotFound("participant"))?;
            let last_message = self.store.last_message(conversation.id)?;
            let unread_count =
                self.store
                    .unread_count(conversation.id, user, participant.last_read_at)?;
            views.push(ConversationView {
                conversation,
                last_message,
                unread_count,
            });
        }
        views.sort_by(|a, b| b.conversation.updated_at.cmp(&a.conversation.updated_at));
        Ok(views)
    }

    /// Move `user`'s read watermark to now, append them to `read_by` on
    /// every unread message, and push a read receipt to the other
    /// participants. Safe to call repeatedly.
    pub fn mark_as_read(&self, conversation_id: ConversationId, user: &UserId) -> Result<()> {
        self.store
            .participant(conversation_id, user)?
            .ok_or(MessagingError::NotFound("participant"))?;

        let now = Utc::now();
        self.store.set_last_read(conversation_id, user, now)?;
        let changed = self.store.mark_messages_read(conversation_id, user)?;

        let mut delivered = 0;
        for participant in self.store.participants(conversation_id)? {
            if participant.user_id == *user || !participant.is_active {
                continue;
            }
            if self.registry.send(
                &participant.user_id,
                PushEvent::MessagesRead {
                    conversation_id,
                    read_by_user_id: *user,
                    timestamp: now,
                },
            ) {
                delivered += 1;
            }
        }

        debug!(
            conversation = %conversation_id.short(),
            user = %user.short(),
            changed,
            delivered,
            "marked conversation read"
        );
        Ok(())
    }

    fn active_participant(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Option<Participant> {
        self.store
            .participant(conversation_id, user)
            .ok()
            .flatten()
            .filter(|p| p.is_active)
    }
}
