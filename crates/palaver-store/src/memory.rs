//! In-memory [`ConversationStore`] implementation.
//!
//! Backs every test in the workspace and the development composition root.
//! All maps live behind one mutex so each trait method is atomic, matching
//! the per-operation atomicity the production backend provides.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use palaver_shared::types::{ConversationId, MessageId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{
    Conversation, ConversationType, Message, Participant, ParticipantRole, Reaction, User,
};
use crate::store::ConversationStore;

#[derive(Default)]
struct Inner {
    conversations: HashMap<ConversationId, Conversation>,
    participants: HashMap<(ConversationId, UserId), Participant>,
    messages: HashMap<MessageId, Message>,
    /// Per-conversation message ids in creation order.
    message_order: HashMap<ConversationId, Vec<MessageId>>,
    reactions: HashMap<(MessageId, UserId), Reaction>,
    users: HashMap<UserId, User>,
}

impl Inner {
    fn participant_set(&self, conversation: ConversationId) -> HashSet<UserId> {
        self.participants
            .keys()
            .filter(|(cid, _)| *cid == conversation)
            .map(|(_, uid)| *uid)
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ConversationStore for MemoryStore {
    fn create_conversation(
        &self,
        conversation: Conversation,
        participants: Vec<Participant>,
    ) -> Result<()> {
        let mut inner = self.lock()?;

        if conversation.conversation_type == ConversationType::Direct {
            let pair: HashSet<UserId> = participants.iter().map(|p| p.user_id).collect();
            let duplicate = inner
                .conversations
                .values()
                .filter(|c| c.conversation_type == ConversationType::Direct)
                .any(|c| inner.participant_set(c.id) == pair);
            if duplicate {
                return Err(StoreError::Conflict(
                    "direct conversation already exists for this pair".into(),
                ));
            }
        }

        tracing::debug!(
            conversation = %conversation.id.short(),
            participants = participants.len(),
            "creating conversation"
        );

        for participant in participants {
            inner
                .participants
                .insert((conversation.id, participant.user_id), participant);
        }
        inner.conversations.insert(conversation.id, conversation);
        Ok(())
    }

    fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.lock()?
            .conversations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let conversation = inner.conversations.get_mut(&id).ok_or(StoreError::NotFound)?;
        conversation.updated_at = at;
        Ok(())
    }

    fn find_direct_conversation(&self, a: &UserId, b: &UserId) -> Result<Option<Conversation>> {
        let inner = self.lock()?;
        let pair: HashSet<UserId> = [*a, *b].into_iter().collect();

        Ok(inner
            .conversations
            .values()
            .filter(|c| c.conversation_type == ConversationType::Direct)
            .find(|c| inner.participant_set(c.id) == pair)
            .cloned())
    }

    fn conversations_for_user(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let inner = self.lock()?;
        Ok(inner
            .participants
            .values()
            .filter(|p| p.user_id == *user && p.is_active)
            .filter_map(|p| inner.conversations.get(&p.conversation_id))
            .cloned()
            .collect())
    }

    fn participants(&self, id: ConversationId) -> Result<Vec<Participant>> {
        Ok(self
            .lock()?
            .participants
            .values()
            .filter(|p| p.conversation_id == id)
            .cloned()
            .collect())
    }

    fn participant(&self, id: ConversationId, user: &UserId) -> Result<Option<Participant>> {
        Ok(self.lock()?.participants.get(&(id, *user)).cloned())
    }

    fn add_participant(&self, participant: Participant) -> Result<bool> {
        let mut inner = self.lock()?;
        let key = (participant.conversation_id, participant.user_id);
        if inner.participants.contains_key(&key) {
            return Ok(false);
        }
        inner.participants.insert(key, participant);
        Ok(true)
    }

    fn set_participant_active(
        &self,
        id: ConversationId,
        user: &UserId,
        active: bool,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let participant = inner
            .participants
            .get_mut(&(id, *user))
            .ok_or(StoreError::NotFound)?;
        participant.is_active = active;
        Ok(())
    }

    fn set_participant_role(
        &self,
        id: ConversationId,
        user: &UserId,
        role: ParticipantRole,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let participant = inner
            .participants
            .get_mut(&(id, *user))
            .ok_or(StoreError::NotFound)?;
        participant.role = role;
        Ok(())
    }

    fn set_last_read(&self, id: ConversationId, user: &UserId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let participant = inner
            .participants
            .get_mut(&(id, *user))
            .ok_or(StoreError::NotFound)?;
        participant.last_read_at = at;
        Ok(())
    }

    fn insert_message(&self, message: Message) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::NotFound);
        }
        inner
            .message_order
            .entry(message.conversation_id)
            .or_default()
            .push(message.id);
        inner.messages.insert(message.id, message);
        Ok(())
    }

    fn message(&self, id: MessageId) -> Result<Message> {
        self.lock()?
            .messages
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>> {
        let inner = self.lock()?;
        Ok(inner
            .message_order
            .get(&conversation)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.messages.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn last_message(&self, conversation: ConversationId) -> Result<Option<Message>> {
        let inner = self.lock()?;
        Ok(inner
            .message_order
            .get(&conversation)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.messages.get(id))
            .cloned())
    }

    fn unread_count(
        &self,
        conversation: ConversationId,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let inner = self.lock()?;
        let count = inner
            .message_order
            .get(&conversation)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.messages.get(id))
                    .filter(|m| m.created_at > since && m.sender_id != Some(*user))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    fn mark_messages_read(&self, conversation: ConversationId, user: &UserId) -> Result<u64> {
        let mut inner = self.lock()?;
        let ids = inner
            .message_order
            .get(&conversation)
            .cloned()
            .unwrap_or_default();

        let mut changed = 0;
        for id in ids {
            if let Some(message) = inner.messages.get_mut(&id) {
                if message.sender_id != Some(*user) && message.read_by.insert(*user) {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    fn reaction(&self, message: MessageId, user: &UserId) -> Result<Option<Reaction>> {
        Ok(self.lock()?.reactions.get(&(message, *user)).cloned())
    }

    fn insert_reaction(&self, reaction: Reaction) -> Result<()> {
        let mut inner = self.lock()?;
        let key = (reaction.message_id, reaction.user_id);
        if inner.reactions.contains_key(&key) {
            return Err(StoreError::Conflict("reaction already exists".into()));
        }
        inner.reactions.insert(key, reaction);
        Ok(())
    }

    fn update_reaction(&self, message: MessageId, user: &UserId, emoji: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let reaction = inner
            .reactions
            .get_mut(&(message, *user))
            .ok_or(StoreError::NotFound)?;
        reaction.emoji = emoji.to_string();
        Ok(())
    }

    fn delete_reaction(&self, message: MessageId, user: &UserId) -> Result<bool> {
        Ok(self.lock()?.reactions.remove(&(message, *user)).is_some())
    }

    fn reactions_for_message(&self, message: MessageId) -> Result<Vec<Reaction>> {
        let mut reactions: Vec<Reaction> = self
            .lock()?
            .reactions
            .values()
            .filter(|r| r.message_id == message)
            .cloned()
            .collect();
        reactions.sort_by_key(|r| r.created_at);
        Ok(reactions)
    }

    fn user(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(id).cloned())
    }

    fn upsert_user(&self, user: User) -> Result<()> {
        self.lock()?.users.insert(user.id, user);
        Ok(())
    }

    fn users_by_roles(&self, roles: &[String]) -> Result<Vec<User>> {
        Ok(self
            .lock()?
            .users
            .values()
            .filter(|u| u.is_active && roles.iter().any(|r| *r == u.role))
            .cloned()
            .collect())
    }
}
