//! Conversation persistence collaborator.

use async_trait::async_trait;
use convoy_protocol::Conversation;
use dashmap::DashMap;

/// Durable home for folded conversations.
///
/// Sessions call `save` off the event-delivery path with a full snapshot, so
/// implementations may replace the stored value wholesale.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a snapshot, replacing any previous version.
    async fn save(&self, conversation: Conversation) -> anyhow::Result<()>;

    /// Fetch a conversation by id.
    async fn load(&self, id: &str) -> anyhow::Result<Option<Conversation>>;
}

/// In-process store. Conversations live as long as the server.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: DashMap<String, Conversation>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn save(&self, conversation: Conversation) -> anyhow::Result<()> {
        // Snapshots can land out of order across sessions; keep the longest history.
        match self.conversations.get_mut(&conversation.id) {
            Some(existing) if existing.messages.len() > conversation.messages.len() => {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    "ignoring stale conversation snapshot"
                );
            }
            Some(mut existing) => *existing = conversation,
            None => {
                self.conversations.insert(conversation.id.clone(), conversation);
            }
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        Ok(self.conversations.get(id).map(|c| c.value().clone()))
    }
}
