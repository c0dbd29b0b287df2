//! In-memory chat state and the durability seam.
//!
//! `AppState` is the process-wide authority over chats; it lives behind one
//! async mutex. Handlers hold the lock for their whole duration; a send turn
//! holds it only during setup and commit, never across the network stream.
//! Durability goes through the [`StateStore`] trait so the on-disk format is
//! a collaborator concern, not a core one.

use std::collections::HashMap;

use bb7_protocol::Chat;
use bb7_protocol::ReasoningEffort;
use uuid::Uuid;

/// Persistence seam. Implementations must make a chat durable before the
/// call returns; the daemon persists every mutation before acknowledging it.
pub trait StateStore: Send {
    fn save_chat(&mut self, chat: &Chat) -> std::io::Result<()>;
    fn delete_chat(&mut self, id: Uuid) -> std::io::Result<()>;
}

/// Keeps saved chats in memory: durability within the daemon's lifetime.
/// The on-disk format is the front-end installation's concern; it swaps in
/// its own [`StateStore`] implementation.
#[derive(Default)]
pub struct MemoryStateStore {
    saved: HashMap<Uuid, Chat>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn save_chat(&mut self, chat: &Chat) -> std::io::Result<()> {
        self.saved.insert(chat.id, chat.clone());
        Ok(())
    }

    fn delete_chat(&mut self, id: Uuid) -> std::io::Result<()> {
        self.saved.remove(&id);
        Ok(())
    }
}

pub struct AppState {
    chats: HashMap<Uuid, Chat>,
    active: Option<Uuid>,
    store: Box<dyn StateStore>,
}

impl AppState {
    pub fn new(store: Box<dyn StateStore>) -> Self {
        Self {
            chats: HashMap::new(),
            active: None,
            store,
        }
    }

    pub fn create_chat(
        &mut self,
        model: impl Into<String>,
        reasoning_effort: ReasoningEffort,
    ) -> std::io::Result<Uuid> {
        let chat = Chat::new(model, reasoning_effort);
        let id = chat.id;
        self.store.save_chat(&chat)?;
        self.chats.insert(id, chat);
        self.active = Some(id);
        Ok(id)
    }

    pub fn select_chat(&mut self, id: Uuid) -> bool {
        if self.chats.contains_key(&id) {
            self.active = Some(id);
            true
        } else {
            false
        }
    }

    pub fn delete_chat(&mut self, id: Uuid) -> std::io::Result<bool> {
        if self.chats.remove(&id).is_none() {
            return Ok(false);
        }
        self.store.delete_chat(id)?;
        if self.active == Some(id) {
            self.active = None;
        }
        Ok(true)
    }

    pub fn active_chat_id(&self) -> Option<Uuid> {
        self.active
    }

    pub fn active_chat(&self) -> Option<&Chat> {
        self.active.and_then(|id| self.chats.get(&id))
    }

    pub fn active_chat_mut(&mut self) -> Option<&mut Chat> {
        self.active.and_then(|id| self.chats.get_mut(&id))
    }

    pub fn chat(&self, id: Uuid) -> Option<&Chat> {
        self.chats.get(&id)
    }

    pub fn chat_mut(&mut self, id: Uuid) -> Option<&mut Chat> {
        self.chats.get_mut(&id)
    }

    pub fn chats(&self) -> impl Iterator<Item = &Chat> {
        self.chats.values()
    }

    /// Persist `id` through the store. Call after every mutation, before the
    /// acknowledgment goes out.
    pub fn persist(&mut self, id: Uuid) -> std::io::Result<()> {
        match self.chats.get(&id) {
            Some(chat) => self.store.save_chat(chat),
            None => Ok(()),
        }
    }
}

/// Cheap deterministic token estimate over a chat's renderable content.
/// Real tokenizer integration is a front-end concern; this only has to be
/// stable and monotonic in content size.
pub fn estimate_tokens(chat: &Chat) -> u64 {
    let mut chars: usize = chat.draft.len();
    for file in &chat.context_files {
        chars += file.path.len() + file.content.len();
    }
    for content in chat.outputs.values() {
        chars += content.len();
    }
    for message in &chat.messages {
        chars += message.text_content().len();
    }
    (chars as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;

    #[test]
    fn create_select_delete_round_trip() {
        let mut state = AppState::new(Box::new(MemoryStateStore::new()));
        let a = state
            .create_chat("m", ReasoningEffort::default())
            .expect("create");
        let b = state
            .create_chat("m", ReasoningEffort::default())
            .expect("create");
        assert_eq!(state.active_chat_id(), Some(b));

        assert!(state.select_chat(a));
        assert_eq!(state.active_chat_id(), Some(a));

        assert!(state.delete_chat(a).expect("delete"));
        assert_eq!(state.active_chat_id(), None);
        assert!(!state.delete_chat(a).expect("repeat delete"));
    }

    #[test]
    fn estimate_scales_with_content() {
        let mut state = AppState::new(Box::new(MemoryStateStore::new()));
        state
            .create_chat("m", ReasoningEffort::default())
            .expect("create");
        let chat = state.active_chat_mut().expect("active");
        let empty = estimate_tokens(chat);
        chat.draft = "x".repeat(400);
        let grown = estimate_tokens(state.active_chat().expect("active"));
        assert!(grown >= empty + 100);
    }
}
