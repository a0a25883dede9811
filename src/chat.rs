//! Conversation list and per-room message synchronization.
//!
//! A specialization of the entity cache for two nested resources: the
//! conversation list and each conversation's ordered message sequence. Room
//! membership is scoped by an RAII guard so join/leave messages are always
//! paired, even when a screen is dismissed abruptly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;
use tracing::debug;

use crate::cache::{ApplyOutcome, EntityCache, LoadOutcome, LoadState, LoadTicket};
use crate::connection::ChannelMessage;
use crate::model::{ChatMessage, Conversation, ConversationId, Keyed};

/// Scoped room membership. Membership is refcounted: the same conversation
/// may be entered from nested screens, and only the last guard's drop emits
/// the leave-room message and removes the room from the rejoin set.
pub struct RoomGuard {
    conversation: ConversationId,
    outbound: Sender<ChannelMessage>,
    open: Arc<Mutex<BTreeMap<ConversationId, usize>>>,
}

impl RoomGuard {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        let mut last = false;
        if let Ok(mut open) = self.open.lock()
            && let Some(count) = open.get_mut(&self.conversation)
        {
            *count = count.saturating_sub(1);
            if *count == 0 {
                open.remove(&self.conversation);
                last = true;
            }
        }
        if last {
            let _ = self.outbound.send(ChannelMessage::LeaveRoom {
                conversation: self.conversation.clone(),
            });
        }
    }
}

pub struct ConversationSync {
    conversations: EntityCache<Conversation>,
    messages: BTreeMap<ConversationId, EntityCache<ChatMessage>>,
    /// Open-room refcounts; a key is present while at least one guard lives.
    open: Arc<Mutex<BTreeMap<ConversationId, usize>>>,
    outbound: Sender<ChannelMessage>,
}

impl ConversationSync {
    pub fn new(outbound: Sender<ChannelMessage>) -> Self {
        Self {
            conversations: EntityCache::new("conversations"),
            messages: BTreeMap::new(),
            open: Arc::new(Mutex::new(BTreeMap::new())),
            outbound,
        }
    }

    pub fn conversations(&self) -> &EntityCache<Conversation> {
        &self.conversations
    }

    pub(crate) fn conversations_mut(&mut self) -> &mut EntityCache<Conversation> {
        &mut self.conversations
    }

    pub fn load_conversations(&mut self) -> LoadOutcome<Conversation> {
        self.conversations.load_once()
    }

    pub fn complete_conversation_load(
        &mut self,
        ticket: LoadTicket,
        rows: Vec<Conversation>,
    ) -> bool {
        self.conversations.complete_load(ticket, rows)
    }

    pub fn load_messages(&mut self, conversation: &ConversationId) -> LoadOutcome<ChatMessage> {
        self.room_cache(conversation).load_once()
    }

    pub fn complete_message_load(
        &mut self,
        conversation: &ConversationId,
        ticket: LoadTicket,
        rows: Vec<ChatMessage>,
    ) -> bool {
        self.room_cache(conversation).complete_load(ticket, rows)
    }

    pub fn messages_snapshot(&self, conversation: &ConversationId) -> Vec<ChatMessage> {
        self.messages
            .get(conversation)
            .map(EntityCache::snapshot)
            .unwrap_or_default()
    }

    pub fn is_open(&self, conversation: &ConversationId) -> bool {
        self.open
            .lock()
            .map(|open| open.contains_key(conversation))
            .unwrap_or(false)
    }

    /// Enter a conversation screen: join the room now, leave it when the
    /// last guard for this conversation drops. The join-room message goes
    /// out only on the first entry.
    pub fn enter_room(&mut self, conversation: ConversationId) -> RoomGuard {
        let first = match self.open.lock() {
            Ok(mut open) => {
                let count = open.entry(conversation.clone()).or_insert(0);
                *count += 1;
                *count == 1
            }
            Err(_) => false,
        };
        if first {
            let _ = self.outbound.send(ChannelMessage::JoinRoom {
                conversation: conversation.clone(),
            });
        }
        RoomGuard {
            conversation,
            outbound: self.outbound.clone(),
            open: Arc::clone(&self.open),
        }
    }

    /// Re-issue join messages after a reconnect so server-side room state is
    /// rebuilt for every screen still open.
    pub fn rejoin_open_rooms(&self) {
        let Ok(open) = self.open.lock() else {
            return;
        };
        for conversation in open.keys() {
            let _ = self.outbound.send(ChannelMessage::JoinRoom {
                conversation: conversation.clone(),
            });
        }
    }

    /// One pushed message fans out to both caches: appended to the room's
    /// sequence when the room is open, and reflected on the conversation
    /// list's unread counter and last-activity timestamp.
    pub fn apply_message(&mut self, message: ChatMessage) -> ApplyOutcome {
        let conversation_id = message.conversation_id.clone();
        let open = self.is_open(&conversation_id);

        let mut outcome = ApplyOutcome::Ignored;
        if open {
            outcome = self.room_cache(&conversation_id).apply_create(message.clone());
        }

        match self.conversations.get(&conversation_id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.last_activity_ms = message.sent_at_ms;
                updated.last_message_preview = Some(message.body.clone());
                if !open {
                    updated.unread = updated.unread.saturating_add(1);
                }
                self.conversations.upsert_local(updated);
                outcome = ApplyOutcome::Applied;
            }
            None => {
                debug!(conversation = %conversation_id, "message for unknown conversation");
            }
        }
        outcome
    }

    /// Edit to an already-delivered message; dropped when the room's
    /// sequence is not loaded.
    pub fn apply_message_update(&mut self, patch: &crate::model::ChatMessagePatch) -> ApplyOutcome {
        match self.messages.get_mut(&patch.conversation_id) {
            Some(cache) => cache.apply_update(patch),
            None => ApplyOutcome::Ignored,
        }
    }

    /// Message retraction. The payload only carries the message key, so the
    /// loaded rooms are scanned; at most one holds it.
    pub fn apply_message_delete(&mut self, id: &crate::model::MessageId) -> ApplyOutcome {
        for cache in self.messages.values_mut() {
            if cache.apply_delete(id).applied() {
                return ApplyOutcome::Applied;
            }
        }
        ApplyOutcome::Ignored
    }

    /// Fire-and-forget read receipt: the local unread counter drops to zero
    /// immediately, independent of server confirmation latency.
    pub fn mark_read(&mut self, conversation: &ConversationId) {
        if let Some(existing) = self.conversations.get(conversation) {
            let mut updated = existing.clone();
            updated.unread = 0;
            self.conversations.upsert_local(updated);
        }
        let _ = self.outbound.send(ChannelMessage::MarkRead {
            conversation: conversation.clone(),
        });
    }

    /// After a reconnect every loaded cache may be stale. Starts fresh
    /// generation-tagged loads for the conversation list (when loaded) and
    /// each loaded room sequence; any older in-flight response is dropped.
    pub fn refresh_if_loaded(&mut self) -> (Option<LoadTicket>, Vec<(ConversationId, LoadTicket)>) {
        let list = (self.conversations.load_state() == LoadState::Loaded)
            .then(|| self.conversations.force_refresh());
        let rooms = self
            .messages
            .iter_mut()
            .filter(|(_, cache)| cache.load_state() == LoadState::Loaded)
            .map(|(id, cache)| (id.clone(), cache.force_refresh()))
            .collect();
        (list, rooms)
    }

    /// Logout teardown.
    pub fn clear(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        if let Ok(mut open) = self.open.lock() {
            open.clear();
        }
    }

    fn room_cache(&mut self, conversation: &ConversationId) -> &mut EntityCache<ChatMessage> {
        self.messages
            .entry(conversation.clone())
            .or_insert_with(|| EntityCache::new("messages"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::Receiver;

    use crate::model::{MessageId, UserId};

    fn sync() -> (ConversationSync, Receiver<ChannelMessage>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        (ConversationSync::new(tx), rx)
    }

    fn conv_id(s: &str) -> ConversationId {
        ConversationId::new(s).unwrap()
    }

    fn conversation(id: &str, unread: u32, at: i64) -> Conversation {
        Conversation {
            id: conv_id(id),
            title: format!("sala {id}"),
            unread,
            last_activity_ms: at,
            last_message_preview: None,
        }
    }

    fn message(id: &str, conv: &str, body: &str, at: i64) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(id).unwrap(),
            conversation_id: conv_id(conv),
            sender: UserId::new("u1").unwrap(),
            body: body.to_string(),
            sent_at_ms: at,
        }
    }

    fn loaded(sync: &mut ConversationSync, rows: Vec<Conversation>) {
        let ticket = sync.conversations_mut().force_refresh();
        sync.complete_conversation_load(ticket, rows);
    }

    #[test]
    fn guard_pairs_join_and_leave() {
        let (mut sync, rx) = sync();
        let guard = sync.enter_room(conv_id("c1"));
        assert!(sync.is_open(&conv_id("c1")));
        assert_eq!(
            rx.try_recv().expect("join"),
            ChannelMessage::JoinRoom {
                conversation: conv_id("c1")
            }
        );

        drop(guard);
        assert!(!sync.is_open(&conv_id("c1")));
        assert_eq!(
            rx.try_recv().expect("leave"),
            ChannelMessage::LeaveRoom {
                conversation: conv_id("c1")
            }
        );
    }

    #[test]
    fn message_for_closed_room_bumps_unread() {
        let (mut sync, _rx) = sync();
        loaded(&mut sync, vec![conversation("c1", 0, 100)]);

        sync.apply_message(message("m1", "c1", "oi", 200));
        let conv = sync.conversations().get(&conv_id("c1")).unwrap().clone();
        assert_eq!(conv.unread, 1);
        assert_eq!(conv.last_activity_ms, 200);
        assert_eq!(conv.last_message_preview.as_deref(), Some("oi"));
        // Not appended: the room is not open.
        assert!(sync.messages_snapshot(&conv_id("c1")).is_empty());
    }

    #[test]
    fn message_for_open_room_appends_without_unread() {
        let (mut sync, _rx) = sync();
        loaded(&mut sync, vec![conversation("c1", 0, 100)]);
        let _guard = sync.enter_room(conv_id("c1"));

        sync.apply_message(message("m1", "c1", "oi", 200));
        let conv = sync.conversations().get(&conv_id("c1")).unwrap().clone();
        assert_eq!(conv.unread, 0);
        assert_eq!(sync.messages_snapshot(&conv_id("c1")).len(), 1);
    }

    #[test]
    fn duplicate_message_is_idempotent() {
        let (mut sync, _rx) = sync();
        loaded(&mut sync, vec![conversation("c1", 0, 100)]);
        let _guard = sync.enter_room(conv_id("c1"));

        sync.apply_message(message("m1", "c1", "oi", 200));
        sync.apply_message(message("m1", "c1", "oi", 200));
        assert_eq!(sync.messages_snapshot(&conv_id("c1")).len(), 1);
    }

    #[test]
    fn messages_stay_chronological() {
        let (mut sync, _rx) = sync();
        loaded(&mut sync, vec![conversation("c1", 0, 100)]);
        let _guard = sync.enter_room(conv_id("c1"));

        sync.apply_message(message("m2", "c1", "depois", 300));
        sync.apply_message(message("m1", "c1", "antes", 200));
        let bodies: Vec<_> = sync
            .messages_snapshot(&conv_id("c1"))
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["antes", "depois"]);
    }

    #[test]
    fn double_entry_keeps_room_open_until_last_guard() {
        let (mut sync, rx) = sync();
        loaded(&mut sync, vec![conversation("c1", 0, 100)]);

        let first = sync.enter_room(conv_id("c1"));
        let second = sync.enter_room(conv_id("c1"));
        // One join for the first entry, nothing for the second.
        assert!(matches!(
            rx.try_recv().expect("join"),
            ChannelMessage::JoinRoom { .. }
        ));
        assert!(rx.try_recv().is_err());

        drop(first);
        assert!(sync.is_open(&conv_id("c1")));
        assert!(rx.try_recv().is_err());

        // Still behaves as open: message appends, no unread bump.
        sync.apply_message(message("m1", "c1", "oi", 200));
        assert_eq!(sync.conversations().get(&conv_id("c1")).unwrap().unread, 0);
        assert_eq!(sync.messages_snapshot(&conv_id("c1")).len(), 1);

        drop(second);
        assert!(!sync.is_open(&conv_id("c1")));
        assert_eq!(
            rx.try_recv().expect("leave"),
            ChannelMessage::LeaveRoom {
                conversation: conv_id("c1")
            }
        );
    }

    #[test]
    fn mark_read_zeroes_unread_and_notifies() {
        let (mut sync, rx) = sync();
        loaded(&mut sync, vec![conversation("c1", 4, 100)]);

        sync.mark_read(&conv_id("c1"));
        assert_eq!(sync.conversations().get(&conv_id("c1")).unwrap().unread, 0);
        assert_eq!(
            rx.try_recv().expect("mark read"),
            ChannelMessage::MarkRead {
                conversation: conv_id("c1")
            }
        );
    }

    #[test]
    fn rejoin_covers_every_open_room() {
        let (mut sync, rx) = sync();
        let _g1 = sync.enter_room(conv_id("c1"));
        let _g2 = sync.enter_room(conv_id("c2"));
        while rx.try_recv().is_ok() {}

        sync.rejoin_open_rooms();
        let mut rejoined = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ChannelMessage::JoinRoom { conversation } = msg {
                rejoined.push(conversation);
            }
        }
        assert_eq!(rejoined, vec![conv_id("c1"), conv_id("c2")]);
    }

    #[test]
    fn conversation_list_orders_by_recent_activity() {
        let (mut sync, _rx) = sync();
        loaded(
            &mut sync,
            vec![conversation("c1", 0, 100), conversation("c2", 0, 50)],
        );
        sync.apply_message(message("m1", "c2", "oi", 500));
        let ids: Vec<_> = sync
            .conversations()
            .snapshot()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![conv_id("c2"), conv_id("c1")]);
    }
}
