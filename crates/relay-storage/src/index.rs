//! In-process record index shared by the JSONL and in-memory drivers.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::store::sort_for_replay;
use crate::types::*;

/// Messages in insertion order plus session and summary maps.
///
/// With a cap, the oldest messages are dropped once the cap is exceeded.
#[derive(Debug, Default)]
pub(crate) struct MemoryIndex {
    messages: VecDeque<StoredMessage>,
    positions: HashMap<String, usize>,
    sessions: HashMap<String, StoredSession>,
    agents: HashMap<String, AgentSummary>,
    cap: Option<usize>,
}

impl MemoryIndex {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            cap,
            ..Default::default()
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn upsert_message(&mut self, message: StoredMessage) {
        if let Some(&pos) = self.positions.get(&message.id) {
            self.messages[pos] = message;
            return;
        }
        self.positions.insert(message.id.clone(), self.messages.len());
        self.messages.push_back(message);

        if let Some(cap) = self.cap {
            if self.messages.len() > cap {
                while self.messages.len() > cap {
                    if let Some(dropped) = self.messages.pop_front() {
                        self.positions.remove(&dropped.id);
                    }
                }
                self.reindex();
            }
        }
    }

    fn reindex(&mut self) {
        self.positions = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
    }

    pub fn get_message(&self, id: &str) -> Option<&StoredMessage> {
        self.positions.get(id).and_then(|&pos| self.messages.get(pos))
    }

    pub fn set_status(&mut self, id: &str, status: MessageStatus) -> Option<StoredMessage> {
        let pos = *self.positions.get(id)?;
        let msg = self.messages.get_mut(pos)?;
        msg.status = status;
        Some(msg.clone())
    }

    pub fn query(&self, query: &MessageQuery) -> Vec<StoredMessage> {
        let mut out: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.ts);
        if query.order == SortOrder::Desc {
            out.reverse();
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        out
    }

    pub fn reply_count(&self, id: &str) -> u64 {
        self.messages
            .iter()
            .filter(|m| m.thread.as_deref() == Some(id))
            .count() as u64
    }

    pub fn pending_for_session(&self, agent: &str, session_id: Option<&str>) -> Vec<StoredMessage> {
        let mut out: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| m.to == agent && m.status == MessageStatus::Unread)
            .filter(|m| match (&m.delivery_session_id, session_id) {
                (None, _) => true,
                (Some(delivered_in), Some(current)) => delivered_in == current,
                (Some(_), None) => false,
            })
            .cloned()
            .collect();
        sort_for_replay(&mut out);
        out
    }

    pub fn max_seq_by_stream(&self, agent: &str, session_id: Option<&str>) -> Vec<StreamSeq> {
        let mut streams: BTreeMap<(String, String), u64> = BTreeMap::new();
        for m in self.messages.iter().filter(|m| m.to == agent) {
            let Some(seq) = m.delivery_seq else { continue };
            if let Some(session) = session_id {
                if m.delivery_session_id.as_deref() != Some(session) {
                    continue;
                }
            }
            let key = (m.topic_or_default().to_string(), m.from.clone());
            let entry = streams.entry(key).or_insert(0);
            *entry = (*entry).max(seq);
        }
        streams
            .into_iter()
            .map(|((topic, peer), max_seq)| StreamSeq { topic, peer, max_seq })
            .collect()
    }

    pub fn upsert_session(&mut self, session: StoredSession) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn session_mut(&mut self, id: &str) -> Option<&mut StoredSession> {
        self.sessions.get_mut(id)
    }

    pub fn session_by_resume_token(&self, token: &str) -> Option<StoredSession> {
        self.sessions
            .values()
            .filter(|s| s.resume_token.as_deref() == Some(token))
            .max_by_key(|s| s.started_at)
            .cloned()
    }

    pub fn recent_sessions(&self, limit: usize) -> Vec<StoredSession> {
        let mut sessions: Vec<StoredSession> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        sessions
    }

    pub fn upsert_agent(&mut self, summary: AgentSummary) {
        self.agents.insert(summary.agent_name.clone(), summary);
    }

    pub fn agent(&self, name: &str) -> Option<AgentSummary> {
        self.agents.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, to: &str, seq: Option<u64>, ts: u64) -> StoredMessage {
        StoredMessage {
            id: id.into(),
            ts,
            from: "alice".into(),
            to: to.into(),
            topic: None,
            kind: "message".into(),
            body: "hi".into(),
            data: None,
            thread: None,
            delivery_seq: seq,
            delivery_session_id: None,
            session_id: None,
            status: MessageStatus::Unread,
            is_urgent: false,
            is_broadcast: false,
        }
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut index = MemoryIndex::new(Some(2));
        index.upsert_message(msg("a", "bob", None, 1));
        index.upsert_message(msg("b", "bob", None, 2));
        index.upsert_message(msg("c", "bob", None, 3));
        assert_eq!(index.message_count(), 2);
        assert!(index.get_message("a").is_none());
        assert!(index.get_message("c").is_some());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut index = MemoryIndex::new(None);
        index.upsert_message(msg("a", "bob", None, 1));
        let mut updated = msg("a", "bob", Some(4), 1);
        updated.status = MessageStatus::Acked;
        index.upsert_message(updated);
        assert_eq!(index.message_count(), 1);
        assert_eq!(index.get_message("a").unwrap().status, MessageStatus::Acked);
    }

    #[test]
    fn test_pending_order_treats_missing_seq_as_zero() {
        let mut index = MemoryIndex::new(None);
        index.upsert_message(msg("late", "bob", Some(2), 10));
        index.upsert_message(msg("queued", "bob", None, 50));
        index.upsert_message(msg("early", "bob", Some(1), 20));
        let ids: Vec<String> = index
            .pending_for_session("bob", None)
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["queued", "early", "late"]);
    }
}
