//! Scripted in-memory mailbox for tests.
//!
//! A [`FakeState`] is shared between the test, the [`FakeConnector`],
//! and every session it opens, so tests can seed messages, script
//! failures, and inspect the commands a component issued.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ImapError;
use crate::store::AccountSyncState;

use super::{
    IdleEvent, MailboxConnector, MailboxSession, MailboxStatus, MessageHeader, SearchOutcome,
};

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub sender: String,
    pub raw: Vec<u8>,
    pub unseen: bool,
}

impl FakeMessage {
    pub fn from_sender(sender: &str) -> Self {
        let raw = format!(
            "From: {sender}\r\nTo: agent@example.com\r\nSubject: test\r\n\r\nbody\r\n"
        );
        Self {
            sender: sender.to_string(),
            raw: raw.into_bytes(),
            unseen: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub generation: u32,
    pub uid_next: u32,
    pub supports_idle: bool,
    pub messages: BTreeMap<u32, FakeMessage>,
    /// Open-ended `UID x:* UNSEEN` searches come back NO/BAD.
    pub reject_open_ended_search: bool,
    /// Every ranged search comes back NO/BAD.
    pub reject_all_range_search: bool,
    /// UIDs whose header fetch fails.
    pub fail_header: HashSet<u32>,
    /// UIDs whose body fetch fails.
    pub fail_body: HashSet<u32>,
    /// All `mark_seen` calls fail (best-effort path).
    pub fail_mark_seen: bool,
    /// Scripted IDLE events; exhausted queue yields timeouts.
    pub idle_events: VecDeque<Result<IdleEvent, ImapError>>,
    /// Errors handed out to `open` before sessions succeed.
    pub connect_failures: VecDeque<ImapError>,
    /// Every command issued by any session, in order.
    pub commands: Vec<String>,
    pub seen_marked: Vec<u32>,
    pub range_queries: Vec<(u32, Option<u32>)>,
    pub opens: usize,
}

impl FakeState {
    pub fn with_messages(generation: u32, messages: &[(u32, &str)]) -> Arc<Mutex<Self>> {
        let map: BTreeMap<u32, FakeMessage> = messages
            .iter()
            .map(|(uid, sender)| (*uid, FakeMessage::from_sender(sender)))
            .collect();
        let uid_next = map.keys().max().copied().unwrap_or(0) + 1;
        Arc::new(Mutex::new(Self {
            generation,
            uid_next,
            supports_idle: true,
            messages: map,
            ..Self::default()
        }))
    }

    pub fn status(&self) -> MailboxStatus {
        MailboxStatus {
            generation: self.generation,
            uid_next: self.uid_next,
            exists: self.messages.len() as u32,
        }
    }

    fn unseen_in(&self, from: u32, to: Option<u32>) -> Vec<u32> {
        self.messages
            .iter()
            .filter(|(uid, message)| {
                message.unseen && **uid >= from && to.is_none_or(|to| **uid <= to)
            })
            .map(|(uid, _)| *uid)
            .collect()
    }
}

pub struct FakeSession {
    state: Arc<Mutex<FakeState>>,
    status: MailboxStatus,
    supports_idle: bool,
}

impl FakeSession {
    fn log(&self, command: String) {
        self.state.lock().unwrap().commands.push(command);
    }
}

#[async_trait]
impl MailboxSession for FakeSession {
    fn status(&self) -> MailboxStatus {
        self.status
    }

    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    async fn search_unseen_range(
        &mut self,
        from: u32,
        to: Option<u32>,
    ) -> Result<SearchOutcome, ImapError> {
        self.log(format!("search {from}:{}", to.map_or("*".to_string(), |t| t.to_string())));
        let mut state = self.state.lock().unwrap();
        state.range_queries.push((from, to));
        if state.reject_all_range_search
            || (to.is_none() && state.reject_open_ended_search)
        {
            return Ok(SearchOutcome::Unsupported);
        }
        Ok(SearchOutcome::Uids(state.unseen_in(from, to)))
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>, ImapError> {
        self.log("search-unseen".to_string());
        let state = self.state.lock().unwrap();
        Ok(state.unseen_in(0, None))
    }

    async fn fetch_header(&mut self, uid: u32) -> Result<MessageHeader, ImapError> {
        self.log(format!("fetch-header {uid}"));
        let state = self.state.lock().unwrap();
        if state.fail_header.contains(&uid) {
            return Err(ImapError::Protocol(format!("scripted header failure for {uid}")));
        }
        let message = state
            .messages
            .get(&uid)
            .ok_or_else(|| ImapError::Protocol(format!("no such uid {uid}")))?;
        Ok(MessageHeader {
            uid,
            sender: Some(message.sender.clone()),
        })
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ImapError> {
        self.log(format!("fetch-raw {uid}"));
        let state = self.state.lock().unwrap();
        if state.fail_body.contains(&uid) {
            return Err(ImapError::Protocol(format!("scripted body failure for {uid}")));
        }
        let message = state
            .messages
            .get(&uid)
            .ok_or_else(|| ImapError::Protocol(format!("no such uid {uid}")))?;
        Ok(message.raw.clone())
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), ImapError> {
        self.log(format!("mark-seen {uid}"));
        let mut state = self.state.lock().unwrap();
        if state.fail_mark_seen {
            return Err(ImapError::Protocol("scripted store failure".to_string()));
        }
        if let Some(message) = state.messages.get_mut(&uid) {
            message.unseen = false;
        }
        state.seen_marked.push(uid);
        Ok(())
    }

    async fn idle_wait(&mut self, wait: Duration) -> Result<IdleEvent, ImapError> {
        self.log("idle-wait".to_string());
        let scripted = self.state.lock().unwrap().idle_events.pop_front();
        match scripted {
            Some(event) => event,
            None => {
                // Idle mailbox: burn the wait slice so paused-clock
                // tests advance instead of busy-spinning.
                tokio::time::sleep(wait).await;
                Ok(IdleEvent::Timeout)
            }
        }
    }

    async fn reset_idle(&mut self) -> Result<(), ImapError> {
        self.log("reset-idle".to_string());
        Ok(())
    }

    async fn close(&mut self) {
        self.log("logout".to_string());
    }
}

/// Connector handing out sessions over one shared [`FakeState`].
pub struct FakeConnector {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new(state: Arc<Mutex<FakeState>>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn open(
        &self,
        _account: &AccountSyncState,
    ) -> Result<Box<dyn MailboxSession>, ImapError> {
        let (status, supports_idle) = {
            let mut state = self.state.lock().unwrap();
            state.opens += 1;
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            (state.status(), state.supports_idle)
        };
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            status,
            supports_idle,
        }))
    }
}
