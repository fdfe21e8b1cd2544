//! Module that contains the replicable state of a central manager.
//!
//! The primary owns its `State` exclusively and ships it wholesale to the
//! secondaries, which overwrite their copy on every `FORWARD_STATE`.

use crate::message::{Message, MessageType};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    error::Error,
};

/// Struct that tracks who can access a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmEntry {
    /// Processors holding a valid read-only copy.
    pub copy_array: Vec<usize>,
    /// Processor holding exclusive write access.
    pub owner: usize,
}

/// Enum that tells which request, if any, is in flight for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestStatus {
    #[default]
    Idle,
    PendingRead,
    PendingWrite,
}

/// FIFO of requests waiting for a page. Only the head is ever in flight.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageQueue(VecDeque<Message>);

/// Struct that pairs the status of a page with its queue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageRequests {
    pub status: RequestStatus,
    pub queue: PageQueue,
    /// Id of the last request of each processor retired for this page.
    #[serde(default)]
    pub completed: BTreeMap<usize, i64>,
}

/// Struct that represents the complete snapshot replicated to secondaries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct State {
    pub entries: BTreeMap<usize, CmEntry>,
    pub invalidation_counter: BTreeMap<usize, usize>,
    pub requests: BTreeMap<usize, PageRequests>,
}

impl CmEntry {
    pub fn new(owner: usize) -> Self {
        Self {
            copy_array: Vec::new(),
            owner,
        }
    }

    /// Function that records a new copy holder, once.
    pub fn add_copy(&mut self, processor: usize) {
        if !self.copy_array.contains(&processor) {
            self.copy_array.push(processor);
        }
    }
}

impl RequestStatus {
    /// Function that returns the status a request puts its page in.
    pub fn for_request(r#type: MessageType) -> Option<Self> {
        match r#type {
            MessageType::ReadRequest => Some(Self::PendingRead),
            MessageType::WriteRequest => Some(Self::PendingWrite),
            _ => None,
        }
    }
}

impl PageQueue {
    /// Function that appends a request unless an identical one is already queued.
    ///
    /// Returns `false` when the request was dropped as a duplicate.
    pub fn push(&mut self, message: Message) -> bool {
        if self.0.iter().any(|queued| queued.same_request(&message)) {
            return false;
        }
        self.0.push_back(message);
        true
    }

    pub fn head(&self) -> Option<&Message> {
        self.0.front()
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.0.pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PageRequests {
    /// Function that tells if the request was already retired.
    ///
    /// Requests carry an id in `content` that grows with every request of a
    /// processor, so a replay that arrives after its own completion is stale.
    pub fn already_completed(&self, message: &Message) -> bool {
        self.completed
            .get(&message.sender)
            .is_some_and(|last| message.content <= *last)
    }
}

impl State {
    /// Function that admits a request into its page queue.
    ///
    /// Returns `false` when an identical `(sender, type, page)` is already
    /// pending, or when the request has already been completed.
    pub fn enqueue(&mut self, message: Message) -> bool {
        let requests = self.requests.entry(message.page_id).or_default();
        if requests.already_completed(&message) {
            return false;
        }
        requests.queue.push(message)
    }

    pub fn status(&self, page_id: usize) -> RequestStatus {
        self.requests
            .get(&page_id)
            .map(|requests| requests.status)
            .unwrap_or_default()
    }

    pub fn set_status(&mut self, page_id: usize, status: RequestStatus) {
        self.requests.entry(page_id).or_default().status = status;
    }

    pub fn head(&self, page_id: usize) -> Option<&Message> {
        self.requests.get(&page_id).and_then(|requests| requests.queue.head())
    }

    /// Function that retires the head of a page queue and puts the page back to idle.
    pub fn complete(&mut self, page_id: usize) -> Option<Message> {
        let requests = self.requests.entry(page_id).or_default();
        requests.status = RequestStatus::Idle;
        let head = requests.queue.pop()?;
        let last = requests.completed.entry(head.sender).or_insert(head.content);
        *last = (*last).max(head.content);
        Some(head)
    }

    /// Function that picks the idle page with the longest backlog, lowest id first on ties.
    pub fn next_serviceable(&self) -> Option<usize> {
        self.requests
            .iter()
            .filter(|(_, requests)| {
                requests.status == RequestStatus::Idle && !requests.queue.is_empty()
            })
            .max_by(|(a_id, a), (b_id, b)| {
                a.queue.len().cmp(&b.queue.len()).then(b_id.cmp(a_id))
            })
            .map(|(page_id, _)| *page_id)
    }

    /// Function that lists the pages whose head request is in flight and matches the recorded status.
    pub fn in_flight_pages(&self) -> Vec<usize> {
        self.requests
            .iter()
            .filter(|(_, requests)| {
                requests.status != RequestStatus::Idle
                    && requests.queue.head().and_then(|head| RequestStatus::for_request(head.r#type))
                        == Some(requests.status)
            })
            .map(|(page_id, _)| *page_id)
            .collect()
    }

    /// Function that returns the state as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the state from a JSON formatted `String`.
    pub fn from_json_string(state: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sender: usize, r#type: MessageType, page_id: usize) -> Message {
        Message::new(sender, r#type, page_id).with_content(1)
    }

    #[test]
    fn duplicate_admission_is_dropped() {
        let mut state = State::default();
        assert!(state.enqueue(request(1, MessageType::WriteRequest, 0)));
        assert!(!state.enqueue(request(1, MessageType::WriteRequest, 0)));
        assert!(state.enqueue(request(1, MessageType::ReadRequest, 0)));
        assert!(state.enqueue(request(2, MessageType::WriteRequest, 0)));
        assert_eq!(state.requests[&0].queue.len(), 3);
    }

    #[test]
    fn longest_idle_backlog_is_serviced_first() {
        let mut state = State::default();
        state.enqueue(request(0, MessageType::ReadRequest, 1));
        state.enqueue(request(0, MessageType::ReadRequest, 2));
        state.enqueue(request(1, MessageType::ReadRequest, 2));
        state.enqueue(request(0, MessageType::ReadRequest, 3));
        state.enqueue(request(1, MessageType::ReadRequest, 3));
        state.enqueue(request(2, MessageType::ReadRequest, 3));
        assert_eq!(state.next_serviceable(), Some(3));

        state.set_status(3, RequestStatus::PendingRead);
        assert_eq!(state.next_serviceable(), Some(2));

        state.set_status(2, RequestStatus::PendingRead);
        assert_eq!(state.next_serviceable(), Some(1));
    }

    #[test]
    fn ties_go_to_the_lowest_page() {
        let mut state = State::default();
        state.enqueue(request(0, MessageType::ReadRequest, 5));
        state.enqueue(request(0, MessageType::ReadRequest, 2));
        assert_eq!(state.next_serviceable(), Some(2));
    }

    #[test]
    fn complete_pops_head_and_idles_page() {
        let mut state = State::default();
        state.enqueue(request(0, MessageType::WriteRequest, 0));
        state.enqueue(request(1, MessageType::ReadRequest, 0));
        state.set_status(0, RequestStatus::PendingWrite);

        let done = state.complete(0).unwrap();
        assert_eq!(done.sender, 0);
        assert_eq!(state.status(0), RequestStatus::Idle);
        assert_eq!(state.head(0).unwrap().sender, 1);
    }

    #[test]
    fn replay_after_completion_is_dropped() {
        let mut state = State::default();
        let first = request(1, MessageType::WriteRequest, 0);
        assert!(state.enqueue(first.clone()));
        state.set_status(0, RequestStatus::PendingWrite);
        state.complete(0);

        assert!(!state.enqueue(first));
        assert!(state.requests[&0].queue.is_empty());
        assert!(state.enqueue(request(1, MessageType::ReadRequest, 0).with_content(2)));
        assert!(state.enqueue(request(2, MessageType::WriteRequest, 0)));
    }

    #[test]
    fn in_flight_pages_require_matching_head() {
        let mut state = State::default();
        state.enqueue(request(0, MessageType::WriteRequest, 0));
        state.set_status(0, RequestStatus::PendingWrite);
        state.enqueue(request(1, MessageType::ReadRequest, 1));
        state.set_status(1, RequestStatus::PendingWrite);
        state.enqueue(request(2, MessageType::ReadRequest, 2));
        assert_eq!(state.in_flight_pages(), vec![0]);
    }

    #[test]
    fn snapshot_overwrites_wholesale() {
        let mut primary = State::default();
        primary.entries.insert(0, CmEntry::new(4));
        primary.entries.get_mut(&0).unwrap().add_copy(2);
        primary.entries.get_mut(&0).unwrap().add_copy(2);
        primary.invalidation_counter.insert(0, 1);
        primary.enqueue(request(3, MessageType::WriteRequest, 0));
        primary.requests.get_mut(&0).unwrap().completed.insert(1, 7);

        let secondary = State::from_json_string(&primary.to_json_string().unwrap()).unwrap();
        assert_eq!(secondary, primary);
        assert_eq!(secondary.entries[&0].copy_array, vec![2]);
    }
}
