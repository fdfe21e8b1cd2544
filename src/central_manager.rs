//! Module that contains the central manager actor.
//!
//! The primary serializes access to every page through its per-page queue,
//! drives invalidation before a write is handed off, and ships its whole
//! `State` to the secondaries after every change. Secondaries only mirror
//! that state until one of them is elected.

use crate::{
    fault::{DeathMode, FaultPlan},
    log,
    message::{Message, MessageType},
    network::{CmMailboxes, Directory},
    state::{CmEntry, RequestStatus, State},
};
use color_print::cformat;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Struct that represents what a central manager publishes after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmReport {
    pub id: usize,
    pub is_primary: bool,
    pub is_alive: bool,
    pub state: State,
}

pub struct CentralManager {
    pub id: usize,
    pub is_primary: bool,
    pub is_alive: bool,
    /// False after a resurrection, until a fresh snapshot has been applied.
    synced: bool,
    known_primary: Option<usize>,
    current_state: State,
    directory: Directory,
    faults: FaultPlan,
    dirty: bool,
}

impl CentralManager {
    pub fn new(id: usize, is_primary: bool, directory: Directory, faults: FaultPlan) -> Self {
        Self {
            id,
            is_primary,
            is_alive: true,
            synced: true,
            known_primary: if is_primary { Some(id) } else { None },
            current_state: State::default(),
            directory,
            faults,
            dirty: false,
        }
    }

    /// Function that tells a secondary who the primary is before any announcement.
    pub fn with_known_primary(mut self, primary: usize) -> Self {
        self.known_primary = Some(primary);
        self
    }

    pub fn state(&self) -> &State {
        &self.current_state
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn report(&self) -> CmReport {
        CmReport {
            id: self.id,
            is_primary: self.is_primary,
            is_alive: self.is_alive,
            state: self.current_state.clone(),
        }
    }

    fn label(&self) -> String {
        cformat!("<blue, bold>CM {}</blue, bold>", self.id)
    }

    /// Function that runs the central manager until shutdown or hard death.
    pub async fn run(
        mut self,
        mut mailboxes: CmMailboxes,
        report: watch::Sender<CmReport>,
        shutdown: CancellationToken,
    ) {
        log::debug(&format!("{}: starting (primary: {}).", self.label(), self.is_primary));
        report.send_replace(self.report());

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(message) = mailboxes.confirmations.recv() => message,
                Some(message) = mailboxes.incoming.recv() => message,
                else => break,
            };

            let death = self.handle_message(message);
            self.service_queues();
            self.replicate();
            report.send_replace(self.report());

            match death {
                None => {}
                Some(DeathMode::Hard) => {
                    self.die();
                    report.send_replace(self.report());
                    log::warn(&format!("{}: died for good.", self.label()));
                    return;
                }
                Some(mode @ DeathMode::Soft { .. }) => {
                    self.die();
                    report.send_replace(self.report());
                    let Some(delay) = mode.resurrect_after() else {
                        return;
                    };
                    log::warn(&cformat!(
                        "{}: died, resurrecting in <bold>{:?}</bold>.",
                        self.label(),
                        delay
                    ));
                    if !Self::stay_dead(delay, &mut mailboxes, &shutdown).await {
                        break;
                    }
                    self.resurrect();
                    report.send_replace(self.report());
                }
            }
        }

        log::debug(&format!("{}: stopped.", self.label()));
    }

    /// Function that discards everything delivered while dead.
    ///
    /// Returns `false` if shutdown was requested meanwhile.
    async fn stay_dead(
        delay: std::time::Duration,
        mailboxes: &mut CmMailboxes,
        shutdown: &CancellationToken,
    ) -> bool {
        let wake = tokio::time::sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = &mut wake => return true,
                Some(_) = mailboxes.confirmations.recv() => {}
                Some(_) = mailboxes.incoming.recv() => {}
            }
        }
    }

    fn die(&mut self) {
        self.is_alive = false;
        self.is_primary = false;
        self.dirty = false;
    }

    /// Function that brings the central manager back as an unsynced secondary and calls an election.
    pub fn resurrect(&mut self) {
        self.is_alive = true;
        self.is_primary = false;
        self.synced = false;
        self.known_primary = None;
        log::info(&format!("{}: resurrected, calling an election.", self.label()));
        self.directory
            .broadcast_processors(&Message::control(self.id, MessageType::StartElection));
    }

    /// Function that handles one inbound message.
    ///
    /// Returns the scripted death to enact once the message has been handled.
    pub fn handle_message(&mut self, message: Message) -> Option<DeathMode> {
        log::debug(&format!("{}: {}", self.label(), message.describe()));

        match message.r#type {
            MessageType::ReadRequest | MessageType::WriteRequest => self.admit(message),
            MessageType::ReadConfirmation => self.handle_read_confirmation(message),
            MessageType::WriteConfirmation => self.handle_write_confirmation(message),
            MessageType::InvalidateConfirmation => self.handle_invalidate_confirmation(message),
            MessageType::ForwardState => self.handle_forward_state(message),
            MessageType::CheckAlive => self.handle_check_alive(message),
            MessageType::Elect => self.handle_elect(message),
            MessageType::AnnouncePrimary => self.handle_announce_primary(message),
            MessageType::ReadForward
            | MessageType::PageCopyForward
            | MessageType::InvalidateCopy
            | MessageType::WriteForward
            | MessageType::PageToWrite
            | MessageType::PageNotFound
            | MessageType::StartElection
            | MessageType::Acknowledge => {
                log::warn(&format!(
                    "{}: unexpected {}, ignoring.",
                    self.label(),
                    message.describe()
                ));
            }
        }

        self.faults.tick()
    }

    /// Function that hands a request or confirmation to the primary when this CM is a secondary.
    ///
    /// Returns `true` if the message was taken care of here.
    fn relay_if_secondary(&self, message: &Message) -> bool {
        if self.is_primary {
            return false;
        }
        match self.known_primary {
            Some(primary) if primary != self.id => {
                log::debug(&format!("{}: relaying to CM {}.", self.label(), primary));
                if message.r#type.is_request() {
                    self.directory.to_cm_incoming(primary, message.clone());
                } else {
                    self.directory.to_cm_confirmation(primary, message.clone());
                }
            }
            _ => log::debug(&format!(
                "{}: not primary, dropping {}.",
                self.label(),
                message.describe()
            )),
        }
        true
    }

    fn admit(&mut self, message: Message) {
        if self.relay_if_secondary(&message) {
            return;
        }
        let (sender, page_id) = (message.sender, message.page_id);
        if self.current_state.enqueue(message) {
            self.dirty = true;
        } else {
            log::debug(&format!(
                "{}: duplicate request from {} for page {} dropped.",
                self.label(),
                sender,
                page_id
            ));
        }
    }

    /// Function that starts the head request of every idle page, longest backlog first.
    pub fn service_queues(&mut self) {
        if !self.is_primary || !self.is_alive {
            return;
        }
        while let Some(page_id) = self.current_state.next_serviceable() {
            let Some(head) = self.current_state.head(page_id).cloned() else {
                break;
            };
            self.dispatch_request(head);
        }
    }

    fn dispatch_request(&mut self, request: Message) {
        match request.r#type {
            MessageType::ReadRequest => self.start_read(request),
            MessageType::WriteRequest => self.start_write(request),
            _ => {
                log::error(&format!(
                    "{}: {} cannot sit in a page queue, discarding.",
                    self.label(),
                    request.describe()
                ));
                self.current_state.complete(request.page_id);
            }
        }
        self.dirty = true;
    }

    fn start_read(&mut self, request: Message) {
        let page_id = request.page_id;
        let Some(entry) = self.current_state.entries.get(&page_id) else {
            log::info(&cformat!(
                "{}: page <bold>{}</bold> not found for P {}.",
                self.label(),
                page_id,
                request.sender
            ));
            self.current_state.complete(page_id);
            self.directory.to_processor(
                request.sender,
                Message::new(self.id, MessageType::PageNotFound, page_id),
            );
            return;
        };
        let owner = entry.owner;
        self.current_state.set_status(page_id, RequestStatus::PendingRead);
        self.directory.to_processor(
            owner,
            Message::new(request.sender, MessageType::ReadForward, page_id),
        );
    }

    fn start_write(&mut self, request: Message) {
        let (requester, page_id) = (request.sender, request.page_id);
        self.current_state.set_status(page_id, RequestStatus::PendingWrite);

        match self.current_state.entries.get(&page_id) {
            None => {
                self.current_state.entries.insert(page_id, CmEntry::new(requester));
                self.directory.to_processor(
                    requester,
                    Message::new(self.id, MessageType::PageToWrite, page_id),
                );
            }
            Some(entry) if !entry.copy_array.is_empty() => {
                let holders = entry.copy_array.clone();
                self.invalidate_copies(page_id, requester, holders);
            }
            Some(entry) if entry.owner == requester => {
                self.directory.to_processor(
                    requester,
                    Message::new(self.id, MessageType::PageToWrite, page_id),
                );
            }
            Some(_) => self.hand_off_write(page_id, requester),
        }
    }

    /// Function that sends exactly one `INVALIDATE_COPY` per holder but the requester.
    fn invalidate_copies(&mut self, page_id: usize, requester: usize, holders: Vec<usize>) {
        self.current_state
            .invalidation_counter
            .insert(page_id, holders.len());
        log::debug(&format!(
            "{}: invalidating {:?} for page {}.",
            self.label(),
            holders,
            page_id
        ));

        for holder in holders.iter().copied().filter(|holder| *holder != requester) {
            self.directory.to_processor(
                holder,
                Message::new(self.id, MessageType::InvalidateCopy, page_id),
            );
        }

        if holders.contains(&requester) {
            self.confirm_invalidation(page_id);
        }
    }

    /// Function that asks the current owner to pass the page to `requester`.
    fn hand_off_write(&mut self, page_id: usize, requester: usize) {
        let Some(owner) = self.current_state.entries.get(&page_id).map(|entry| entry.owner) else {
            return;
        };
        self.directory.to_processor(
            owner,
            Message::new(requester, MessageType::WriteForward, page_id),
        );
    }

    fn confirm_invalidation(&mut self, page_id: usize) {
        if self.current_state.status(page_id) != RequestStatus::PendingWrite {
            log::debug(&format!(
                "{}: stale invalidation confirmation for page {}.",
                self.label(),
                page_id
            ));
            return;
        }
        let Some(counter) = self.current_state.invalidation_counter.get_mut(&page_id) else {
            return;
        };
        if *counter == 0 {
            return;
        }
        *counter -= 1;
        self.dirty = true;
        if *counter > 0 {
            return;
        }

        self.current_state.invalidation_counter.remove(&page_id);
        if let Some(entry) = self.current_state.entries.get_mut(&page_id) {
            entry.copy_array.clear();
        }
        let Some(requester) = self.current_state.head(page_id).map(|head| head.sender) else {
            return;
        };
        self.hand_off_write(page_id, requester);
    }

    fn handle_invalidate_confirmation(&mut self, message: Message) {
        if self.relay_if_secondary(&message) {
            return;
        }
        self.confirm_invalidation(message.page_id);
    }

    /// Function that tells if a confirmation matches the in-flight head of its page.
    fn confirms_head(&self, message: &Message, expected: RequestStatus) -> bool {
        self.current_state.status(message.page_id) == expected
            && self
                .current_state
                .head(message.page_id)
                .is_some_and(|head| {
                    head.sender == message.sender
                        && RequestStatus::for_request(head.r#type) == Some(expected)
                })
    }

    fn handle_read_confirmation(&mut self, message: Message) {
        if self.relay_if_secondary(&message) {
            return;
        }
        if !self.confirms_head(&message, RequestStatus::PendingRead) {
            log::debug(&format!(
                "{}: stale {}, ignoring.",
                self.label(),
                message.describe()
            ));
            return;
        }
        let Some(entry) = self.current_state.entries.get_mut(&message.page_id) else {
            log::error(&format!(
                "{}: page {} not found on read confirmation.",
                self.label(),
                message.page_id
            ));
            return;
        };
        entry.add_copy(message.sender);
        self.current_state.complete(message.page_id);
        self.dirty = true;
        log::info(&cformat!(
            "{}: P {} now holds a copy of page <bold>{}</bold>.",
            self.label(),
            message.sender,
            message.page_id
        ));
    }

    fn handle_write_confirmation(&mut self, message: Message) {
        if self.relay_if_secondary(&message) {
            return;
        }
        if !self.confirms_head(&message, RequestStatus::PendingWrite) {
            log::debug(&format!(
                "{}: stale {}, ignoring.",
                self.label(),
                message.describe()
            ));
            return;
        }
        self.current_state
            .entries
            .entry(message.page_id)
            .and_modify(|entry| entry.owner = message.sender)
            .or_insert_with(|| CmEntry::new(message.sender));
        self.current_state.invalidation_counter.remove(&message.page_id);
        self.current_state.complete(message.page_id);
        self.dirty = true;
        log::info(&cformat!(
            "{}: P {} now owns page <bold>{}</bold>.",
            self.label(),
            message.sender,
            message.page_id
        ));
    }

    fn handle_forward_state(&mut self, message: Message) {
        if self.is_primary {
            log::debug(&format!("{}: primary ignores forwarded state.", self.label()));
            return;
        }
        let Some(blob) = message.state.as_deref() else {
            log::error(&format!("{}: forwarded state without a snapshot.", self.label()));
            return;
        };
        match State::from_json_string(blob) {
            Ok(state) => {
                self.current_state = state;
                self.synced = true;
                self.known_primary = Some(message.sender);
            }
            Err(e) => log::error(&format!(
                "{}: unreadable snapshot, keeping the last good one: {}",
                self.label(),
                e
            )),
        }
    }

    /// Function that ships the whole state to every secondary if it changed.
    pub fn replicate(&mut self) {
        if !self.is_primary || !self.dirty {
            return;
        }
        self.dirty = false;
        match self.current_state.to_json_string() {
            Ok(blob) => {
                let forward = Message::control(self.id, MessageType::ForwardState).with_state(blob);
                self.directory.broadcast_cms(Some(self.id), &forward);
            }
            Err(e) => log::error(&format!(
                "{}: failed to serialize state, skipping replication: {}",
                self.label(),
                e
            )),
        }
    }

    /// Function that answers a prober, telling it whether this replica is current.
    fn handle_check_alive(&mut self, message: Message) {
        if !self.synced {
            log::debug(&format!(
                "{}: acknowledging P {} as unsynced.",
                self.label(),
                message.sender
            ));
        }
        self.directory.to_processor(
            message.sender,
            Message::control(self.id, MessageType::Acknowledge).with_content(self.synced as i64),
        );
    }

    fn handle_elect(&mut self, message: Message) {
        log::info(&cformat!(
            "{}: elected <bold>primary</bold> by P {}.",
            self.label(),
            message.sender
        ));
        self.is_primary = true;
        self.synced = true;
        self.known_primary = Some(self.id);

        // Processors must follow the new primary before any replayed grant
        // reaches them, or their confirmations go to the dead one.
        let announcement = Message::control(self.id, MessageType::AnnouncePrimary);
        self.directory.broadcast_processors(&announcement);
        self.directory.broadcast_cms(Some(self.id), &announcement);

        for page_id in self.current_state.in_flight_pages() {
            if let Some(head) = self.current_state.head(page_id).cloned() {
                log::debug(&format!("{}: replaying {}.", self.label(), head.describe()));
                self.dispatch_request(head);
            }
        }
        self.dirty = true;
    }

    fn handle_announce_primary(&mut self, message: Message) {
        if message.sender == self.id {
            return;
        }
        self.is_primary = false;
        self.known_primary = Some(message.sender);
        log::debug(&format!(
            "{}: CM {} is the primary now.",
            self.label(),
            message.sender
        ));
    }
}
