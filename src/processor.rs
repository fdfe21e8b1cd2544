//! Module that contains the processor actor.
//!
//! A processor issues random reads and writes, caches the pages it was
//! granted, serves its pages peer-to-peer when the CM forwards a request to
//! it, and calls an election when one of its requests stalls.

use crate::{
    config::Config,
    election::{is_prober, ElectionRound},
    log,
    message::{Message, MessageType},
    network::Directory,
    operation::Operation,
    poisson::Poisson,
    state::RequestStatus,
};
use color_print::cformat;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Struct that represents the cached copy of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageCache {
    pub is_owner: bool,
    pub is_valid: bool,
    pub data: i64,
}

/// Struct that remembers an issued request so it can be timed out and replayed.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub timestamp: Instant,
    pub state: RequestStatus,
    pub message: Message,
}

/// Enum that represents the wakeups delivered on the timeout-check channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Check every pending request against the timeout.
    RequestTimeout,
    /// The probing window of the given election round is over.
    ElectionWindow(u64),
}

/// Struct that represents what a processor publishes after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorReport {
    pub id: usize,
    pub primary: usize,
    pub in_election: bool,
    pub pending_pages: Vec<usize>,
    pub cache: BTreeMap<usize, PageCache>,
}

pub struct Processor {
    pub id: usize,
    pub primary: usize,
    pages: usize,
    timeout: Duration,
    request_bound: Duration,
    cache: HashMap<usize, PageCache>,
    requests: HashMap<usize, RequestRecord>,
    election: ElectionRound,
    directory: Directory,
    poisson: Poisson<SmallRng>,
    rng: SmallRng,
    /// Id of the last request issued, carried in its `content`.
    last_request_id: i64,
    /// Peer-to-peer messages addressed to this processor itself.
    loopback: VecDeque<Message>,
    timer_tx: mpsc::Sender<Timer>,
    timer_rx: Option<mpsc::Receiver<Timer>>,
}

impl Processor {
    pub fn new(id: usize, primary: usize, config: &Config, directory: Directory) -> Self {
        let seed = config.seed.wrapping_add(id as u64);
        let (timer_tx, timer_rx) = mpsc::channel(config.pages * 2 + 8);
        Self {
            id,
            primary,
            pages: config.pages,
            timeout: config.timeout(),
            request_bound: config.request_interval_bound(),
            cache: HashMap::new(),
            requests: HashMap::new(),
            election: ElectionRound::default(),
            directory,
            poisson: Poisson::new(config.request_rate, seed),
            rng: SmallRng::seed_from_u64(seed.rotate_left(17)),
            last_request_id: 0,
            loopback: VecDeque::new(),
            timer_tx,
            timer_rx: Some(timer_rx),
        }
    }

    fn label(&self) -> String {
        cformat!("<magenta, bold>P {}</magenta, bold>", self.id)
    }

    pub fn cache(&self, page_id: usize) -> PageCache {
        self.cache.get(&page_id).copied().unwrap_or_default()
    }

    pub fn request_state(&self, page_id: usize) -> RequestStatus {
        self.requests
            .get(&page_id)
            .map(|record| record.state)
            .unwrap_or_default()
    }

    pub fn in_election(&self) -> bool {
        self.election.in_election()
    }

    pub fn report(&self) -> ProcessorReport {
        let mut pending_pages: Vec<usize> = self
            .requests
            .iter()
            .filter(|(_, record)| record.state != RequestStatus::Idle)
            .map(|(page_id, _)| *page_id)
            .collect();
        pending_pages.sort_unstable();
        ProcessorReport {
            id: self.id,
            primary: self.primary,
            in_election: self.in_election(),
            pending_pages,
            cache: self.cache.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    /// Function that runs the processor until shutdown.
    pub async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Message>,
        report: watch::Sender<ProcessorReport>,
        shutdown: CancellationToken,
    ) {
        let Some(mut timers) = self.timer_rx.take() else {
            log::error(&format!("{}: already running.", self.label()));
            return;
        };
        report.send_replace(self.report());

        let next_request = tokio::time::sleep(self.poisson.next_interval(self.request_bound));
        tokio::pin!(next_request);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(message) = mailbox.recv() => self.handle_message(message),
                Some(timer) = timers.recv() => self.handle_timer(timer),
                _ = &mut next_request => {
                    if !self.in_election() {
                        self.send_random_request();
                    }
                    let gap = self.poisson.next_interval(self.request_bound);
                    next_request.as_mut().reset(Instant::now() + gap);
                }
                else => break,
            }
            self.drain_loopback();
            report.send_replace(self.report());
        }

        log::debug(&format!("{}: stopped.", self.label()));
    }

    /// Function that handles the messages this processor sent to itself.
    pub fn drain_loopback(&mut self) {
        while let Some(message) = self.loopback.pop_front() {
            self.handle_message(message);
        }
    }

    fn send_peer(&mut self, target: usize, message: Message) {
        if target == self.id {
            self.loopback.push_back(message);
        } else {
            self.directory.to_processor(target, message);
        }
    }

    fn confirm(&self, r#type: MessageType, page_id: usize) {
        self.directory
            .to_cm_confirmation(self.primary, Message::new(self.id, r#type, page_id));
    }

    fn schedule(&self, timer: Timer, after: Duration) {
        let timer_tx = self.timer_tx.clone();
        let id = self.id;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if timer_tx.send(timer).await.is_err() {
                log::debug(&format!("P {}: stopped before {:?} fired.", id, timer));
            }
        });
    }

    fn send_random_request(&mut self) {
        let page_id = self.rng.random_range(0..self.pages);
        let operation = Operation::generate(&mut self.rng);
        self.request(page_id, operation);
    }

    /// Function that asks the primary for access to a page.
    ///
    /// Returns `false` when the cache discipline forbids the request: a
    /// request for the page is already pending, the page is owned, or a read
    /// targets a valid copy.
    pub fn request(&mut self, page_id: usize, operation: Operation) -> bool {
        let cached = self.cache(page_id);
        if self.request_state(page_id) != RequestStatus::Idle
            || cached.is_owner
            || (operation == Operation::Read && cached.is_valid)
        {
            return false;
        }

        let state = match operation {
            Operation::Read => RequestStatus::PendingRead,
            Operation::Write => {
                // Ownership is taken before the CM grants it.
                self.cache.insert(
                    page_id,
                    PageCache {
                        is_owner: true,
                        is_valid: true,
                        data: self.id as i64,
                    },
                );
                RequestStatus::PendingWrite
            }
        };

        self.last_request_id += 1;
        let message = Message::new(self.id, operation.request_type(), page_id)
            .with_content(self.last_request_id);
        self.directory.to_cm_incoming(self.primary, message.clone());
        self.requests.insert(
            page_id,
            RequestRecord {
                timestamp: Instant::now(),
                state,
                message,
            },
        );
        self.schedule(Timer::RequestTimeout, self.timeout);

        log::info(&cformat!(
            "{}: <bold>{}</bold> sent for page <bold>{}</bold>.",
            self.label(),
            operation.request_type(),
            page_id
        ));
        true
    }

    fn finish_request(&mut self, page_id: usize) -> Option<RequestRecord> {
        let record = self.requests.get_mut(&page_id)?;
        let finished = record.clone();
        record.state = RequestStatus::Idle;
        Some(finished)
    }

    pub fn handle_message(&mut self, message: Message) {
        log::debug(&format!("{}: {}", self.label(), message.describe()));

        match message.r#type {
            MessageType::WriteForward => self.handle_write_forward(message),
            MessageType::ReadForward => self.handle_read_forward(message),
            MessageType::PageCopyForward => self.handle_page_copy_forward(message),
            MessageType::PageToWrite => self.handle_page_to_write(message),
            MessageType::InvalidateCopy => self.handle_invalidate_copy(message),
            MessageType::PageNotFound => self.handle_page_not_found(message),
            MessageType::StartElection => self.handle_start_election(message),
            MessageType::Acknowledge => {
                self.election.acknowledge(message.sender, message.content != 0)
            }
            MessageType::AnnouncePrimary => self.handle_announce_primary(message),
            MessageType::ReadRequest
            | MessageType::WriteRequest
            | MessageType::ReadConfirmation
            | MessageType::InvalidateConfirmation
            | MessageType::WriteConfirmation
            | MessageType::ForwardState
            | MessageType::Elect
            | MessageType::CheckAlive => {
                log::warn(&format!(
                    "{}: unexpected {}, ignoring.",
                    self.label(),
                    message.describe()
                ));
            }
        }
    }

    fn handle_write_forward(&mut self, message: Message) {
        let data = self.cache(message.page_id).data;
        self.cache.insert(
            message.page_id,
            PageCache {
                is_owner: false,
                is_valid: false,
                data,
            },
        );
        log::info(&cformat!(
            "{}: page <bold>{}</bold> handed over to P {}.",
            self.label(),
            message.page_id,
            message.sender
        ));
        let reply = Message::new(self.id, MessageType::PageToWrite, message.page_id).with_content(data);
        self.send_peer(message.sender, reply);
    }

    fn handle_read_forward(&mut self, message: Message) {
        let data = self.cache(message.page_id).data;
        let reply =
            Message::new(self.id, MessageType::PageCopyForward, message.page_id).with_content(data);
        self.send_peer(message.sender, reply);
    }

    fn handle_page_copy_forward(&mut self, message: Message) {
        let page_id = message.page_id;
        if self.request_state(page_id) != RequestStatus::PendingRead {
            let cached = self.cache(page_id);
            if cached.is_valid && !cached.is_owner {
                self.confirm(MessageType::ReadConfirmation, page_id);
            }
            return;
        }

        self.cache.insert(
            page_id,
            PageCache {
                is_owner: false,
                is_valid: true,
                data: message.content,
            },
        );
        self.finish_request(page_id);
        self.confirm(MessageType::ReadConfirmation, page_id);
        log::info(&cformat!(
            "{}: read page <bold>{}</bold> = <bold>{}</bold>.",
            self.label(),
            page_id,
            message.content
        ));
    }

    fn handle_page_to_write(&mut self, message: Message) {
        let page_id = message.page_id;
        if self.request_state(page_id) != RequestStatus::PendingWrite {
            if self.cache(page_id).is_owner {
                self.confirm(MessageType::WriteConfirmation, page_id);
            }
            return;
        }

        if self.finish_request(page_id).is_none() {
            return;
        }
        let data = self.id as i64;
        self.cache.insert(
            page_id,
            PageCache {
                is_owner: true,
                is_valid: true,
                data,
            },
        );
        self.confirm(MessageType::WriteConfirmation, page_id);
        log::info(&cformat!(
            "{}: wrote page <bold>{}</bold> = <bold>{}</bold>.",
            self.label(),
            page_id,
            data
        ));
    }

    fn handle_invalidate_copy(&mut self, message: Message) {
        let data = self.cache(message.page_id).data;
        self.cache.insert(
            message.page_id,
            PageCache {
                is_owner: false,
                is_valid: false,
                data,
            },
        );
        self.confirm(MessageType::InvalidateConfirmation, message.page_id);
        log::debug(&format!(
            "{}: copy of page {} invalidated.",
            self.label(),
            message.page_id
        ));
    }

    fn handle_page_not_found(&mut self, message: Message) {
        if self.finish_request(message.page_id).is_some() {
            log::info(&cformat!(
                "{}: page <bold>{}</bold> not found, giving up.",
                self.label(),
                message.page_id
            ));
        }
    }

    pub fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::RequestTimeout => self.check_timeouts(),
            Timer::ElectionWindow(round) => self.close_election_window(round),
        }
    }

    fn check_timeouts(&mut self) {
        if self.in_election() {
            return;
        }
        let now = Instant::now();
        let expired = self
            .requests
            .values()
            .find(|record| {
                record.state != RequestStatus::Idle && now >= record.timestamp + self.timeout
            })
            .map(|record| (record.message.r#type, record.message.page_id));
        if let Some((r#type, page_id)) = expired {
            log::warn(&cformat!(
                "{}: <bold>{}</bold> for page <bold>{}</bold> timed out.",
                self.label(),
                r#type,
                page_id
            ));
            self.start_election();
        }
    }

    /// Function that tells every processor to enter an election.
    pub fn start_election(&mut self) {
        if self.in_election() {
            return;
        }
        log::info(&format!("{}: broadcasting election.", self.label()));
        self.directory
            .broadcast_processors(&Message::control(self.id, MessageType::StartElection));
    }

    fn handle_start_election(&mut self, _message: Message) {
        let entered = self.election.enter();
        let prober = is_prober(self.id, self.directory.processor_count());
        if entered {
            log::info(&format!("{}: entering election.", self.label()));
        }
        // A stalled prober probes again on any later call.
        if prober && (entered || !self.election.probing) {
            self.probe();
        }
    }

    fn probe(&mut self) {
        let round = self.election.open_probe();
        log::info(&format!("{}: probing central managers (round {}).", self.label(), round));
        for central_manager in 0..self.directory.central_manager_count() {
            self.directory.to_cm_confirmation(
                central_manager,
                Message::control(self.id, MessageType::CheckAlive),
            );
        }
        self.schedule(Timer::ElectionWindow(round), self.timeout);
    }

    fn close_election_window(&mut self, round: u64) {
        if round != self.election.round || !self.election.probing {
            return;
        }
        match self.election.close_probe(round) {
            Some(central_manager) => {
                log::info(&cformat!(
                    "{}: electing <bold>CM {}</bold>.",
                    self.label(),
                    central_manager
                ));
                self.directory.to_cm_confirmation(
                    central_manager,
                    Message::control(self.id, MessageType::Elect),
                );
            }
            None => log::error(&format!(
                "{}: no central manager acknowledged, election stalled.",
                self.label()
            )),
        }
    }

    /// Function that follows the new primary and resubmits every pending request to it.
    fn handle_announce_primary(&mut self, message: Message) {
        self.primary = message.sender;
        self.election.finish();
        log::info(&cformat!(
            "{}: <bold>CM {}</bold> is the primary.",
            self.label(),
            self.primary
        ));

        let now = Instant::now();
        let mut resubmitted = 0;
        for record in self.requests.values_mut() {
            if record.state == RequestStatus::Idle {
                continue;
            }
            self.directory
                .to_cm_incoming(self.primary, record.message.clone());
            record.timestamp = now;
            resubmitted += 1;
        }
        for _ in 0..resubmitted {
            self.schedule(Timer::RequestTimeout, self.timeout);
        }
    }
}
