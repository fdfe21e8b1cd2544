//! Module that contains the mailboxes connecting every actor.
//!
//! Channels stand in for the wire: every actor owns the receiving half of its
//! mailboxes and every actor holds a `Directory` with the sending halves.

use crate::{log, message::Message};
use color_print::cformat;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

/// Enum that names the mailbox a message is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The single mailbox of a processor.
    Processor(usize),
    /// The request queue of a central manager.
    Incoming(usize),
    /// The confirmation/control queue of a central manager.
    Confirmation(usize),
}

/// Receiving halves owned by a central manager.
pub struct CmMailboxes {
    pub incoming: Receiver<Message>,
    pub confirmations: Receiver<Message>,
}

#[derive(Clone)]
pub struct Directory {
    processors: Vec<Sender<Message>>,
    cm_incoming: Vec<Sender<Message>>,
    cm_confirmations: Vec<Sender<Message>>,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Processor(id) => write!(f, "P {}", id),
            Endpoint::Incoming(id) => write!(f, "CM {} (incoming)", id),
            Endpoint::Confirmation(id) => write!(f, "CM {} (confirmation)", id),
        }
    }
}

impl Directory {
    /// Function that creates every mailbox of the cluster.
    ///
    /// Returns the directory together with the receiving halves, indexed by actor id.
    pub fn new(
        processors: usize,
        central_managers: usize,
        capacity: usize,
    ) -> (Self, Vec<Receiver<Message>>, Vec<CmMailboxes>) {
        let (processor_senders, processor_receivers): (Vec<_>, Vec<_>) =
            (0..processors).map(|_| mpsc::channel(capacity)).unzip();

        let mut cm_incoming = Vec::with_capacity(central_managers);
        let mut cm_confirmations = Vec::with_capacity(central_managers);
        let mut cm_mailboxes = Vec::with_capacity(central_managers);
        for _ in 0..central_managers {
            let (incoming_tx, incoming) = mpsc::channel(capacity);
            let (confirmation_tx, confirmations) = mpsc::channel(capacity);
            cm_incoming.push(incoming_tx);
            cm_confirmations.push(confirmation_tx);
            cm_mailboxes.push(CmMailboxes {
                incoming,
                confirmations,
            });
        }

        (
            Self {
                processors: processor_senders,
                cm_incoming,
                cm_confirmations,
            },
            processor_receivers,
            cm_mailboxes,
        )
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    pub fn central_manager_count(&self) -> usize {
        self.cm_incoming.len()
    }

    fn sender(&self, endpoint: Endpoint) -> Option<&Sender<Message>> {
        match endpoint {
            Endpoint::Processor(id) => self.processors.get(id),
            Endpoint::Incoming(id) => self.cm_incoming.get(id),
            Endpoint::Confirmation(id) => self.cm_confirmations.get(id),
        }
    }

    /// Function that delivers a message without blocking the caller.
    ///
    /// A full mailbox hands the send to a helper task, which waits for room.
    /// A closed mailbox (hard-dead CM, shutdown) drops the message.
    pub fn post(&self, endpoint: Endpoint, message: Message) {
        let Some(sender) = self.sender(endpoint) else {
            log::warn(&cformat!(
                "No mailbox for <bold>{}</bold>, dropping {}.",
                endpoint,
                message.describe()
            ));
            return;
        };

        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    if sender.send(message).await.is_err() {
                        log::debug(&format!("Mailbox of {} closed while waiting for room.", endpoint));
                    }
                });
            }
            Err(TrySendError::Closed(message)) => {
                log::debug(&cformat!(
                    "Mailbox of <bold>{}</bold> is closed, dropping {}.",
                    endpoint,
                    message.describe()
                ));
            }
        }
    }

    pub fn to_processor(&self, id: usize, message: Message) {
        self.post(Endpoint::Processor(id), message);
    }

    pub fn to_cm_incoming(&self, id: usize, message: Message) {
        self.post(Endpoint::Incoming(id), message);
    }

    pub fn to_cm_confirmation(&self, id: usize, message: Message) {
        self.post(Endpoint::Confirmation(id), message);
    }

    /// Function that sends a copy of the message to every processor.
    pub fn broadcast_processors(&self, message: &Message) {
        for id in 0..self.processor_count() {
            self.to_processor(id, message.clone());
        }
    }

    /// Function that sends a copy of the message to every central manager but `except`.
    pub fn broadcast_cms(&self, except: Option<usize>, message: &Message) {
        for id in 0..self.central_manager_count() {
            if Some(id) != except {
                self.to_cm_confirmation(id, message.clone());
            }
        }
    }
}
