//! Document change notifications.
//!
//! A multi-channel publisher with typed messages. Subscribers pick the
//! channels they care about with an [`EventMask`] and receive over a
//! `crossbeam` channel. Delivery happens synchronously on the mutating
//! thread, after the mutation committed and after the document's locks were
//! released, so handlers may read the document but must not expect to observe
//! the pre-mutation state. Dropping the receiver detaches the subscription;
//! the hub prunes dead subscribers on the next publish.

use core_address::Address;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;

use crate::label::Label;

bitflags::bitflags! {
    /// Channel selection for subscribers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        const QUIT                = 1 << 0;
        const DOCUMENT_UPDATED    = 1 << 1;
        const MEMORY_AREA_UPDATED = 1 << 2;
        const ADDRESS_UPDATED     = 1 << 3;
        const LABEL_UPDATED       = 1 << 4;
        const TASK_UPDATED        = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Started,
    Finished,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    Quit,
    /// Coarse "something changed" summary, always last in a transaction.
    DocumentUpdated,
    MemoryAreaUpdated {
        name: String,
        start: Address,
        removed: bool,
    },
    /// Addresses whose cells changed in one transaction.
    AddressUpdated(Vec<Address>),
    LabelUpdated {
        address: Address,
        label: Label,
        removed: bool,
    },
    TaskUpdated {
        name: String,
        status: TaskStatus,
    },
}

impl DocumentEvent {
    pub fn mask(&self) -> EventMask {
        match self {
            DocumentEvent::Quit => EventMask::QUIT,
            DocumentEvent::DocumentUpdated => EventMask::DOCUMENT_UPDATED,
            DocumentEvent::MemoryAreaUpdated { .. } => EventMask::MEMORY_AREA_UPDATED,
            DocumentEvent::AddressUpdated(_) => EventMask::ADDRESS_UPDATED,
            DocumentEvent::LabelUpdated { .. } => EventMask::LABEL_UPDATED,
            DocumentEvent::TaskUpdated { .. } => EventMask::TASK_UPDATED,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<(EventMask, Sender<DocumentEvent>)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for the channels selected by `mask`.
    pub fn subscribe(&self, mask: EventMask) -> Receiver<DocumentEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .expect("event hub poisoned")
            .push((mask, tx));
        rx
    }

    pub fn publish(&self, event: DocumentEvent) {
        let mask = event.mask();
        let mut subscribers = self.subscribers.lock().expect("event hub poisoned");
        subscribers
            .retain(|(sub_mask, tx)| !sub_mask.contains(mask) || tx.send(event.clone()).is_ok());
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = DocumentEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event hub poisoned").len()
    }
}
