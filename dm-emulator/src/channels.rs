//! Bounded queues between the scheduler and the runtime threads.

use crossbeam_channel::{Sender, TrySendError};
use dm_core::scheduler::{EnqueueError, QueueProducer};

/// Depth of the queue feeding the arbiter-call thread.
pub const SESSION_COMMAND_DEPTH: usize = 8;

/// Depth of the queue feeding the DM worker thread.
pub const DM_EVENT_DEPTH: usize = 16;

/// Non-blocking producer over a bounded `crossbeam-channel` sender.
#[derive(Debug)]
pub struct ChannelProducer<T> {
    sender: Sender<T>,
}

impl<T> ChannelProducer<T> {
    pub fn new(sender: Sender<T>) -> Self {
        Self { sender }
    }
}

impl<T> Clone for ChannelProducer<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> QueueProducer<T> for ChannelProducer<T> {
    fn try_enqueue(&self, item: T) -> Result<(), EnqueueError> {
        self.sender.try_send(item).map_err(|error| match error {
            TrySendError::Full(_) => EnqueueError::QueueFull,
            TrySendError::Disconnected(_) => EnqueueError::Disconnected,
        })
    }

    fn capacity(&self) -> Option<usize> {
        self.sender.capacity()
    }
}
