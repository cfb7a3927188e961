use dashmap::DashMap;
use log::{debug, warn};
use rand::Rng;
use thiserror::Error;
use tokio::runtime::Handle;

use std::time::Duration;

use super::message::{Message, Outbox};
use crate::blockchain::Address;

/// Errors that can occur while handing a message to the simulated network
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Message loss probability must be within [0, 1], got {0}")]
    InvalidLossProbability(f64),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Delayed delivery requires a running tokio runtime")]
    NoRuntime,
}

/// Simulates an unreliable network between in-process nodes.
///
/// Every payload is encoded and decoded on send, so receivers only ever
/// see their own copy. Each message is independently dropped with
/// `chance_message_fails` and otherwise delivered after a delay drawn
/// uniformly from `[0, message_delay_max]`; delivery order is therefore
/// not preserved once a delay is configured.
#[derive(Debug)]
pub struct FakeNet {
    clients: DashMap<Address, Outbox>,
    chance_message_fails: f64,
    message_delay_max: Duration,
}

impl FakeNet {
    pub fn new(chance_message_fails: f64, message_delay_max: Duration) -> Result<Self, NetworkError> {
        if !(0.0..=1.0).contains(&chance_message_fails) {
            return Err(NetworkError::InvalidLossProbability(chance_message_fails));
        }

        Ok(FakeNet {
            clients: DashMap::new(),
            chance_message_fails,
            message_delay_max,
        })
    }

    /// A network that never loses or delays a message
    #[cfg(test)]
    pub fn reliable() -> Self {
        FakeNet {
            clients: DashMap::new(),
            chance_message_fails: 0.0,
            message_delay_max: Duration::ZERO,
        }
    }

    /// Registers the inbound queue of the node owning `address`
    pub fn register(&self, address: Address, outbox: Outbox) {
        self.clients.insert(address, outbox);
    }

    /// True if a node with this address is registered
    #[cfg(test)]
    pub fn recognizes(&self, address: &Address) -> bool {
        self.clients.contains_key(address)
    }

    /// Sends `message` to every registered node, the sender included
    pub fn broadcast(&self, message: &Message) -> Result<(), NetworkError> {
        let addresses: Vec<Address> = self.clients.iter().map(|entry| entry.key().clone()).collect();

        for address in &addresses {
            self.send_message(address, message)?;
        }

        Ok(())
    }

    /// Sends `message` to a single node, subject to loss and delay
    pub fn send_message(&self, address: &Address, message: &Message) -> Result<(), NetworkError> {
        let Some(outbox) = self.clients.get(address).map(|entry| entry.value().clone()) else {
            warn!("Dropping {} for unknown address {}", message.event(), address);
            return Ok(());
        };

        // Round-trip through the wire format so no state is shared between nodes.
        let copy: Message = bincode::deserialize(&bincode::serialize(message)?)?;

        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.chance_message_fails) {
            debug!("Lost {} on its way to {}", copy.event(), address);
            return Ok(());
        }

        let max_millis = self.message_delay_max.as_millis() as u64;
        let delay = Duration::from_millis(rng.gen_range(0..=max_millis));

        if delay.is_zero() {
            deliver(&outbox, copy);
            return Ok(());
        }

        let handle = Handle::try_current().map_err(|_| NetworkError::NoRuntime)?;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            deliver(&outbox, copy);
        });

        Ok(())
    }
}

fn deliver(outbox: &Outbox, message: Message) {
    if let Err(err) = outbox.send(message) {
        debug!("Receiver gone, dropping {}", err.0.event());
    }
}
