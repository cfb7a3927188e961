// Network module
//
// An in-process stand-in for a peer-to-peer network: message types and a
// lossy, delaying broadcast medium.

pub mod fake_net;
pub mod message;

pub use fake_net::{FakeNet, NetworkError};
pub use message::{Inbox, Message, Outbox};
