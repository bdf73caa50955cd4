//! Process-to-process message passing.
//!
//! A [`Channel`] is one end of a Unix-domain socket pair carrying
//! length-prefixed bincode frames; a [`Poller`] multiplexes reads over many
//! channels. Both ends of a pair survive `fork()`: every process inherits
//! every endpoint and drops the ones its role does not own.

mod channel;
mod poller;

pub use channel::Channel;
pub use poller::Poller;
