pub mod client;
pub mod common;
pub mod configs;
pub mod events;
pub mod node;
pub mod player;
pub mod protocol;
pub mod rest;
pub mod storage;
pub mod transport;
pub mod voice;

#[cfg(test)]
mod test_support;

pub use client::Client;
pub use common::{Error, Result};
pub use events::ClientEvent;
