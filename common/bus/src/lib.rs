pub mod client;
pub mod config;
pub mod error;
pub mod kv;
pub mod message;
pub mod reader;
pub mod testing;
pub mod writer;

pub use async_nats::jetstream::consumer::AckPolicy;
pub use client::BusClient;
pub use config::BusConfig;
pub use error::BusError;
pub use kv::{KeyStore, KvKeyStore};
pub use message::{Acker, FailedMessage, Message, Record, Role};
pub use reader::{consume, BatchReader, ConsumeContext, JetStreamReader};
pub use writer::{BatchWriter, JetStreamWriter};
