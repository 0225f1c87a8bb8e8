//! Abstract message-bus consumer contract.
//!
//! The pipeline (`consumer.rs`) is written entirely against [`Consumer`] and
//! [`BusMessage`] — no concrete wire-protocol client ships here, only this
//! trait pair plus an in-memory test double (`bus::memory`). Generalized
//! from the `Shared`-subscription consumer loop in
//! `examples/original_source/common/pulsar.py`'s `PulsarService`: one
//! `receive` per iteration, ack/nack called exactly once per message,
//! redelivery count carried on the message itself.

pub mod memory;

use async_trait::async_trait;

/// One message pulled off the bus. Ack/nack must be called exactly once
/// before the handle is released — the pipeline enforces this by consuming
/// `self`.
#[async_trait]
pub trait BusMessage: Send + Sync {
    /// Opaque identifier, stable for the lifetime of this delivery attempt.
    fn id(&self) -> String;

    /// Raw payload bytes, as published.
    fn payload(&self) -> &[u8];

    /// How many times this message has been redelivered (0 on first
    /// delivery).
    fn redelivery_count(&self) -> u32;

    /// Acknowledge successful processing.
    async fn ack(self: Box<Self>);

    /// Negative-acknowledge; the bus schedules redelivery after its
    /// configured delay, or routes to the dead-letter topic once the
    /// redelivery cap is reached.
    async fn nack(self: Box<Self>);
}

/// A subscribed consumer on one topic/subscription. One call to `receive`
/// yields one message; the caller is responsible for calling `ack`/`nack`
/// on it before calling `receive` again (at-most-one-in-flight-per-worker,
/// per §4.6).
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Block until the next message is available, or `None` if the
    /// consumer has been closed.
    async fn receive(&self) -> Option<Box<dyn BusMessage>>;

    /// Release any resources held by this consumer (closes the underlying
    /// client connection in a real implementation).
    async fn close(&self);
}

