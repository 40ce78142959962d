//! # parley-core
//!
//! Core relay domain for Parley: token verification, durable store
//! access, the broker adapter, and room subscription management.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────────┐     ┌─────────────┐
//! │  Connection │────▶│ SubscriptionManager  │────▶│   Broker    │
//! └─────────────┘     └──────────────────────┘     └─────────────┘
//!                                │                        │
//!                                ▼                        ▼
//!                        ┌──────────────┐          (fan-out to every
//!                        │ MessageStore │           room subscriber)
//!                        └──────────────┘
//! ```
//!
//! The durability contract is persist-then-publish: a message is never
//! fanned out live without a durable record, and a durably stored
//! message that misses its live fan-out still surfaces through history
//! backfill.

pub mod amqp;
pub mod auth;
pub mod broker;
pub mod error;
pub mod mongo;
pub mod store;
pub mod subscription;

pub use amqp::{AmqpBroker, BrokerSettings};
pub use auth::{Identity, JwtVerifier, TokenVerifier};
pub use broker::{Broker, DeliveryCallback, SubscriptionHandle};
pub use error::{RelayError, Result};
pub use mongo::MongoStore;
pub use store::{ChatMessage, MessageStore, Room};
pub use subscription::{RelayLimits, SubscriptionManager};
