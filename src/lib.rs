//! A distributed background task queue.
//!
//! An [`Engine`] owns a [`broker::Broker`] connection and a registry of
//! named [`Queue`]s. Producers call [`Queue::publish`] (or
//! [`Engine::publish`]) to enqueue work; [`Engine::run`] drives one
//! bounded-concurrency consumer per subscribed queue plus a background
//! promoter that moves delayed tasks onto the live list once their
//! `eta` arrives.
//!
//! ```ignore
//! use taskqueue::{BrokerKind, Engine, TaskDefaults};
//!
//! let engine = Engine::new(BrokerKind::Memory, TaskDefaults::default()).await?;
//! let queue = engine.queue("emails");
//! queue.subscribe(my_handler, Default::default());
//! engine.run(shutdown_token).await?;
//! ```

pub mod broker;
pub mod config;
mod consumer;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod middleware;
pub mod options;
pub mod queue;
pub mod serializer;
pub mod task;

pub use broker::{Broker, Counts, MemoryBroker, RedisBroker, RedisBrokerConfig};
pub use config::EngineConfig;
pub use engine::{BrokerKind, Engine};
pub use error::{Error, Result};
pub use hooks::{Context, EventHook, FnEventHook, FnStartHook, HookEvent, Request, StartHook};
pub use middleware::{FnHandler, Handler, Middleware};
pub use options::{PublishOptions, QueueOptions, SubscribeOptions, TaskDefaults};
pub use queue::Queue;
pub use serializer::{JsonSerializer, Serializer};
pub use task::{Task, TaskStatus};
