//! Netbridge - native networking engine to single-threaded host bridge
//!
//! Binds a callback-driven native networking engine to a single-threaded,
//! garbage-collected host runtime. Native completions may fire on any
//! thread; host-visible state is only ever touched on the consumer thread.
//!
//! # Features
//!
//! - **Pooled wrappers**: every native socket, session, channel and message
//!   surfaces as a host object drawn from a bounded LIFO pool
//! - **Generational reverse lookup**: native objects carry an extra-data
//!   slot pointing back at their wrapper, checked by generation
//! - **Threadsafe executors**: bounded multi-producer queues drained by the
//!   consumer run loop, enqueue-or-fail backpressure
//! - **Worker tasks**: background jobs with exactly one completion each,
//!   canceled or not
//! - **Timers**: one-shot and repeating timers with idempotent stop
//! - **UDP adapter**: zero-copy buffer marshaling with a copy fallback,
//!   allocate-then-fill receives with partial-read reporting
//! - **Two platforms**: an OS event loop backend and a host-delegated one
//!
//! # Example
//!
//! ```rust
//! use netbridge::config::BridgeConfig;
//! use netbridge::context::Context;
//! use netbridge::engine::MemoryEngine;
//! use netbridge::host::Heap;
//! use netbridge::platform::{NativePlatform, Platform};
//! use std::rc::Rc;
//!
//! let config = BridgeConfig::default();
//! let platform: Rc<dyn Platform> = Rc::new(NativePlatform::new(&config).unwrap());
//! let heap = Rc::new(Heap::new());
//! let ctx = Context::create(config, heap, platform, Box::new(MemoryEngine::new()), None).unwrap();
//!
//! let message = ctx.acquire_message().unwrap();
//! ctx.message_write(message, b"ping").unwrap();
//! assert_eq!(ctx.message_read(message, 4).unwrap(), b"ping");
//! ctx.release_message(message).unwrap();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐        ┌─────────────────┐
//! │  Engine threads │        │  Worker threads │
//! └────────┬────────┘        └────────┬────────┘
//!          │ EventSink                │ completions
//!          ▼                          ▼
//! ┌──────────────────────────────────────────┐
//! │  Bridge: executors, worker pool, timers  │
//! └────────────────────┬─────────────────────┘
//!                      │ Platform::poll (consumer thread)
//!                      ▼
//! ┌──────────────────────────────────────────┐
//! │  Context: pools, dispatch, listeners     │
//! └────────────────────┬─────────────────────┘
//!                      ▼
//! ┌──────────────────────────────────────────┐
//! │  Host heap: twins, scopes, promises      │
//! └──────────────────────────────────────────┘
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod host;
pub mod io;
pub mod platform;
pub mod pool;

// Re-export commonly used types
pub use bridge::{ThreadsafeExecutor, TimerHandle, WorkerTask};
pub use config::BridgeConfig;
pub use context::{Context, ContextStatistic, ErrorHandler};
pub use engine::{Engine, EngineError, EngineEvent, EventSink, MemoryEngine};
pub use entity::{ChannelMode, EntityKind, NativeHandle, SocketListener};
pub use error::{BridgeError, Result, SubmitError};
pub use host::{Heap, HeapOptions, HostException, HostObjectId, Promise, PromiseState};
pub use platform::{DelegatedPlatform, HostDelegate, NativePlatform, Platform, PlatformStatistic};
pub use pool::{PoolStats, WrapperId, WrapperPool};
