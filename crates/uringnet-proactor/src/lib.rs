//! # uringnet-proactor — completion dispatch over the ring device
//!
//! The proactor owns the ring device and the event pool, hosts one or
//! more waiter threads, maintains per-socket contexts with an orderly
//! detachment protocol, and integrates a chronology of timers and
//! deferred functors. Sockets live in `uringnet-socket`; this crate only
//! knows them through the `ProactorSocket` trait.

pub mod chronology;
pub mod context;
pub mod proactor;

pub use chronology::{Chronology, TimerHandle};
pub use context::{DetachGoal, DetachMode, SocketContext};
pub use proactor::{Proactor, ProactorConfig, Waiter};
