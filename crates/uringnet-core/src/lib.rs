//! # uringnet-core — vocabulary types for the uringnet proactor
//!
//! This crate defines the types every other uringnet crate speaks:
//! the error taxonomy, transport endpoints and their wire encoding,
//! reference-counted blob buffers, the per-operation `Event` record and
//! its pool, and the `ProactorSocket` capability trait that concrete
//! sockets implement.
//!
//! Nothing here talks to the kernel. The ring ABI lives in
//! `uringnet-ring`; the completion dispatch loop lives in
//! `uringnet-proactor`.

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("uringnet drives io_uring and only builds for Linux");
    }
}

pub mod blob;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod options;
pub mod socket;

pub use error::{Error, Result};
