//! # uringnet-ring — the io_uring proactor engine
//!
//! This crate owns everything that touches the ring ABI:
//!
//! - `sys`: raw structures, flags, opcodes, and the three system calls
//!   (`setup`, `enter`, `register`).
//! - `mmap`: the mapped ring regions, unmapped on drop.
//! - `config` / `probe`: the kernel's configuration answer and opcode
//!   capability table.
//! - `submission` / `completion`: the 64-byte request and 16-byte result
//!   records, with one `prepare_*` routine per operation.
//! - `squeue` / `cqueue`: the kernel-shared producer/consumer rings.
//! - `device`: `RingDevice`, tying it all together with `submit`,
//!   `wait`, and `flush`.
//!
//! Nothing here dispatches completions to sockets — that is the
//! `uringnet-proactor` crate's job.

pub mod completion;
pub mod config;
pub mod cqueue;
pub mod device;
pub mod mmap;
pub mod probe;
pub mod squeue;
pub mod submission;
pub mod sys;

pub use completion::Completion;
pub use config::{RingCapabilities, RingConfig};
pub use device::{RingDevice, WaitState};
pub use probe::RingProbe;
pub use submission::{SubmitMode, Submission};
