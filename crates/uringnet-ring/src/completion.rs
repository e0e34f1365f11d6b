//! Completion records.

use std::fmt;
use std::mem;

use uringnet_core::error::Error;

use crate::sys;

/// Size in bytes of one completion record.
pub const COMPLETION_SIZE: usize = 16;

/// A completion queue entry: the kernel's report of one finished
/// operation.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Completion {
    user_data: u64,
    result: i32,
    flags: u32,
}

const _: () = assert!(mem::size_of::<Completion>() == COMPLETION_SIZE);

impl Completion {
    pub fn new(user_data: u64, result: i32, flags: u32) -> Self {
        Self {
            user_data,
            result,
            flags,
        }
    }

    /// The submission's user data: the event box address, or zero for
    /// timer and cancel records.
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Raw result: nonnegative byte count or new descriptor, negative
    /// `-errno`.
    pub fn result(&self) -> i32 {
        self.result
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn has_failed(&self) -> bool {
        self.result < 0
    }

    pub fn was_cancelled(&self) -> bool {
        self.result == -libc::ECANCELED
    }

    /// The classified error of a failed completion.
    pub fn error(&self) -> Error {
        debug_assert!(self.has_failed());
        Error::from_raw_result(self.result)
    }

    /// Bytes transferred (or the accepted handle) of a successful
    /// completion.
    pub fn value(&self) -> u64 {
        debug_assert!(!self.has_failed());
        self.result as u64
    }

    /// Another completion for the same submission follows (first half of
    /// a zero-copy send).
    pub fn is_more(&self) -> bool {
        (self.flags & sys::CQE_F_MORE) != 0
    }

    /// This is the deferred notification of a zero-copy send.
    pub fn is_notification(&self) -> bool {
        (self.flags & sys::CQE_F_NOTIF) != 0
    }

    /// For a zero-copy notification: the kernel fell back to copying the
    /// pages rather than transmitting from them directly.
    pub fn zero_copy_copied(&self) -> bool {
        debug_assert!(self.is_notification());
        (self.result & sys::NOTIF_USAGE_ZC_COPIED) != 0
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("user_data", &format_args!("{:#x}", self.user_data))
            .field("result", &self.result)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        assert_eq!(mem::size_of::<Completion>(), 16);
    }

    #[test]
    fn test_cancelled_classification() {
        let entry = Completion::new(1, -libc::ECANCELED, 0);
        assert!(entry.has_failed());
        assert!(entry.was_cancelled());
        assert_eq!(entry.error(), Error::Cancelled);
    }

    #[test]
    fn test_success_value() {
        let entry = Completion::new(1, 512, 0);
        assert!(!entry.has_failed());
        assert_eq!(entry.value(), 512);
    }

    #[test]
    fn test_notification_flags() {
        let first = Completion::new(1, 64, sys::CQE_F_MORE);
        assert!(first.is_more());
        assert!(!first.is_notification());

        let notif = Completion::new(1, sys::NOTIF_USAGE_ZC_COPIED, sys::CQE_F_NOTIF);
        assert!(notif.is_notification());
        assert!(notif.zero_copy_copied());
    }
}
