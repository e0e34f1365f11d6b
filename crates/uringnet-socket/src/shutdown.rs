//! The per-direction shutdown state machine.
//!
//! Each direction moves Open → Shutdown exactly once; the send
//! direction passes through ShuttingDown while a graceful shutdown
//! waits for queued writes to drain. `try_shutdown_*` reports, through
//! a `ShutdownContext`, which announcements the caller owes the
//! session: initiation happens once, each direction closes once, and
//! completion fires when the second direction closes.

use uringnet_core::options::ShutdownOrigin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Open,
    ShuttingDown,
    Shutdown,
}

/// What one shutdown transition obliges the socket to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownContext {
    /// This call began the socket's shutdown; announce initiation.
    pub initiated: bool,
    /// The send direction closed; fail queued writes, half-close.
    pub send: bool,
    /// The receive direction closed; fail pending readers with Eof.
    pub receive: bool,
    /// Both directions are now closed; begin detachment.
    pub completed: bool,
    /// Who initiated the transition.
    pub origin: Option<ShutdownOrigin>,
}

#[derive(Debug)]
pub struct ShutdownState {
    send: Direction,
    receive: Direction,
    initiated: bool,
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self {
            send: Direction::Open,
            receive: Direction::Open,
            initiated: false,
        }
    }
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_send(&self) -> bool {
        self.send == Direction::Open
    }

    pub fn can_receive(&self) -> bool {
        self.receive == Direction::Open
    }

    pub fn completed(&self) -> bool {
        self.send == Direction::Shutdown && self.receive == Direction::Shutdown
    }

    /// Mark the send direction as draining: a sentinel sits in the send
    /// queue and the half-close happens when it surfaces.
    pub fn note_send_draining(&mut self) -> bool {
        if self.send != Direction::Open {
            return false;
        }
        self.send = Direction::ShuttingDown;
        true
    }

    /// Close the send direction. Without `keep_half_open` the receive
    /// direction closes along with it.
    pub fn try_shutdown_send(
        &mut self,
        keep_half_open: bool,
        origin: ShutdownOrigin,
    ) -> Option<ShutdownContext> {
        if self.send == Direction::Shutdown {
            return None;
        }

        let mut context = ShutdownContext {
            origin: Some(origin),
            ..Default::default()
        };

        self.send = Direction::Shutdown;
        context.send = true;

        if !self.initiated {
            self.initiated = true;
            context.initiated = true;
        }

        if !keep_half_open && self.receive == Direction::Open {
            self.receive = Direction::Shutdown;
            context.receive = true;
        }

        context.completed = self.completed();
        Some(context)
    }

    /// Close the receive direction. Without `keep_half_open` the send
    /// direction closes along with it.
    pub fn try_shutdown_receive(
        &mut self,
        keep_half_open: bool,
        origin: ShutdownOrigin,
    ) -> Option<ShutdownContext> {
        if self.receive == Direction::Shutdown {
            return None;
        }

        let mut context = ShutdownContext {
            origin: Some(origin),
            ..Default::default()
        };

        self.receive = Direction::Shutdown;
        context.receive = true;

        if !self.initiated {
            self.initiated = true;
            context.initiated = true;
        }

        if !keep_half_open && self.send != Direction::Shutdown {
            self.send = Direction::Shutdown;
            context.send = true;
        }

        context.completed = self.completed();
        Some(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_close_in_one_call() {
        let mut state = ShutdownState::new();
        let context = state
            .try_shutdown_send(false, ShutdownOrigin::Source)
            .unwrap();
        assert!(context.initiated);
        assert!(context.send);
        assert!(context.receive);
        assert!(context.completed);
        assert!(state.completed());
    }

    #[test]
    fn test_half_open_closes_one_direction() {
        let mut state = ShutdownState::new();
        let first = state.try_shutdown_send(true, ShutdownOrigin::Source).unwrap();
        assert!(first.initiated && first.send && !first.receive && !first.completed);
        assert!(state.can_receive());

        let second = state
            .try_shutdown_receive(true, ShutdownOrigin::Source)
            .unwrap();
        assert!(!second.initiated && second.receive && second.completed);
        assert!(state.completed());
    }

    #[test]
    fn test_double_shutdown_is_noop() {
        let mut state = ShutdownState::new();
        state.try_shutdown_send(false, ShutdownOrigin::Source).unwrap();
        assert!(state.try_shutdown_send(false, ShutdownOrigin::Source).is_none());
        assert!(state
            .try_shutdown_receive(false, ShutdownOrigin::Source)
            .is_none());
    }

    #[test]
    fn test_draining_still_allows_final_shutdown() {
        let mut state = ShutdownState::new();
        assert!(state.note_send_draining());
        assert!(!state.note_send_draining());
        assert!(!state.can_send());

        let context = state.try_shutdown_send(true, ShutdownOrigin::Source).unwrap();
        assert!(context.send);
    }
}
