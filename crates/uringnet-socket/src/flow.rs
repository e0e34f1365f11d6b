//! The two-axis flow-control state.
//!
//! Each direction carries an enabled bit and a locked bit. Shutdown
//! locks a direction off permanently; explicit apply/relax toggles only
//! the unlocked bits. A transition in either direction is reported so
//! the socket can announce it to the session exactly once per crossing.

/// Which direction of traffic a flow-control change names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlType {
    Send,
    Receive,
    Both,
}

impl FlowControlType {
    pub fn includes_send(&self) -> bool {
        matches!(self, FlowControlType::Send | FlowControlType::Both)
    }

    pub fn includes_receive(&self) -> bool {
        matches!(self, FlowControlType::Receive | FlowControlType::Both)
    }
}

/// The transitions one apply/relax call actually made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowControlContext {
    pub send_changed: bool,
    pub receive_changed: bool,
}

impl FlowControlContext {
    pub fn any(&self) -> bool {
        self.send_changed || self.receive_changed
    }
}

/// Per-socket flow-control bits. Opening a socket fully enables both
/// directions.
#[derive(Debug)]
pub struct FlowControlState {
    send_enabled: bool,
    receive_enabled: bool,
    send_locked: bool,
    receive_locked: bool,
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self {
            send_enabled: true,
            receive_enabled: true,
            send_locked: false,
            receive_locked: false,
        }
    }
}

impl FlowControlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the socket currently wants writability work.
    pub fn wants_send(&self) -> bool {
        self.send_enabled
    }

    /// Whether the socket currently wants readability work.
    pub fn wants_receive(&self) -> bool {
        self.receive_enabled
    }

    /// Disable the named directions. `lock` pins them off (used by
    /// shutdown) so later relax calls cannot re-enable them.
    pub fn apply(&mut self, direction: FlowControlType, lock: bool) -> FlowControlContext {
        let mut context = FlowControlContext::default();

        if direction.includes_send() {
            if self.send_enabled {
                self.send_enabled = false;
                context.send_changed = true;
            }
            if lock {
                self.send_locked = true;
            }
        }

        if direction.includes_receive() {
            if self.receive_enabled {
                self.receive_enabled = false;
                context.receive_changed = true;
            }
            if lock {
                self.receive_locked = true;
            }
        }

        context
    }

    /// Re-enable the named directions where they are not locked.
    /// `unlock` clears the lock first.
    pub fn relax(&mut self, direction: FlowControlType, unlock: bool) -> FlowControlContext {
        let mut context = FlowControlContext::default();

        if direction.includes_send() {
            if unlock {
                self.send_locked = false;
            }
            if !self.send_locked && !self.send_enabled {
                self.send_enabled = true;
                context.send_changed = true;
            }
        }

        if direction.includes_receive() {
            if unlock {
                self.receive_locked = false;
            }
            if !self.receive_locked && !self.receive_enabled {
                self.receive_enabled = true;
                context.receive_changed = true;
            }
        }

        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_state_enables_both() {
        let state = FlowControlState::new();
        assert!(state.wants_send());
        assert!(state.wants_receive());
    }

    #[test]
    fn test_apply_reports_transition_once() {
        let mut state = FlowControlState::new();
        let first = state.apply(FlowControlType::Receive, false);
        assert!(first.receive_changed);
        assert!(!first.send_changed);

        let second = state.apply(FlowControlType::Receive, false);
        assert!(!second.any());
        assert!(!state.wants_receive());
        assert!(state.wants_send());
    }

    #[test]
    fn test_locked_direction_refuses_relax() {
        let mut state = FlowControlState::new();
        state.apply(FlowControlType::Send, true);

        let relaxed = state.relax(FlowControlType::Send, false);
        assert!(!relaxed.any());
        assert!(!state.wants_send());

        let unlocked = state.relax(FlowControlType::Send, true);
        assert!(unlocked.send_changed);
        assert!(state.wants_send());
    }

    #[test]
    fn test_both_axis() {
        let mut state = FlowControlState::new();
        let applied = state.apply(FlowControlType::Both, false);
        assert!(applied.send_changed && applied.receive_changed);
        let relaxed = state.relax(FlowControlType::Both, false);
        assert!(relaxed.send_changed && relaxed.receive_changed);
    }
}
