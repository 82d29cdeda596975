//! Backpressure control for the buffered source
//!
//! The source never drops records. When the buffer grows past its capacity the
//! client is paused, so the broker read loop is throttled instead; it is
//! resumed as soon as downstream has drained the buffer.

use tracing::debug;

/// Flow-control action the stage must apply to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Nothing to do
    None,
    /// Pause every assigned partition
    Pause,
    /// Resume every assigned partition
    Resume,
}

/// Tracks the paused flag against the buffer capacity
#[derive(Debug, Clone)]
pub struct BackpressureController {
    capacity: usize,
    paused: bool,
    pause_count: u64,
    resume_count: u64,
}

impl BackpressureController {
    /// Create a controller for a buffer of `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            paused: false,
            pause_count: 0,
            resume_count: 0,
        }
    }

    /// Configured buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the client is currently told to stop delivering
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Number of times the client was paused
    pub fn pause_count(&self) -> u64 {
        self.pause_count
    }

    /// Number of times the client was resumed
    pub fn resume_count(&self) -> u64 {
        self.resume_count
    }

    /// Called after a record was appended to the buffer
    pub fn on_enqueue(&mut self, buffered: usize) -> FlowAction {
        if !self.paused && buffered > self.capacity {
            self.paused = true;
            self.pause_count += 1;
            debug!(buffered, capacity = self.capacity, "Polling paused, buffer is full");
            FlowAction::Pause
        } else {
            FlowAction::None
        }
    }

    /// Called after a record was taken from the buffer
    pub fn on_dequeue(&mut self, buffered: usize) -> FlowAction {
        if self.paused && buffered == 0 {
            self.paused = false;
            self.resume_count += 1;
            debug!("Polling resumed, buffer is empty");
            FlowAction::Resume
        } else {
            FlowAction::None
        }
    }

    /// Called after the client was handed a fresh assignment
    ///
    /// A new assignment starts unpaused in the client, so a paused controller
    /// has to pause it again.
    pub fn on_reassign(&mut self) -> FlowAction {
        if self.paused {
            self.pause_count += 1;
            FlowAction::Pause
        } else {
            FlowAction::None
        }
    }

    /// Undo `action` after the client rejected it
    ///
    /// The flag then matches the client again, and the next enqueue or
    /// dequeue asks for the same transition.
    pub fn rollback(&mut self, action: FlowAction) {
        match action {
            FlowAction::None => {}
            FlowAction::Pause => {
                self.paused = false;
                self.pause_count = self.pause_count.saturating_sub(1);
            }
            FlowAction::Resume => {
                self.paused = true;
                self.resume_count = self.resume_count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_only_when_strictly_over_capacity() {
        let mut controller = BackpressureController::new(2);
        assert_eq!(controller.on_enqueue(1), FlowAction::None);
        assert_eq!(controller.on_enqueue(2), FlowAction::None);
        assert_eq!(controller.on_enqueue(3), FlowAction::Pause);
        assert!(controller.is_paused());
        // already paused
        assert_eq!(controller.on_enqueue(4), FlowAction::None);
        assert_eq!(controller.pause_count(), 1);
    }

    #[test]
    fn test_resume_only_when_empty_while_paused() {
        let mut controller = BackpressureController::new(1);
        assert_eq!(controller.on_dequeue(0), FlowAction::None);

        assert_eq!(controller.on_enqueue(2), FlowAction::Pause);
        assert_eq!(controller.on_dequeue(1), FlowAction::None);
        assert_eq!(controller.on_dequeue(0), FlowAction::Resume);
        assert!(!controller.is_paused());
        assert_eq!(controller.resume_count(), 1);
    }

    #[test]
    fn test_rejected_pause_is_asked_again() {
        let mut controller = BackpressureController::new(1);
        assert_eq!(controller.on_enqueue(2), FlowAction::Pause);
        controller.rollback(FlowAction::Pause);
        assert!(!controller.is_paused());
        assert_eq!(controller.pause_count(), 0);

        assert_eq!(controller.on_enqueue(3), FlowAction::Pause);
        assert!(controller.is_paused());
        assert_eq!(controller.pause_count(), 1);
    }

    #[test]
    fn test_rejected_resume_is_asked_again() {
        let mut controller = BackpressureController::new(1);
        controller.on_enqueue(2);
        assert_eq!(controller.on_dequeue(0), FlowAction::Resume);
        controller.rollback(FlowAction::Resume);
        assert!(controller.is_paused());
        assert_eq!(controller.on_dequeue(0), FlowAction::Resume);
        assert_eq!(controller.resume_count(), 1);
    }

    #[test]
    fn test_reassign_pauses_only_when_paused() {
        let mut controller = BackpressureController::new(1);
        assert_eq!(controller.on_reassign(), FlowAction::None);
        controller.on_enqueue(2);
        assert_eq!(controller.on_reassign(), FlowAction::Pause);
        assert_eq!(controller.pause_count(), 2);
    }
}
