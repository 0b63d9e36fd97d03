use strum::{Display, EnumIter};

/// Occurrences the protocol engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum EventKind {
    /// The stack finished starting up.
    Ready,
    /// A complete frame sits in the frame buffer.
    FrameReceived,
    /// A received frame was validated and must be executed.
    Execute,
    /// The last frame was fully transmitted.
    FrameSent,
}

impl EventKind {
    /// Order in which pending events are delivered, highest priority first.
    pub const PRIORITY: [EventKind; 4] = [
        EventKind::FrameSent,
        EventKind::Execute,
        EventKind::FrameReceived,
        EventKind::Ready,
    ];
}

/// Saturating per-kind counters of posted but not yet delivered events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventQueue {
    ready: u8,
    frame_received: u8,
    execute: u8,
    frame_sent: u8,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_mut(&mut self, kind: EventKind) -> &mut u8 {
        match kind {
            EventKind::Ready => &mut self.ready,
            EventKind::FrameReceived => &mut self.frame_received,
            EventKind::Execute => &mut self.execute,
            EventKind::FrameSent => &mut self.frame_sent,
        }
    }

    pub fn pending(&self, kind: EventKind) -> u8 {
        match kind {
            EventKind::Ready => self.ready,
            EventKind::FrameReceived => self.frame_received,
            EventKind::Execute => self.execute,
            EventKind::FrameSent => self.frame_sent,
        }
    }

    /// Records one occurrence of `kind`. Returns `false` when the counter is
    /// saturated; the event is dropped in that case.
    pub fn post(&mut self, kind: EventKind) -> bool {
        let counter = self.counter_mut(kind);
        match counter.checked_add(1) {
            Some(next) => {
                *counter = next;
                true
            }
            None => false,
        }
    }

    /// Takes the highest-priority pending event.
    pub fn get(&mut self) -> Option<EventKind> {
        EventKind::PRIORITY.into_iter().find(|&kind| {
            let counter = self.counter_mut(kind);
            if *counter == 0 {
                return false;
            }
            *counter -= 1;
            true
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
