//! Frame-timed action scheduler.
//!
//! Actions target a frame number. An action type with a zero frame
//! offset runs against that frame's own start of exposure: it is held
//! until the SOE is observed, and its deadline is the SOE plus the
//! type's time offset. A type with a negative frame offset runs for a
//! frame that is already queued, so its deadline is fixed when it is
//! scheduled: the schedule time plus the time offset. The timeline
//! itself never runs anything: the handler pops due actions after every
//! event and whenever its timer fires, and [`Timeline::next_deadline`]
//! tells the embedder when that timer should fire next.

use std::collections::{BTreeMap, VecDeque};

use smallvec::SmallVec;
use thiserror::Error;

use iris_core::prelude::*;

/// SOE observations retained for actions scheduled after their frame's
/// exposure; must cover the in-flight window, which the pools bound to
/// the buffer count plus one.
const HISTORY_DEPTH: usize = 10;

/// Scheduling classes, each with its own delay pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Sensor control write.
    SetSensor,
    /// Synthetic start-of-exposure marker; its time offset is the signed
    /// distance from a buffer's DMA-end time back to the exposure start.
    Soe,
    /// Handing a frame's buffer triple to the kernel.
    QueueBuffers,
}

/// A deferred operation against a target frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineAction {
    SetSensor { controls: ControlList },
    QueueBuffers,
    Soe,
}

impl TimelineAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            TimelineAction::SetSensor { .. } => ActionKind::SetSensor,
            TimelineAction::QueueBuffers => ActionKind::QueueBuffers,
            TimelineAction::Soe => ActionKind::Soe,
        }
    }
}

/// A scheduled action ready to be handed back to the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub frame: u32,
    pub action: TimelineAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimelineError {
    /// The SOE entry is the frame reference point itself; giving it a
    /// frame offset would make every deadline self-referential.
    #[error("start-of-exposure delay must keep a zero frame offset")]
    SoeOffset,
}

#[derive(Debug, Clone, Copy)]
struct Delay {
    frame_offset: i32,
    time_offset_ns: i64,
}

/// An SOE-referenced action whose frame has not exposed yet.
#[derive(Debug)]
struct Waiting {
    frame: u32,
    order: u64,
    action: TimelineAction,
}

const MILLISECOND: i64 = 1_000_000;

/// Time/frame-indexed action queue.
pub struct Timeline {
    set_sensor: Delay,
    soe: Delay,
    queue_buffers: Delay,
    /// Deadline-resolved actions; the counter breaks ties so
    /// same-deadline actions fire in schedule order.
    pending: BTreeMap<(Timestamp, u64), PendingAction>,
    /// SOE-referenced actions awaiting their frame's exposure.
    waiting: Vec<Waiting>,
    scheduled: u64,
    /// Recent `(sequence, soe)` observations, oldest first.
    history: VecDeque<(u32, Timestamp)>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            set_sensor: Delay {
                frame_offset: -1,
                time_offset_ns: 5 * MILLISECOND,
            },
            soe: Delay {
                frame_offset: 0,
                time_offset_ns: -MILLISECOND,
            },
            queue_buffers: Delay {
                frame_offset: -1,
                time_offset_ns: 10 * MILLISECOND,
            },
            pending: BTreeMap::new(),
            waiting: Vec::new(),
            scheduled: 0,
            history: VecDeque::new(),
        }
    }

    fn delay(&self, kind: ActionKind) -> Delay {
        match kind {
            ActionKind::SetSensor => self.set_sensor,
            ActionKind::Soe => self.soe,
            ActionKind::QueueBuffers => self.queue_buffers,
        }
    }

    /// Reconfigure the delay pair for one action type.
    pub fn set_delay(
        &mut self,
        kind: ActionKind,
        frame_offset: i32,
        time_offset_ns: i64,
    ) -> Result<(), TimelineError> {
        if kind == ActionKind::Soe && frame_offset != 0 {
            return Err(TimelineError::SoeOffset);
        }
        let delay = Delay {
            frame_offset,
            time_offset_ns,
        };
        match kind {
            ActionKind::SetSensor => self.set_sensor = delay,
            ActionKind::Soe => self.soe = delay,
            ActionKind::QueueBuffers => self.queue_buffers = delay,
        }
        Ok(())
    }

    pub fn frame_offset(&self, kind: ActionKind) -> i32 {
        self.delay(kind).frame_offset
    }

    pub fn time_offset_ns(&self, kind: ActionKind) -> i64 {
        self.delay(kind).time_offset_ns
    }

    /// Insert `action` for `frame`.
    ///
    /// A zero-frame-offset type resolves its deadline against the
    /// frame's recorded SOE, or waits for [`notify_start_of_exposure`]
    /// if the exposure has not been observed yet. Any other type is
    /// anchored on `now`. A deadline already in the past is kept; the
    /// next [`take_due`](Self::take_due) pops it immediately.
    ///
    /// [`notify_start_of_exposure`]: Self::notify_start_of_exposure
    pub fn schedule(&mut self, frame: u32, action: TimelineAction, now: Timestamp) {
        let delay = self.delay(action.kind());
        self.scheduled += 1;
        let order = self.scheduled;

        if delay.frame_offset == 0 {
            // Runs against the frame's own exposure.
            if let Some(soe) = self.start_of_exposure(frame) {
                let deadline = soe.offset_by(delay.time_offset_ns);
                self.pending
                    .insert((deadline, order), PendingAction { frame, action });
            } else {
                self.waiting.push(Waiting {
                    frame,
                    order,
                    action,
                });
            }
        } else {
            // Runs for an already-queued frame; the reference event is
            // the schedule itself.
            let deadline = now.offset_by(delay.time_offset_ns);
            self.pending
                .insert((deadline, order), PendingAction { frame, action });
        }
    }

    /// Record a frame's SOE estimate from its DMA-end timestamp.
    ///
    /// The kernel stamps the end of the transfer; the SOE time offset
    /// (typically negative, supplied by the 3A for the sensor in use)
    /// walks that back to the start of exposure.
    pub fn record_frame(&mut self, sequence: u32, dma_end: Timestamp) {
        debug_assert_eq!(self.soe.frame_offset, 0);
        let soe = dma_end.offset_by(self.soe.time_offset_ns);
        self.notify_start_of_exposure(sequence, soe);
    }

    /// Record the SOE for `sequence` and release any actions that were
    /// waiting for that exposure.
    pub fn notify_start_of_exposure(&mut self, sequence: u32, soe: Timestamp) {
        self.history.push_back((sequence, soe));
        while self.history.len() > HISTORY_DEPTH {
            self.history.pop_front();
        }

        let (ready, rest): (Vec<Waiting>, Vec<Waiting>) = self
            .waiting
            .drain(..)
            .partition(|waiting| waiting.frame == sequence);
        self.waiting = rest;
        for waiting in ready {
            let delay = self.delay(waiting.action.kind());
            self.pending.insert(
                (soe.offset_by(delay.time_offset_ns), waiting.order),
                PendingAction {
                    frame: waiting.frame,
                    action: waiting.action,
                },
            );
        }
    }

    /// The recorded SOE for `sequence`, if still in the retention
    /// window.
    pub fn start_of_exposure(&self, sequence: u32) -> Option<Timestamp> {
        self.history
            .iter()
            .rev()
            .find(|(seq, _)| *seq == sequence)
            .map(|(_, soe)| *soe)
    }

    /// Earliest resolved deadline, for arming the embedder's timer.
    ///
    /// Actions still waiting for their SOE have no deadline yet and are
    /// not reported here; the exposure notification that releases them
    /// is itself a dispatch point.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop every action whose deadline is at or before `now`, in deadline
    /// order.
    pub fn take_due(&mut self, now: Timestamp) -> SmallVec<[PendingAction; 4]> {
        let mut due = SmallVec::new();
        while let Some(key) = self.pending.keys().next().copied() {
            if key.0 > now {
                break;
            }
            if let Some(action) = self.pending.remove(&key) {
                due.push(action);
            }
        }
        due
    }

    /// Actions not yet handed back, resolved or waiting.
    pub fn pending(&self) -> usize {
        self.pending.len() + self.waiting.len()
    }

    /// Discard all pending actions and recorded SOEs.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.waiting.clear();
        self.history.clear();
    }
}
