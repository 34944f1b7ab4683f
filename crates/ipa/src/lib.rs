#![doc = include_str!("../README.md")]

use std::fmt;

use iris_core::prelude::*;

pub mod loopback;

/// Base of the id range for parameter buffers shared with the 3A.
pub const PARAM_BASE: u32 = 0x100;
/// Base of the id range for statistics buffers shared with the 3A.
pub const STAT_BASE: u32 = 0x200;

/// Stable identifier for a buffer mapped into the 3A process.
///
/// The high byte selects the stream (parameters or statistics), the low
/// bits carry the pool index. The id survives re-maps, so the 3A can key
/// its mappings on it across a reconfiguration.
///
/// # Example
/// ```rust
/// use iris_ipa::BufferId;
///
/// let id = BufferId::param(3);
/// assert!(id.is_param());
/// assert_eq!(id.index(), 3);
/// assert_eq!(id.to_u32(), 0x103);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferId(u32);

impl BufferId {
    /// Id for the parameter buffer at `index` in its pool.
    pub const fn param(index: u32) -> Self {
        Self(PARAM_BASE | index)
    }

    /// Id for the statistics buffer at `index` in its pool.
    pub const fn stat(index: u32) -> Self {
        Self(STAT_BASE | index)
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Pool index encoded in the low bits.
    pub const fn index(self) -> u32 {
        self.0 & 0xff
    }

    pub const fn is_param(self) -> bool {
        self.0 & PARAM_BASE != 0
    }

    pub const fn is_stat(self) -> bool {
        self.0 & STAT_BASE != 0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03x}", self.0)
    }
}

/// One buffer mapping shared with the 3A process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpaBuffer {
    pub id: BufferId,
    pub memory: MemoryRef,
}

/// Output stream description sent with [`IpaEvent::Configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpaStream {
    pub pixel_format: PixelFormat,
    pub size: Size,
}

/// Events the pipeline sends to the 3A.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IpaEvent {
    /// One-shot at stream start: the negotiated output stream and the
    /// sensor's supported controls.
    Configure {
        stream: IpaStream,
        sensor_controls: ControlInfoMap,
    },
    /// Share parameter and statistics buffer mappings.
    MapBuffers(Vec<IpaBuffer>),
    /// Withdraw previously shared mappings.
    UnmapBuffers(Vec<BufferId>),
    /// A user request was queued for `frame`; the 3A should fill the
    /// parameter buffer and emit sensor controls for it.
    QueueRequest {
        frame: u32,
        param: BufferId,
        controls: ControlList,
    },
    /// The kernel filled the statistics buffer for `frame`.
    SignalStatBuffer { frame: u32, stat: BufferId },
}

/// Wire operation codes for 3A actions.
///
/// The enum below is what the pipeline consumes; these codes exist so a
/// transport can decode a frame-tagged `(op, payload)` pair coming off the
/// IPC socket without knowing every action the 3A may grow.
pub mod op {
    pub const V4L2_SET: u32 = 1;
    pub const PARAM_FILLED: u32 = 2;
    pub const METADATA: u32 = 3;
}

/// Frame-tagged actions the 3A sends back to the pipeline.
///
/// Per-frame ordering between the variants is not guaranteed; the pipeline
/// treats each as an independent flag on the frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IpaAction {
    /// Write `controls` to the sensor at the frame's sensor-update slot.
    SetSensorControls { frame: u32, controls: ControlList },
    /// The parameter buffer for `frame` is ready for the kernel.
    ParamFilled { frame: u32 },
    /// Per-frame result metadata.
    Metadata { frame: u32, controls: ControlList },
    /// An operation this pipeline does not understand; logged and dropped
    /// by the receiver.
    Unknown { frame: u32, op: u32 },
}

impl IpaAction {
    /// Decode a raw `(op, payload)` pair from the transport.
    pub fn decode(frame: u32, op_code: u32, controls: Option<ControlList>) -> IpaAction {
        match op_code {
            op::V4L2_SET => IpaAction::SetSensorControls {
                frame,
                controls: controls.unwrap_or_default(),
            },
            op::PARAM_FILLED => IpaAction::ParamFilled { frame },
            op::METADATA => IpaAction::Metadata {
                frame,
                controls: controls.unwrap_or_default(),
            },
            other => IpaAction::Unknown { frame, op: other },
        }
    }

    /// The frame this action applies to.
    pub fn frame(&self) -> u32 {
        match self {
            IpaAction::SetSensorControls { frame, .. }
            | IpaAction::ParamFilled { frame }
            | IpaAction::Metadata { frame, .. }
            | IpaAction::Unknown { frame, .. } => *frame,
        }
    }
}

/// Pipeline half of the 3A connection.
///
/// Owned by the pipeline handler; events go out, actions are drained on
/// the event thread. Neither direction blocks.
pub struct IpaChannel {
    events: MailboxTx<IpaEvent>,
    actions: MailboxRx<IpaAction>,
}

impl IpaChannel {
    /// Send an event to the 3A.
    pub fn send(&self, event: IpaEvent) -> SendOutcome {
        self.events.send(event)
    }

    /// Pop the next pending action, if any.
    pub fn recv_action(&self) -> RecvOutcome<IpaAction> {
        self.actions.recv()
    }

    /// Shut the connection down; both halves observe `Closed`.
    pub fn close(&self) {
        self.events.close();
        self.actions.close();
    }
}

/// 3A half of the connection, held by the transport (or a test double).
pub struct IpaEndpoint {
    events: MailboxRx<IpaEvent>,
    actions: MailboxTx<IpaAction>,
}

impl IpaEndpoint {
    /// Pop the next event from the pipeline, if any.
    pub fn recv_event(&self) -> RecvOutcome<IpaEvent> {
        self.events.recv()
    }

    /// Push an action back to the pipeline.
    pub fn send_action(&self, action: IpaAction) -> SendOutcome {
        self.actions.send(action)
    }
}

/// Create a connected channel/endpoint pair with `depth` slots per
/// direction.
///
/// # Example
/// ```rust
/// use iris_ipa::{IpaAction, channel};
/// use iris_core::prelude::RecvOutcome;
///
/// let (pipeline, ipa) = channel(16);
/// ipa.send_action(IpaAction::ParamFilled { frame: 0 });
/// assert!(matches!(pipeline.recv_action(), RecvOutcome::Data(IpaAction::ParamFilled { frame: 0 })));
/// ```
pub fn channel(depth: usize) -> (IpaChannel, IpaEndpoint) {
    let (event_tx, event_rx) = mailbox(depth);
    let (action_tx, action_rx) = mailbox(depth);
    (
        IpaChannel {
            events: event_tx,
            actions: action_rx,
        },
        IpaEndpoint {
            events: event_rx,
            actions: action_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_id_encoding() {
        assert_eq!(BufferId::param(0).to_u32(), 0x100);
        assert_eq!(BufferId::stat(4).to_u32(), 0x204);
        assert!(BufferId::stat(4).is_stat());
        assert!(!BufferId::stat(4).is_param());
        assert_eq!(BufferId::stat(4).index(), 4);
    }

    #[test]
    fn decode_maps_unknown_ops() {
        let action = IpaAction::decode(9, 0xdead, None);
        assert_eq!(action, IpaAction::Unknown { frame: 9, op: 0xdead });
        assert_eq!(action.frame(), 9);

        let action = IpaAction::decode(2, op::PARAM_FILLED, None);
        assert_eq!(action, IpaAction::ParamFilled { frame: 2 });
    }

    #[test]
    fn channel_carries_both_directions() {
        let (pipeline, ipa) = channel(4);
        pipeline.send(IpaEvent::QueueRequest {
            frame: 1,
            param: BufferId::param(1),
            controls: ControlList::new(),
        });
        match ipa.recv_event() {
            RecvOutcome::Data(IpaEvent::QueueRequest { frame, param, .. }) => {
                assert_eq!(frame, 1);
                assert_eq!(param, BufferId::param(1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
