#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod controls;
pub mod format;
pub mod queue;
pub mod time;

pub mod prelude {
    pub use crate::{
        buffer::{DequeuedBuffer, MemoryRef},
        controls::{ControlId, ControlInfo, ControlInfoMap, ControlList, ControlValue, ids},
        format::{MbusCode, PixelFormat, SensorFormat, Size},
        queue::{MailboxRx, MailboxTx, RecvOutcome, SendOutcome, mailbox},
        time::Timestamp,
    };
}
