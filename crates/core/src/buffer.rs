use crate::time::Timestamp;

/// Opaque token for an exported kernel buffer mapping.
///
/// The kernel layer hands one of these back per exported buffer (a dmabuf
/// fd or an mmap cookie, depending on the node); the pipeline never looks
/// inside it, it only forwards it to the IPA so the 3A process can map the
/// same memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryRef(pub u64);

/// A buffer handed back by a video node after the hardware is done with it.
///
/// `index` identifies the buffer within that node's buffer set, `sequence`
/// is the kernel's frame sequence counter and `timestamp` is the DMA-end
/// time on the monotonic clock.
///
/// # Example
/// ```rust
/// use iris_core::prelude::{DequeuedBuffer, Timestamp};
///
/// let done = DequeuedBuffer::new(0, 7, Timestamp::from_nanos(1_000_000_000));
/// assert_eq!(done.sequence, 7);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DequeuedBuffer {
    pub index: u32,
    pub sequence: u32,
    pub timestamp: Timestamp,
}

impl DequeuedBuffer {
    pub fn new(index: u32, sequence: u32, timestamp: Timestamp) -> Self {
        Self {
            index,
            sequence,
            timestamp,
        }
    }
}
