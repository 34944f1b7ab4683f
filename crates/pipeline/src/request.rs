//! User-facing capture request.

use smallvec::SmallVec;

use iris_core::prelude::*;

/// Identifier of a configured output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

/// One capture request: user controls in, a filled buffer and per-frame
/// metadata out.
///
/// The request does not know which frame serves it; that binding lives in
/// the pipeline's frame registry for the request's time in flight.
///
/// # Example
/// ```rust
/// use iris_pipeline::request::{Request, StreamId};
/// use iris_core::prelude::*;
///
/// let mut request = Request::new(1);
/// request.controls_mut().set(ids::ANALOGUE_GAIN, ControlValue::Int(2));
/// request.add_buffer(StreamId(0), 3);
/// assert!(request.has_pending_buffers());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    cookie: u64,
    controls: ControlList,
    buffers: SmallVec<[RequestBuffer; 1]>,
    metadata: ControlList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestBuffer {
    stream: StreamId,
    index: u32,
    done: bool,
}

impl Request {
    /// Create a request; `cookie` is an opaque caller identifier.
    pub fn new(cookie: u64) -> Self {
        Self {
            cookie,
            ..Default::default()
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn controls(&self) -> &ControlList {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlList {
        &mut self.controls
    }

    /// Bind the buffer at `index` of `stream` to this request.
    pub fn add_buffer(&mut self, stream: StreamId, index: u32) {
        self.buffers.push(RequestBuffer {
            stream,
            index,
            done: false,
        });
    }

    /// The buffer bound to `stream`, if any.
    pub fn buffer(&self, stream: StreamId) -> Option<u32> {
        self.buffers
            .iter()
            .find(|b| b.stream == stream)
            .map(|b| b.index)
    }

    /// True while any bound buffer has not completed.
    pub fn has_pending_buffers(&self) -> bool {
        self.buffers.iter().any(|b| !b.done)
    }

    /// Per-frame result metadata, filled in as the request completes.
    pub fn metadata(&self) -> &ControlList {
        &self.metadata
    }

    /// Mark the buffer at `index` complete; returns false if no bound
    /// buffer matches.
    pub(crate) fn complete_buffer(&mut self, index: u32) -> bool {
        match self.buffers.iter_mut().find(|b| b.index == index) {
            Some(buffer) => {
                buffer.done = true;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_metadata(&mut self, metadata: ControlList) {
        self.metadata = metadata;
    }
}
