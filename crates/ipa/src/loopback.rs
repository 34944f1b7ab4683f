//! Minimal in-process 3A that answers the pipeline's events directly.

use iris_core::prelude::*;

use crate::{IpaAction, IpaEndpoint, IpaEvent, IpaStream};

/// In-process stand-in for the 3A: every queued request is answered with
/// `ParamFilled`, and every filled statistics buffer with empty metadata.
///
/// Useful for bringing up a media graph before a real 3A exists, and for
/// driving the pipeline in tests.
///
/// # Example
/// ```rust
/// use iris_ipa::{IpaEvent, BufferId, channel, loopback::Loopback};
/// use iris_core::prelude::*;
///
/// let (pipeline, endpoint) = channel(16);
/// let mut ipa = Loopback::new(endpoint);
///
/// pipeline.send(IpaEvent::QueueRequest {
///     frame: 0,
///     param: BufferId::param(0),
///     controls: ControlList::new(),
/// });
/// ipa.service();
/// assert!(matches!(pipeline.recv_action(), RecvOutcome::Data(_)));
/// ```
pub struct Loopback {
    endpoint: IpaEndpoint,
    stream: Option<IpaStream>,
    mapped: Vec<crate::BufferId>,
}

impl Loopback {
    pub fn new(endpoint: IpaEndpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            mapped: Vec::new(),
        }
    }

    /// The stream configuration received at start, if any.
    pub fn stream(&self) -> Option<IpaStream> {
        self.stream
    }

    /// Number of buffer mappings currently shared by the pipeline.
    pub fn mapped_buffers(&self) -> usize {
        self.mapped.len()
    }

    /// Drain pending events and answer them; returns the number handled.
    pub fn service(&mut self) -> usize {
        let mut handled = 0;
        while let RecvOutcome::Data(event) = self.endpoint.recv_event() {
            handled += 1;
            match event {
                IpaEvent::Configure { stream, .. } => {
                    self.stream = Some(stream);
                }
                IpaEvent::MapBuffers(buffers) => {
                    self.mapped.extend(buffers.iter().map(|b| b.id));
                }
                IpaEvent::UnmapBuffers(ids) => {
                    self.mapped.retain(|id| !ids.contains(id));
                }
                IpaEvent::QueueRequest { frame, .. } => {
                    self.endpoint.send_action(IpaAction::ParamFilled { frame });
                }
                IpaEvent::SignalStatBuffer { frame, .. } => {
                    self.endpoint.send_action(IpaAction::Metadata {
                        frame,
                        controls: ControlList::new(),
                    });
                }
            }
        }
        handled
    }
}
