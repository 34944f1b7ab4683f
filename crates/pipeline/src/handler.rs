//! The pipeline handler: request lifecycle and stream control.
//!
//! One `IspPipeline` drives one camera. All entry points run on the
//! embedder's event thread; kernel completions, 3A actions and timer
//! expirations arrive as plain method calls and nothing here blocks.

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use iris_core::prelude::*;
use iris_ipa::{BufferId, IpaAction, IpaBuffer, IpaChannel, IpaEvent, IpaStream};

use crate::config::{
    CameraConfiguration, ConfigStatus, MemoryKind, StreamConfig, StreamRole,
};
use crate::device::{
    Clock, DeviceEnumerator, DeviceError, DeviceMatch, IspDevices, MediaGraph, NodeKind, Sensor,
    Subdevice, VideoFormat, VideoNode, entities,
};
use crate::frames::{FrameRegistry, RegistryError};
use crate::request::{Request, StreamId};
use crate::timeline::{ActionKind, PendingAction, Timeline, TimelineAction, TimelineError};

/// The single output stream this pipeline produces.
const MAIN_STREAM: StreamId = StreamId(0);

/// Failures surfaced by stream and buffer control.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration is invalid for this pipeline")]
    InvalidConfig,
    #[error("no stream has been configured")]
    NotConfigured,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Failures queueing a request; the request is handed back untouched.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("parameter buffer underrun")]
    ParamUnderrun(Request),
    #[error("statistics buffer underrun")]
    StatUnderrun(Request),
    #[error("request has no buffer for the active stream")]
    InvalidStream(Request),
    #[error("no stream has been configured")]
    NotConfigured(Request),
}

impl QueueError {
    /// Recover the rejected request.
    pub fn into_request(self) -> Request {
        match self {
            QueueError::ParamUnderrun(request)
            | QueueError::StatUnderrun(request)
            | QueueError::InvalidStream(request)
            | QueueError::NotConfigured(request) => request,
        }
    }
}

/// Pipeline handler for an ISP with three per-frame kernel streams.
pub struct IspPipeline {
    media: Box<dyn MediaGraph>,
    phy: Box<dyn Subdevice>,
    isp: Box<dyn Subdevice>,
    video: Box<dyn VideoNode>,
    param: Box<dyn VideoNode>,
    stat: Box<dyn VideoNode>,
    sensor: Box<dyn Sensor>,
    ipa: IpaChannel,
    clock: Box<dyn Clock>,

    camera_controls: ControlInfoMap,
    frames: FrameRegistry,
    timeline: Timeline,
    frame: u32,
    ipa_buffers: Vec<BufferId>,
    active_stream: Option<StreamConfig>,
    running: bool,
    completed: VecDeque<Request>,
}

impl IspPipeline {
    /// The media topology this pipeline requires.
    pub fn device_match() -> DeviceMatch {
        DeviceMatch::new(entities::DRIVER)
            .entity(entities::ISP)
            .entity(entities::SELF_PATH)
            .entity(entities::MAIN_PATH)
            .entity(entities::STAT)
            .entity(entities::PARAM)
            .entity(entities::PHY)
    }

    /// Acquire a matching media graph and build the handler around it.
    ///
    /// Returns `None` when no graph matches, when no sensor sits behind
    /// the CSI receiver, or when `create_ipa` cannot produce a 3A
    /// connection (a camera without its 3A is not registered).
    pub fn match_devices(
        enumerator: &mut dyn DeviceEnumerator,
        create_ipa: impl FnOnce() -> Option<IpaChannel>,
        clock: Box<dyn Clock>,
    ) -> Option<IspPipeline> {
        let devices = enumerator.acquire(&Self::device_match())?;
        let IspDevices {
            mut media,
            phy,
            isp,
            video,
            param,
            stat,
            mut sensors,
        } = devices;

        // Baseline link setup: CSI PHY into the ISP, ISP onto the main
        // capture path.
        if let Err(err) = media.disable_links() {
            error!(%err, "failed to reset media links");
            return None;
        }
        for (source, source_pad, sink, sink_pad) in [
            (entities::PHY, entities::PHY_SOURCE_PAD, entities::ISP, entities::ISP_SINK_PAD),
            (entities::ISP, entities::ISP_SOURCE_PAD, entities::MAIN_PATH, 0),
        ] {
            if let Err(err) = media.enable_link(source, source_pad, sink, sink_pad) {
                error!(%err, source, sink, "failed to set up pipeline link");
                return None;
            }
        }

        if sensors.is_empty() {
            warn!("no sensor connected to the CSI receiver");
            return None;
        }
        let sensor = sensors.remove(0);

        let Some(ipa) = create_ipa() else {
            error!(sensor = sensor.entity(), "no 3A available, camera not registered");
            return None;
        };

        let mut camera_controls = ControlInfoMap::new();
        camera_controls.insert(
            ids::AE_ENABLE,
            ControlInfo::new(
                ControlValue::Bool(false),
                ControlValue::Bool(true),
                ControlValue::Bool(true),
            ),
        );

        Some(IspPipeline {
            media,
            phy,
            isp,
            video,
            param,
            stat,
            sensor,
            ipa,
            clock,
            camera_controls,
            frames: FrameRegistry::new(),
            timeline: Timeline::new(),
            frame: 0,
            ipa_buffers: Vec::new(),
            active_stream: None,
            running: false,
            completed: VecDeque::new(),
        })
    }

    /// Controls the camera itself registers, beyond the sensor's.
    pub fn controls(&self) -> &ControlInfoMap {
        &self.camera_controls
    }

    /// In-flight frame registry (read-only view).
    pub fn frames(&self) -> &FrameRegistry {
        &self.frames
    }

    /// The frame number the next queued request will take.
    pub fn next_frame(&self) -> u32 {
        self.frame
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Adjust an action type's `(frame offset, time offset)` pair; the
    /// SOE offset is how the 3A's sensor timing characterization reaches
    /// the scheduler.
    pub fn set_delay(
        &mut self,
        kind: ActionKind,
        frame_offset: i32,
        time_offset_ns: i64,
    ) -> Result<(), TimelineError> {
        self.timeline.set_delay(kind, frame_offset, time_offset_ns)
    }

    /// Build a default configuration for `roles` (empty roles yield an
    /// empty configuration).
    pub fn generate_configuration(&self, roles: &[StreamRole]) -> CameraConfiguration {
        let mut config = CameraConfiguration::new();
        if roles.is_empty() {
            return config;
        }

        config.push(StreamConfig::new(PixelFormat::NV12, self.sensor.resolution()));
        config.validate(self.sensor.as_ref());
        config
    }

    /// Apply `config` to the sensor, the subdevice chain and the three
    /// video nodes.
    pub fn configure(&mut self, config: &mut CameraConfiguration) -> Result<(), PipelineError> {
        if config.validate(self.sensor.as_ref()) == ConfigStatus::Invalid {
            return Err(PipelineError::InvalidConfig);
        }
        let Some(mut format) = config.sensor_format() else {
            return Err(PipelineError::InvalidConfig);
        };

        // Route this camera's sensor into the receiver before touching
        // formats.
        self.media.select_sensor(self.sensor.entity())?;

        debug!(%format, "configuring sensor");
        self.sensor.set_format(&mut format)?;
        self.phy.set_format(entities::PHY_SINK_PAD, &mut format)?;
        let mut format = self.phy.get_format(entities::PHY_SOURCE_PAD)?;
        self.isp.set_format(entities::ISP_SINK_PAD, &mut format)?;

        // The ISP source pad produces packed YUV regardless of the Bayer
        // input.
        format.code = MbusCode::Yuyv8;
        self.isp.set_format(entities::ISP_SOURCE_PAD, &mut format)?;

        let cfg = config.get_mut(0).ok_or(PipelineError::InvalidConfig)?;
        let mut output = VideoFormat::new(cfg.pixel_format, cfg.size, 2);
        self.video.set_format(&mut output)?;
        if output.size != cfg.size || output.pixel_format != cfg.pixel_format {
            error!(
                requested = %cfg.pixel_format,
                got = %output.pixel_format,
                "video node rejected the negotiated capture format"
            );
            return Err(PipelineError::InvalidConfig);
        }

        self.param
            .set_format(&mut VideoFormat::meta(PixelFormat::ISP_PARAMS))?;
        self.stat
            .set_format(&mut VideoFormat::meta(PixelFormat::ISP_STAT))?;

        cfg.set_stream(MAIN_STREAM);
        self.active_stream = Some(cfg.clone());

        Ok(())
    }

    /// Allocate kernel buffers for the three streams and share the
    /// metadata buffers with the 3A.
    ///
    /// The metadata pools carry one buffer more than the pixel stream so
    /// a request can be prepared while every pixel buffer is in flight.
    pub fn allocate_buffers(&mut self) -> Result<(), PipelineError> {
        let cfg = self.active_stream.as_ref().ok_or(PipelineError::NotConfigured)?;
        // The validator pinned the count when the stream was configured.
        let count = cfg.buffer_count;
        let pool_count = count + 1;

        match cfg.memory {
            MemoryKind::Internal => {
                self.video.export_buffers(count)?;
            }
            MemoryKind::External => self.video.import_buffers(count)?,
        }

        let params = match self.param.export_buffers(pool_count) {
            Ok(params) => params,
            Err(err) => {
                self.release_video_buffers();
                return Err(err.into());
            }
        };
        let stats = match self.stat.export_buffers(pool_count) {
            Ok(stats) => stats,
            Err(err) => {
                if let Err(release) = self.param.release_buffers() {
                    warn!(%release, "failed to release parameter buffers");
                }
                self.release_video_buffers();
                return Err(err.into());
            }
        };

        let mut mappings = Vec::with_capacity(params.len() + stats.len());
        for (index, memory) in params.into_iter().enumerate() {
            mappings.push(IpaBuffer {
                id: BufferId::param(index as u32),
                memory,
            });
        }
        for (index, memory) in stats.into_iter().enumerate() {
            mappings.push(IpaBuffer {
                id: BufferId::stat(index as u32),
                memory,
            });
        }
        self.ipa_buffers = mappings.iter().map(|buffer| buffer.id).collect();
        self.send_ipa(IpaEvent::MapBuffers(mappings));

        self.frames.seed_pools(pool_count);

        Ok(())
    }

    /// Drop the free pools, withdraw the 3A mappings and release the
    /// kernel buffers. Release failures are logged, not raised.
    pub fn free_buffers(&mut self) {
        self.frames.drain_pools();

        if !self.ipa_buffers.is_empty() {
            let ids = std::mem::take(&mut self.ipa_buffers);
            self.send_ipa(IpaEvent::UnmapBuffers(ids));
        }

        if let Err(err) = self.param.release_buffers() {
            warn!(%err, "failed to release parameter buffers");
        }
        if let Err(err) = self.stat.release_buffers() {
            warn!(%err, "failed to release statistics buffers");
        }
        self.release_video_buffers();
    }

    fn release_video_buffers(&mut self) {
        if let Err(err) = self.video.release_buffers() {
            warn!(%err, "failed to release video buffers");
        }
    }

    /// Start the three kernel streams (parameters, statistics, pixels, in
    /// that order) and hand the stream configuration to the 3A.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let Some(cfg) = self.active_stream.clone() else {
            return Err(PipelineError::NotConfigured);
        };

        self.frame = 0;

        self.param.stream_on().inspect_err(|err| {
            error!(%err, "failed to start parameters stream");
        })?;
        if let Err(err) = self.stat.stream_on() {
            error!(%err, "failed to start statistics stream");
            self.stream_off_logged(NodeKind::Param);
            return Err(err.into());
        }
        if let Err(err) = self.video.stream_on() {
            error!(%err, "failed to start video stream");
            self.stream_off_logged(NodeKind::Stat);
            self.stream_off_logged(NodeKind::Param);
            return Err(err.into());
        }

        self.running = true;

        self.send_ipa(IpaEvent::Configure {
            stream: IpaStream {
                pixel_format: cfg.pixel_format,
                size: cfg.size,
            },
            sensor_controls: self.sensor.controls().clone(),
        });

        Ok(())
    }

    /// Stop the streams (pixels first), reset the timeline and discard
    /// whatever was still in flight.
    pub fn stop(&mut self) {
        self.stream_off_logged(NodeKind::Video);
        self.stream_off_logged(NodeKind::Stat);
        self.stream_off_logged(NodeKind::Param);

        self.timeline.reset();

        let discarded = self.frames.clear();
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "discarding in-flight requests");
        }

        self.running = false;
    }

    fn stream_off_logged(&mut self, node: NodeKind) {
        let result = match node {
            NodeKind::Video => self.video.stream_off(),
            NodeKind::Param => self.param.stream_off(),
            NodeKind::Stat => self.stat.stream_off(),
        };
        if let Err(err) = result {
            warn!(%err, %node, "failed to stop stream");
        }
    }

    /// Bind `request` to the next frame, notify the 3A and schedule the
    /// buffer hand-off.
    ///
    /// On failure nothing is consumed and the request comes back inside
    /// the error.
    pub fn queue_request(&mut self, request: Request) -> Result<(), QueueError> {
        if self.active_stream.is_none() {
            return Err(QueueError::NotConfigured(request));
        }

        let frame = self.frame;
        let (param_buffer, controls) = match self.frames.create(frame, request, MAIN_STREAM) {
            Ok(info) => (info.param_buffer, info.request.controls().clone()),
            Err((RegistryError::ParamUnderrun, request)) => {
                error!(frame, "parameter buffer underrun");
                return Err(QueueError::ParamUnderrun(request));
            }
            Err((RegistryError::StatUnderrun, request)) => {
                error!(frame, "statistics buffer underrun");
                return Err(QueueError::StatUnderrun(request));
            }
            Err((RegistryError::InvalidStream, request)) => {
                error!(frame, "request carries no buffer for the active stream");
                return Err(QueueError::InvalidStream(request));
            }
        };

        self.send_ipa(IpaEvent::QueueRequest {
            frame,
            param: BufferId::param(param_buffer),
            controls,
        });

        let now = self.clock.now();
        self.timeline
            .schedule(frame, TimelineAction::QueueBuffers, now);
        self.frame += 1;

        self.dispatch_due();
        Ok(())
    }

    /// Drain and handle every pending 3A action.
    pub fn process_ipa_actions(&mut self) {
        loop {
            match self.ipa.recv_action() {
                RecvOutcome::Data(action) => self.handle_ipa_action(action),
                RecvOutcome::Empty | RecvOutcome::Closed => break,
            }
        }
        self.dispatch_due();
    }

    fn handle_ipa_action(&mut self, action: IpaAction) {
        match action {
            IpaAction::SetSensorControls { frame, controls } => {
                let now = self.clock.now();
                self.timeline
                    .schedule(frame, TimelineAction::SetSensor { controls }, now);
            }
            IpaAction::ParamFilled { frame } => {
                if let Some(info) = self.frames.get_mut(frame) {
                    info.param_filled = true;
                } else {
                    warn!(frame, "parameters filled for unknown frame");
                }
            }
            IpaAction::Metadata { frame, controls } => self.metadata_ready(frame, controls),
            IpaAction::Unknown { frame, op } => {
                error!(frame, op, "unknown 3A action");
            }
        }
    }

    fn metadata_ready(&mut self, frame: u32, metadata: ControlList) {
        let Some(info) = self.frames.get_mut(frame) else {
            warn!(frame, "metadata for unknown frame");
            return;
        };
        info.request.set_metadata(metadata);
        info.metadata_processed = true;
        self.try_complete(frame);
    }

    /// A pixel buffer came back from the kernel.
    pub fn video_buffer_done(&mut self, done: DequeuedBuffer) {
        self.timeline.record_frame(done.sequence, done.timestamp);

        // Resynchronize the frame counter to the hardware sequence; it
        // only ever moves forward.
        if self.frame <= done.sequence {
            self.frame = done.sequence + 1;
        }

        match self.frames.find_by_buffer(NodeKind::Video, done.index) {
            Some(frame) => {
                if let Some(info) = self.frames.get_mut(frame) {
                    info.request.complete_buffer(done.index);
                }
                self.try_complete(frame);
            }
            None => warn!(index = done.index, "video buffer completion for unknown frame"),
        }

        self.dispatch_due();
    }

    /// The kernel consumed a parameter buffer.
    pub fn param_buffer_done(&mut self, done: DequeuedBuffer) {
        match self.frames.find_by_buffer(NodeKind::Param, done.index) {
            Some(frame) => {
                if let Some(info) = self.frames.get_mut(frame) {
                    info.param_dequeued = true;
                }
                self.try_complete(frame);
            }
            None => warn!(index = done.index, "parameter buffer completion for unknown frame"),
        }
        self.dispatch_due();
    }

    /// The kernel filled a statistics buffer; forward it to the 3A.
    pub fn stat_buffer_done(&mut self, done: DequeuedBuffer) {
        match self.frames.find_by_buffer(NodeKind::Stat, done.index) {
            Some(frame) => {
                self.send_ipa(IpaEvent::SignalStatBuffer {
                    frame,
                    stat: BufferId::stat(done.index),
                });
            }
            None => warn!(index = done.index, "statistics buffer completion for unknown frame"),
        }
        self.dispatch_due();
    }

    /// Run actions whose deadline has passed; call when the embedder's
    /// timer fires.
    pub fn tick(&mut self) {
        self.dispatch_due();
    }

    /// When the embedder's timer should fire next.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.timeline.next_deadline()
    }

    /// Take the oldest completed request, if any.
    pub fn pop_completed(&mut self) -> Option<Request> {
        self.completed.pop_front()
    }

    /// Complete the request on `frame` once nothing more is outstanding:
    /// the pixel buffer is back, metadata has been attached and the
    /// kernel has returned the parameter buffer.
    fn try_complete(&mut self, frame: u32) {
        let Some(info) = self.frames.get(frame) else {
            return;
        };
        if info.request.has_pending_buffers()
            || !info.metadata_processed
            || !info.param_dequeued
        {
            return;
        }

        if let Some(info) = self.frames.destroy(frame) {
            debug!(frame, cookie = info.request.cookie(), "request complete");
            self.completed.push_back(info.request);
        }
    }

    fn dispatch_due(&mut self) {
        let now = self.clock.now();
        for PendingAction { frame, action } in self.timeline.take_due(now) {
            self.run_action(frame, action);
        }
    }

    fn run_action(&mut self, frame: u32, action: TimelineAction) {
        match action {
            TimelineAction::SetSensor { controls } => {
                if let Err(err) = self.sensor.set_controls(&controls) {
                    error!(%err, frame, "failed to apply sensor controls");
                }
            }
            TimelineAction::QueueBuffers => self.queue_frame_buffers(frame),
            // Synthetic marker, nothing to run.
            TimelineAction::Soe => {}
        }
    }

    fn queue_frame_buffers(&mut self, frame: u32) {
        let Some(info) = self.frames.get(frame) else {
            error!(frame, "buffer hand-off for unknown frame");
            return;
        };
        let (param_buffer, stat_buffer, video_buffer, param_filled) = (
            info.param_buffer,
            info.stat_buffer,
            info.video_buffer,
            info.param_filled,
        );

        if param_filled {
            if let Err(err) = self.param.queue_buffer(param_buffer) {
                error!(%err, frame, "failed to queue parameter buffer");
            }
        } else {
            // The kernel will process this frame with default parameters.
            warn!(frame, "parameters not ready in time, ignoring them");
        }

        if let Err(err) = self.stat.queue_buffer(stat_buffer) {
            error!(%err, frame, "failed to queue statistics buffer");
        }
        if let Err(err) = self.video.queue_buffer(video_buffer) {
            error!(%err, frame, "failed to queue video buffer");
        }
    }

    fn send_ipa(&self, event: IpaEvent) {
        match self.ipa.send(event) {
            SendOutcome::Ok => {}
            SendOutcome::Full => error!("3A event channel full, event dropped"),
            SendOutcome::Closed => warn!("3A event channel closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::virt::{
        GraphState, ManualClock, NodeState, SensorState, VirtualEnumerator, VirtualGraph,
        VirtualNode, VirtualSensor, VirtualSubdevice,
    };
    use iris_ipa::IpaEndpoint;

    struct Rig {
        pipeline: IspPipeline,
        ipa: IpaEndpoint,
        clock: Rc<Cell<u64>>,
        video: Rc<RefCell<NodeState>>,
        param: Rc<RefCell<NodeState>>,
        stat: Rc<RefCell<NodeState>>,
        sensor: Rc<RefCell<SensorState>>,
        graph: Rc<RefCell<GraphState>>,
    }

    fn rig() -> Rig {
        let (graph_dev, graph) = VirtualGraph::new();
        let (video_dev, video) = VirtualNode::new(0x1000);
        let (param_dev, param) = VirtualNode::new(0x2000);
        let (stat_dev, stat) = VirtualNode::new(0x3000);
        let (sensor_dev, sensor) =
            VirtualSensor::new("imx219", Size::new(1920, 1080), vec![MbusCode::Sbggr10]);
        let devices = IspDevices {
            media: Box::new(graph_dev),
            phy: Box::new(VirtualSubdevice::default()),
            isp: Box::new(VirtualSubdevice::default()),
            video: Box::new(video_dev),
            param: Box::new(param_dev),
            stat: Box::new(stat_dev),
            sensors: vec![Box::new(sensor_dev)],
        };
        let mut enumerator = VirtualEnumerator::new(devices);
        let (channel, endpoint) = iris_ipa::channel(64);
        let (clock_dev, clock) = ManualClock::new();
        let pipeline =
            IspPipeline::match_devices(&mut enumerator, || Some(channel), Box::new(clock_dev))
                .expect("pipeline matches");
        Rig {
            pipeline,
            ipa: endpoint,
            clock,
            video,
            param,
            stat,
            sensor,
            graph,
        }
    }

    fn bring_up(rig: &mut Rig) {
        let mut config = rig
            .pipeline
            .generate_configuration(&[StreamRole::Viewfinder]);
        rig.pipeline.configure(&mut config).unwrap();
        rig.pipeline.allocate_buffers().unwrap();
        rig.pipeline.start().unwrap();
    }

    fn request(cookie: u64, buffer: u32) -> Request {
        let mut request = Request::new(cookie);
        request.add_buffer(StreamId(0), buffer);
        request
    }

    fn drain_events(rig: &Rig) -> Vec<IpaEvent> {
        let mut events = Vec::new();
        while let RecvOutcome::Data(event) = rig.ipa.recv_event() {
            events.push(event);
        }
        events
    }

    const MS: u64 = 1_000_000;

    #[test]
    fn happy_path_single_frame() {
        let mut rig = rig();
        bring_up(&mut rig);

        let events = drain_events(&rig);
        assert_eq!(events.len(), 2);
        match &events[0] {
            IpaEvent::MapBuffers(mappings) => {
                assert_eq!(mappings.len(), 10);
                assert_eq!(mappings[0].id, BufferId::param(0));
                assert_eq!(mappings[5].id, BufferId::stat(0));
            }
            other => panic!("expected MapBuffers, got {other:?}"),
        }
        match &events[1] {
            IpaEvent::Configure { stream, sensor_controls } => {
                assert_eq!(stream.pixel_format, PixelFormat::NV12);
                assert_eq!(stream.size, Size::new(1920, 1080));
                assert!(sensor_controls.contains(ids::EXPOSURE));
            }
            other => panic!("expected Configure, got {other:?}"),
        }
        assert_eq!(
            rig.graph.borrow().selected_sensor.as_deref(),
            Some("imx219")
        );

        let mut first = request(1, 0);
        first
            .controls_mut()
            .set(ids::ANALOGUE_GAIN, ControlValue::Int(1));
        rig.pipeline.queue_request(first).unwrap();

        match rig.ipa.recv_event() {
            RecvOutcome::Data(IpaEvent::QueueRequest { frame, param, controls }) => {
                assert_eq!(frame, 0);
                assert_eq!(param, BufferId::param(0));
                assert_eq!(controls.get(ids::ANALOGUE_GAIN), Some(&ControlValue::Int(1)));
            }
            other => panic!("expected QueueRequest, got {other:?}"),
        }

        let mut gain = ControlList::new();
        gain.set(ids::ANALOGUE_GAIN, ControlValue::Int(1));
        rig.ipa.send_action(IpaAction::SetSensorControls {
            frame: 0,
            controls: gain.clone(),
        });
        rig.ipa.send_action(IpaAction::ParamFilled { frame: 0 });
        rig.pipeline.process_ipa_actions();

        rig.clock.set(20 * MS);
        rig.pipeline.tick();

        assert_eq!(rig.sensor.borrow().applied, vec![gain]);
        assert_eq!(rig.param.borrow().queued, vec![0]);
        assert_eq!(rig.stat.borrow().queued, vec![0]);
        assert_eq!(rig.video.borrow().queued, vec![0]);

        let dma_end = Timestamp::from_nanos(1_000_000_000);
        rig.pipeline
            .video_buffer_done(DequeuedBuffer::new(0, 0, dma_end));
        rig.pipeline
            .param_buffer_done(DequeuedBuffer::new(0, 0, dma_end));
        rig.pipeline
            .stat_buffer_done(DequeuedBuffer::new(0, 0, dma_end));
        assert!(rig.pipeline.pop_completed().is_none());

        match rig.ipa.recv_event() {
            RecvOutcome::Data(IpaEvent::SignalStatBuffer { frame, stat }) => {
                assert_eq!(frame, 0);
                assert_eq!(stat, BufferId::stat(0));
            }
            other => panic!("expected SignalStatBuffer, got {other:?}"),
        }

        let mut metadata = ControlList::new();
        metadata.set(ids::EXPOSURE, ControlValue::Int(1000));
        rig.ipa.send_action(IpaAction::Metadata {
            frame: 0,
            controls: metadata.clone(),
        });
        rig.pipeline.process_ipa_actions();

        let done = rig.pipeline.pop_completed().expect("request completes");
        assert_eq!(done.cookie(), 1);
        assert_eq!(*done.metadata(), metadata);
        assert!(!done.has_pending_buffers());
        assert!(rig.pipeline.pop_completed().is_none());

        assert_eq!(rig.pipeline.frames().params().len(), 5);
        assert_eq!(rig.pipeline.frames().stats().len(), 5);
        assert_eq!(rig.pipeline.next_frame(), 1);
    }

    #[test]
    fn late_parameters_leave_request_pending_until_stop() {
        let mut rig = rig();
        bring_up(&mut rig);
        drain_events(&rig);

        rig.pipeline.queue_request(request(1, 0)).unwrap();
        drain_events(&rig);

        // No ParamFilled arrives before the hand-off deadline.
        rig.clock.set(20 * MS);
        rig.pipeline.tick();
        assert!(rig.param.borrow().queued.is_empty());
        assert_eq!(rig.stat.borrow().queued, vec![0]);
        assert_eq!(rig.video.borrow().queued, vec![0]);

        let dma_end = Timestamp::from_nanos(40 * MS);
        rig.pipeline
            .video_buffer_done(DequeuedBuffer::new(0, 0, dma_end));
        rig.pipeline
            .stat_buffer_done(DequeuedBuffer::new(0, 0, dma_end));
        drain_events(&rig);
        rig.ipa.send_action(IpaAction::Metadata {
            frame: 0,
            controls: ControlList::new(),
        });
        rig.pipeline.process_ipa_actions();

        // The parameter buffer was never queued, so it never dequeues and
        // the request can only be discarded by stop.
        assert!(rig.pipeline.pop_completed().is_none());
        rig.pipeline.stop();
        assert!(rig.pipeline.pop_completed().is_none());
        assert_eq!(rig.pipeline.frames().len(), 0);
        assert_eq!(rig.pipeline.frames().params().len(), 5);
        assert!(rig.pipeline.next_deadline().is_none());
        assert!(!rig.pipeline.is_running());
    }

    #[test]
    fn pool_underrun_rejects_without_side_effects() {
        let mut rig = rig();
        bring_up(&mut rig);

        // Pools hold buffer-count + 1 entries.
        for cookie in 0..5 {
            rig.pipeline
                .queue_request(request(cookie, cookie as u32))
                .unwrap();
        }
        assert_eq!(rig.pipeline.next_frame(), 5);

        let err = rig
            .pipeline
            .queue_request(request(5, 5))
            .err()
            .expect("pools exhausted");
        let rejected = match err {
            QueueError::ParamUnderrun(request) => request,
            other => panic!("expected underrun, got {other:?}"),
        };
        assert_eq!(rejected.cookie(), 5);
        assert_eq!(rig.pipeline.frames().len(), 5);
        assert_eq!(rig.pipeline.next_frame(), 5);
        assert_eq!(rig.pipeline.frames().params().metrics().underruns, 1);
    }

    #[test]
    fn out_of_order_metadata_completes_out_of_order() {
        let mut rig = rig();
        bring_up(&mut rig);
        drain_events(&rig);

        for cookie in 0..3u64 {
            rig.pipeline
                .queue_request(request(cookie, cookie as u32))
                .unwrap();
        }
        for frame in 0..3 {
            rig.ipa.send_action(IpaAction::ParamFilled { frame });
        }
        rig.pipeline.process_ipa_actions();
        rig.clock.set(50 * MS);
        rig.pipeline.tick();
        assert_eq!(rig.video.borrow().queued, vec![0, 1, 2]);

        for index in 0..3u32 {
            let stamp = Timestamp::from_nanos(u64::from(index + 2) * 33 * MS);
            rig.pipeline
                .video_buffer_done(DequeuedBuffer::new(index, index, stamp));
            rig.pipeline
                .param_buffer_done(DequeuedBuffer::new(index, index, stamp));
            rig.pipeline
                .stat_buffer_done(DequeuedBuffer::new(index, index, stamp));
        }
        drain_events(&rig);

        for frame in [2u32, 0, 1] {
            let mut metadata = ControlList::new();
            metadata.set(ids::EXPOSURE, ControlValue::Int(2000 + frame as i32));
            rig.ipa.send_action(IpaAction::Metadata {
                frame,
                controls: metadata,
            });
        }
        rig.pipeline.process_ipa_actions();

        for expected in [2u64, 0, 1] {
            let done = rig.pipeline.pop_completed().expect("completion");
            assert_eq!(done.cookie(), expected);
            assert_eq!(
                done.metadata().get(ids::EXPOSURE),
                Some(&ControlValue::Int(2000 + expected as i32))
            );
        }
        assert!(rig.pipeline.pop_completed().is_none());
        assert_eq!(rig.pipeline.next_frame(), 3);
        assert_eq!(rig.pipeline.frames().params().len(), 5);
    }

    #[test]
    fn start_failure_unwinds_streams() {
        let mut rig = rig();
        let mut config = rig
            .pipeline
            .generate_configuration(&[StreamRole::Viewfinder]);
        rig.pipeline.configure(&mut config).unwrap();
        rig.pipeline.allocate_buffers().unwrap();

        rig.stat.borrow_mut().fail_stream_on = true;
        let err = rig.pipeline.start().err().expect("stat stream fails");
        assert!(matches!(err, PipelineError::Device(_)));
        assert!(!rig.param.borrow().streaming);
        assert!(!rig.video.borrow().streaming);
        assert!(!rig.pipeline.is_running());

        // Only the buffer map went out; no Configure for a failed start.
        let events = drain_events(&rig);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], IpaEvent::MapBuffers(_)));
    }

    #[test]
    fn late_arrivals_after_completion_are_dropped() {
        let mut rig = rig();
        bring_up(&mut rig);
        drain_events(&rig);

        // Completions for buffers nothing is waiting on must not disturb
        // the pipeline; the hardware sequence still advances the counter.
        rig.pipeline
            .param_buffer_done(DequeuedBuffer::new(9, 0, Timestamp::from_nanos(MS)));
        rig.pipeline
            .stat_buffer_done(DequeuedBuffer::new(9, 0, Timestamp::from_nanos(MS)));
        rig.pipeline
            .video_buffer_done(DequeuedBuffer::new(9, 5, Timestamp::from_nanos(MS)));
        assert_eq!(rig.pipeline.next_frame(), 6);
        assert!(rig.pipeline.pop_completed().is_none());
        assert!(drain_events(&rig).is_empty());
    }

    #[test]
    fn unconfigured_pipeline_rejects_requests() {
        let mut rig = rig();
        let err = rig
            .pipeline
            .queue_request(request(1, 0))
            .err()
            .expect("not configured");
        assert!(matches!(&err, QueueError::NotConfigured(_)));
        assert_eq!(err.into_request().cookie(), 1);
    }

    #[test]
    fn invalid_stream_binding_is_rejected() {
        let mut rig = rig();
        bring_up(&mut rig);
        let err = rig
            .pipeline
            .queue_request(Request::new(3))
            .err()
            .expect("no buffer bound");
        assert!(matches!(err, QueueError::InvalidStream(_)));
        assert_eq!(rig.pipeline.frames().len(), 0);
        assert_eq!(rig.pipeline.next_frame(), 0);
    }

    #[test]
    fn free_buffers_unmaps_and_releases() {
        let mut rig = rig();
        bring_up(&mut rig);
        drain_events(&rig);

        rig.pipeline.stop();
        rig.pipeline.free_buffers();

        assert_eq!(rig.pipeline.frames().params().len(), 0);
        assert!(rig.video.borrow().released);
        assert!(rig.param.borrow().released);
        assert!(rig.stat.borrow().released);

        let events = drain_events(&rig);
        assert_eq!(events.len(), 1);
        match &events[0] {
            IpaEvent::UnmapBuffers(ids) => assert_eq!(ids.len(), 10),
            other => panic!("expected UnmapBuffers, got {other:?}"),
        }
    }

    #[test]
    fn match_requires_topology_sensor_and_ipa() {
        let (clock_dev, _) = ManualClock::new();
        let mut empty = VirtualEnumerator::empty();
        assert!(
            IspPipeline::match_devices(&mut empty, || Some(iris_ipa::channel(4).0), Box::new(clock_dev))
                .is_none()
        );
        let pattern = empty.matched.expect("pattern probed");
        assert_eq!(pattern.driver, entities::DRIVER);
        assert!(pattern.entities.iter().any(|e| e == entities::MAIN_PATH));

        // A graph without a sensor is not a camera.
        let (graph_dev, _) = VirtualGraph::new();
        let devices = IspDevices {
            media: Box::new(graph_dev),
            phy: Box::new(VirtualSubdevice::default()),
            isp: Box::new(VirtualSubdevice::default()),
            video: Box::new(VirtualNode::new(0).0),
            param: Box::new(VirtualNode::new(0).0),
            stat: Box::new(VirtualNode::new(0).0),
            sensors: Vec::new(),
        };
        let (clock_dev, _) = ManualClock::new();
        let mut enumerator = VirtualEnumerator::new(devices);
        assert!(
            IspPipeline::match_devices(&mut enumerator, || Some(iris_ipa::channel(4).0), Box::new(clock_dev))
                .is_none()
        );

        // No 3A, no camera.
        let (graph_dev, _) = VirtualGraph::new();
        let devices = IspDevices {
            media: Box::new(graph_dev),
            phy: Box::new(VirtualSubdevice::default()),
            isp: Box::new(VirtualSubdevice::default()),
            video: Box::new(VirtualNode::new(0).0),
            param: Box::new(VirtualNode::new(0).0),
            stat: Box::new(VirtualNode::new(0).0),
            sensors: vec![Box::new(
                VirtualSensor::new("imx219", Size::new(1920, 1080), vec![MbusCode::Sbggr10]).0,
            )],
        };
        let (clock_dev, _) = ManualClock::new();
        let mut enumerator = VirtualEnumerator::new(devices);
        assert!(
            IspPipeline::match_devices(&mut enumerator, || None, Box::new(clock_dev)).is_none()
        );
    }

    #[test]
    fn empty_roles_yield_empty_configuration() {
        let rig = rig();
        let config = rig.pipeline.generate_configuration(&[]);
        assert!(config.is_empty());
    }
}
