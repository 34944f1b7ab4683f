//! In-memory devices for exercising the pipeline without hardware.
//!
//! Each virtual device shares its observable state through an
//! `Rc<RefCell<_>>` handle, which fits the pipeline's single-threaded
//! model and lets a test or bring-up harness inspect queued buffers,
//! applied controls and link changes from outside the handler.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use iris_core::prelude::*;

use crate::device::{
    Clock, DeviceEnumerator, DeviceError, DeviceMatch, IspDevices, MediaGraph, Sensor, Subdevice,
    VideoNode,
};

/// Observable state of a [`VirtualNode`].
#[derive(Debug, Default)]
pub struct NodeState {
    pub format: Option<crate::device::VideoFormat>,
    pub exported: u32,
    pub queued: Vec<u32>,
    pub streaming: bool,
    pub released: bool,
    /// Make the next `stream_on` fail, for unwind testing.
    pub fail_stream_on: bool,
}

/// Video node that records everything it is asked to do.
pub struct VirtualNode {
    state: Rc<RefCell<NodeState>>,
    memory_base: u64,
}

impl VirtualNode {
    pub fn new(memory_base: u64) -> (Self, Rc<RefCell<NodeState>>) {
        let state = Rc::new(RefCell::new(NodeState::default()));
        (
            Self {
                state: state.clone(),
                memory_base,
            },
            state,
        )
    }
}

impl VideoNode for VirtualNode {
    fn set_format(&mut self, format: &mut crate::device::VideoFormat) -> Result<(), DeviceError> {
        self.state.borrow_mut().format = Some(*format);
        Ok(())
    }

    fn export_buffers(&mut self, count: u32) -> Result<Vec<MemoryRef>, DeviceError> {
        let mut state = self.state.borrow_mut();
        state.exported = count;
        state.released = false;
        Ok((0..count)
            .map(|i| MemoryRef(self.memory_base + u64::from(i)))
            .collect())
    }

    fn import_buffers(&mut self, count: u32) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        state.exported = count;
        state.released = false;
        Ok(())
    }

    fn release_buffers(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        state.exported = 0;
        state.released = true;
        Ok(())
    }

    fn stream_on(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if state.fail_stream_on {
            return Err(DeviceError::new("VIDIOC_STREAMON", 5));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), DeviceError> {
        self.state.borrow_mut().streaming = false;
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError> {
        self.state.borrow_mut().queued.push(index);
        Ok(())
    }
}

/// Observable state of a [`VirtualSensor`].
#[derive(Debug, Default)]
pub struct SensorState {
    pub format: Option<SensorFormat>,
    pub applied: Vec<ControlList>,
}

/// Sensor with a fixed native resolution and a set of supported media-bus
/// codes.
pub struct VirtualSensor {
    entity: String,
    resolution: Size,
    codes: Vec<MbusCode>,
    controls: ControlInfoMap,
    state: Rc<RefCell<SensorState>>,
}

impl VirtualSensor {
    pub fn new(
        entity: &str,
        resolution: Size,
        codes: Vec<MbusCode>,
    ) -> (Self, Rc<RefCell<SensorState>>) {
        let mut controls = ControlInfoMap::new();
        controls.insert(
            ids::EXPOSURE,
            ControlInfo::new(
                ControlValue::Int(1),
                ControlValue::Int(65_535),
                ControlValue::Int(1_000),
            ),
        );
        controls.insert(
            ids::ANALOGUE_GAIN,
            ControlInfo::new(
                ControlValue::Int(1),
                ControlValue::Int(255),
                ControlValue::Int(1),
            ),
        );
        let state = Rc::new(RefCell::new(SensorState::default()));
        (
            Self {
                entity: entity.to_string(),
                resolution,
                codes,
                controls,
                state: state.clone(),
            },
            state,
        )
    }
}

impl Sensor for VirtualSensor {
    fn entity(&self) -> &str {
        &self.entity
    }

    fn set_controls(&mut self, controls: &ControlList) -> Result<(), DeviceError> {
        self.state.borrow_mut().applied.push(controls.clone());
        Ok(())
    }

    fn set_format(&mut self, format: &mut SensorFormat) -> Result<(), DeviceError> {
        self.state.borrow_mut().format = Some(*format);
        Ok(())
    }

    fn pick_format(&self, candidates: &[MbusCode], size: Size) -> SensorFormat {
        for code in candidates {
            if self.codes.contains(code) {
                let size = if size.is_empty() {
                    self.resolution
                } else {
                    Size::new(
                        size.width.min(self.resolution.width),
                        size.height.min(self.resolution.height),
                    )
                };
                return SensorFormat::new(*code, size);
            }
        }
        // Empty size tells the caller nothing matched.
        SensorFormat::new(
            candidates.first().copied().unwrap_or(MbusCode::Sbggr8),
            Size::default(),
        )
    }

    fn resolution(&self) -> Size {
        self.resolution
    }

    fn controls(&self) -> &ControlInfoMap {
        &self.controls
    }
}

/// Subdevice that echoes formats through its pads.
#[derive(Default)]
pub struct VirtualSubdevice {
    pads: Vec<(u32, SensorFormat)>,
}

impl Subdevice for VirtualSubdevice {
    fn set_format(&mut self, pad: u32, format: &mut SensorFormat) -> Result<(), DeviceError> {
        self.pads.retain(|(p, _)| *p != pad);
        self.pads.push((pad, *format));
        Ok(())
    }

    fn get_format(&self, pad: u32) -> Result<SensorFormat, DeviceError> {
        // A real subdevice propagates its sink format to the source pad;
        // fall back to any configured pad.
        self.pads
            .iter()
            .find(|(p, _)| *p == pad)
            .or_else(|| self.pads.first())
            .map(|(_, format)| *format)
            .ok_or(DeviceError::new("VIDIOC_SUBDEV_G_FMT", 22))
    }
}

/// Observable state of a [`VirtualGraph`].
#[derive(Debug, Default)]
pub struct GraphState {
    pub resets: u32,
    pub enabled: Vec<(String, u32, String, u32)>,
    pub selected_sensor: Option<String>,
}

/// Media graph that records link operations.
pub struct VirtualGraph {
    state: Rc<RefCell<GraphState>>,
}

impl VirtualGraph {
    pub fn new() -> (Self, Rc<RefCell<GraphState>>) {
        let state = Rc::new(RefCell::new(GraphState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl MediaGraph for VirtualGraph {
    fn disable_links(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        state.resets += 1;
        state.enabled.clear();
        Ok(())
    }

    fn enable_link(
        &mut self,
        source: &str,
        source_pad: u32,
        sink: &str,
        sink_pad: u32,
    ) -> Result<(), DeviceError> {
        self.state.borrow_mut().enabled.push((
            source.to_string(),
            source_pad,
            sink.to_string(),
            sink_pad,
        ));
        Ok(())
    }

    fn select_sensor(&mut self, entity: &str) -> Result<(), DeviceError> {
        self.state.borrow_mut().selected_sensor = Some(entity.to_string());
        Ok(())
    }
}

/// Clock whose current time is set by hand.
///
/// # Example
/// ```rust
/// use iris_pipeline::device::Clock;
/// use iris_pipeline::virt::ManualClock;
///
/// let (clock, handle) = ManualClock::new();
/// handle.set(5_000);
/// assert_eq!(clock.now().as_nanos(), 5_000);
/// ```
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> (Self, Rc<Cell<u64>>) {
        let now = Rc::new(Cell::new(0));
        (Self { now: now.clone() }, now)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.now.get())
    }
}

/// Enumerator holding one prepared device bundle.
pub struct VirtualEnumerator {
    devices: Option<IspDevices>,
    pub matched: Option<DeviceMatch>,
}

impl VirtualEnumerator {
    pub fn new(devices: IspDevices) -> Self {
        Self {
            devices: Some(devices),
            matched: None,
        }
    }

    /// An enumerator that matches nothing.
    pub fn empty() -> Self {
        Self {
            devices: None,
            matched: None,
        }
    }
}

impl DeviceEnumerator for VirtualEnumerator {
    fn acquire(&mut self, pattern: &DeviceMatch) -> Option<IspDevices> {
        self.matched = Some(pattern.clone());
        self.devices.take()
    }
}
