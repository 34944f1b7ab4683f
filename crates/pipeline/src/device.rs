//! Interfaces to the kernel media/V4L2 layer consumed by the pipeline.
//!
//! The pipeline never touches ioctls itself; the embedder supplies these
//! traits and delivers completions back into the handler on the event
//! thread. In-memory implementations live in [`crate::virt`].

use std::fmt;

use iris_core::prelude::*;
use thiserror::Error;

/// Kernel ioctl failure surfaced by a device wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op} failed: errno {errno}")]
pub struct DeviceError {
    pub op: &'static str,
    pub errno: i32,
}

impl DeviceError {
    pub fn new(op: &'static str, errno: i32) -> Self {
        Self { op, errno }
    }
}

/// Which of the three kernel streams a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Video,
    Param,
    Stat,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Video => write!(f, "video"),
            NodeKind::Param => write!(f, "param"),
            NodeKind::Stat => write!(f, "stat"),
        }
    }
}

/// Format negotiated on a video node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub size: Size,
    pub planes: u32,
}

impl VideoFormat {
    pub fn new(pixel_format: PixelFormat, size: Size, planes: u32) -> Self {
        Self {
            pixel_format,
            size,
            planes,
        }
    }

    /// Format for a metadata node, which carries no geometry.
    pub fn meta(pixel_format: PixelFormat) -> Self {
        Self {
            pixel_format,
            size: Size::default(),
            planes: 1,
        }
    }
}

/// One video node of the media graph.
///
/// `set_format` follows kernel semantics: the driver may adjust the
/// requested format, and the struct is updated with what was actually
/// applied. Buffer completions do not come back through this trait; the
/// embedder's event loop hands them to the pipeline as
/// [`DequeuedBuffer`] values.
pub trait VideoNode {
    fn set_format(&mut self, format: &mut VideoFormat) -> Result<(), DeviceError>;

    /// Allocate `count` buffers in the kernel and export their memory.
    fn export_buffers(&mut self, count: u32) -> Result<Vec<MemoryRef>, DeviceError>;

    /// Prepare the node for `count` externally allocated buffers.
    fn import_buffers(&mut self, count: u32) -> Result<(), DeviceError>;

    fn release_buffers(&mut self) -> Result<(), DeviceError>;

    fn stream_on(&mut self) -> Result<(), DeviceError>;

    fn stream_off(&mut self) -> Result<(), DeviceError>;

    /// Hand the buffer at `index` to the kernel.
    fn queue_buffer(&mut self, index: u32) -> Result<(), DeviceError>;
}

/// A V4L2 subdevice pad interface.
pub trait Subdevice {
    fn set_format(&mut self, pad: u32, format: &mut SensorFormat) -> Result<(), DeviceError>;

    fn get_format(&self, pad: u32) -> Result<SensorFormat, DeviceError>;
}

/// The camera sensor behind the CSI receiver.
pub trait Sensor {
    /// Media entity name, used for link selection.
    fn entity(&self) -> &str;

    fn set_controls(&mut self, controls: &ControlList) -> Result<(), DeviceError>;

    fn set_format(&mut self, format: &mut SensorFormat) -> Result<(), DeviceError>;

    /// Pick the best supported media-bus format for `size` from the
    /// priority-ordered `candidates`. A returned empty size means no
    /// candidate matched; callers fall back to the native resolution.
    fn pick_format(&self, candidates: &[MbusCode], size: Size) -> SensorFormat;

    /// Native (full-frame) resolution.
    fn resolution(&self) -> Size;

    /// Controls the sensor driver advertises.
    fn controls(&self) -> &ControlInfoMap;
}

/// Link control over the media graph.
pub trait MediaGraph {
    fn disable_links(&mut self) -> Result<(), DeviceError>;

    fn enable_link(
        &mut self,
        source: &str,
        source_pad: u32,
        sink: &str,
        sink_pad: u32,
    ) -> Result<(), DeviceError>;

    /// Enable the link from `entity` into the CSI receiver and disable
    /// the links from every other sensor.
    fn select_sensor(&mut self, entity: &str) -> Result<(), DeviceError>;
}

/// Clock on the same base as kernel buffer timestamps.
///
/// The production implementation belongs to the embedder's event loop;
/// tests use [`crate::virt::ManualClock`].
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Required driver and media entities for a graph to drive this pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatch {
    pub driver: String,
    pub entities: Vec<String>,
}

impl DeviceMatch {
    pub fn new(driver: &str) -> Self {
        Self {
            driver: driver.to_string(),
            entities: Vec::new(),
        }
    }

    pub fn entity(mut self, name: &str) -> Self {
        self.entities.push(name.to_string());
        self
    }
}

/// The kernel devices of one matched ISP media graph.
pub struct IspDevices {
    pub media: Box<dyn MediaGraph>,
    pub phy: Box<dyn Subdevice>,
    pub isp: Box<dyn Subdevice>,
    pub video: Box<dyn VideoNode>,
    pub param: Box<dyn VideoNode>,
    pub stat: Box<dyn VideoNode>,
    pub sensors: Vec<Box<dyn Sensor>>,
}

/// Media-device discovery, owned by the camera framework.
pub trait DeviceEnumerator {
    /// Acquire the media graph matching `pattern`, or `None` when the
    /// running system has no such graph.
    fn acquire(&mut self, pattern: &DeviceMatch) -> Option<IspDevices>;
}

/// Entity names of the ISP media graph this pipeline drives.
pub mod entities {
    pub const DRIVER: &str = "rkisp1";
    pub const PHY: &str = "rockchip-sy-mipi-dphy";
    pub const ISP: &str = "rkisp1-isp-subdev";
    pub const MAIN_PATH: &str = "rkisp1_mainpath";
    pub const SELF_PATH: &str = "rkisp1_selfpath";
    pub const STAT: &str = "rkisp1-statistics";
    pub const PARAM: &str = "rkisp1-input-params";

    /// Sink pad of the CSI PHY (sensor side).
    pub const PHY_SINK_PAD: u32 = 0;
    /// Source pad of the CSI PHY (ISP side).
    pub const PHY_SOURCE_PAD: u32 = 1;
    /// Sink pad of the ISP subdevice.
    pub const ISP_SINK_PAD: u32 = 0;
    /// YUV source pad of the ISP subdevice.
    pub const ISP_SOURCE_PAD: u32 = 2;
}
