#![doc = include_str!("../README.md")]

pub mod config;
pub mod device;
pub mod frames;
pub mod handler;
pub mod request;
pub mod timeline;
pub mod virt;

pub use iris_core as core;
pub use iris_ipa as ipa;

pub mod prelude {
    pub use crate::config::{
        CameraConfiguration, ConfigStatus, MemoryKind, StreamConfig, StreamRole,
    };
    pub use crate::device::{
        Clock, DeviceEnumerator, DeviceError, DeviceMatch, IspDevices, MediaGraph, NodeKind,
        Sensor, Subdevice, VideoFormat, VideoNode,
    };
    pub use crate::frames::{FrameInfo, FrameRegistry, FreePool, PoolMetrics, RegistryError};
    pub use crate::handler::{IspPipeline, PipelineError, QueueError};
    pub use crate::request::{Request, StreamId};
    pub use crate::timeline::{
        ActionKind, PendingAction, Timeline, TimelineAction, TimelineError,
    };
    pub use iris_core::prelude::*;
    pub use iris_ipa::{BufferId, IpaAction, IpaChannel, IpaEndpoint, IpaEvent, IpaStream};
}
