//! Stream configuration and the negotiation against sensor and ISP
//! limits.

use tracing::debug;

use iris_core::prelude::*;

use crate::device::Sensor;
use crate::request::StreamId;

/// What the caller intends to do with a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Viewfinder,
    VideoRecording,
    StillCapture,
}

/// Who allocates the pixel buffers for the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryKind {
    /// The pipeline exports buffers from the video node.
    #[default]
    Internal,
    /// The caller imports its own dmabufs.
    External,
}

/// Outcome of validating a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    Valid,
    /// The configuration was usable but had to be mutated; the caller
    /// decides whether the adjusted version is acceptable.
    Adjusted,
    Invalid,
}

/// Requested (and, after validation, negotiated) output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub pixel_format: PixelFormat,
    pub size: Size,
    pub buffer_count: u32,
    pub memory: MemoryKind,
    stream: Option<StreamId>,
}

impl StreamConfig {
    pub fn new(pixel_format: PixelFormat, size: Size) -> Self {
        Self {
            pixel_format,
            size,
            buffer_count: 0,
            memory: MemoryKind::default(),
            stream: None,
        }
    }

    /// The stream this configuration was applied to, set by `configure`.
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    pub(crate) fn set_stream(&mut self, stream: StreamId) {
        self.stream = Some(stream);
    }
}

/// Output formats the ISP can produce on its main path.
const ACCEPTED_FORMATS: [PixelFormat; 8] = [
    PixelFormat::YUYV,
    PixelFormat::YVYU,
    PixelFormat::VYUY,
    PixelFormat::NV16,
    PixelFormat::NV61,
    PixelFormat::NV21,
    PixelFormat::NV12,
    PixelFormat::GREY,
];

/// Sensor media-bus codes in preference order: deepest Bayer first.
const SENSOR_CODES: [MbusCode; 12] = [
    MbusCode::Sbggr12,
    MbusCode::Sgbrg12,
    MbusCode::Sgrbg12,
    MbusCode::Srggb12,
    MbusCode::Sbggr10,
    MbusCode::Sgbrg10,
    MbusCode::Sgrbg10,
    MbusCode::Srggb10,
    MbusCode::Sbggr8,
    MbusCode::Sgbrg8,
    MbusCode::Sgrbg8,
    MbusCode::Srggb8,
];

const BUFFER_COUNT: u32 = 4;

const MIN_SIZE: Size = Size::new(32, 16);
const MAX_SIZE: Size = Size::new(4416, 3312);
const DEFAULT_WIDTH: u32 = 1280;

/// A set of stream configurations negotiated for one camera.
///
/// Validation is idempotent: a configuration that validated `Valid` is
/// returned untouched on the next pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraConfiguration {
    streams: Vec<StreamConfig>,
    sensor_format: Option<SensorFormat>,
}

impl CameraConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, config: StreamConfig) {
        self.streams.push(config);
    }

    pub fn get(&self, index: usize) -> Option<&StreamConfig> {
        self.streams.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut StreamConfig> {
        self.streams.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// The sensor format selected by the last validation.
    pub fn sensor_format(&self) -> Option<SensorFormat> {
        self.sensor_format
    }

    /// Negotiate the configuration against `sensor` and the ISP's output
    /// constraints, mutating it into a legal one where possible.
    pub fn validate(&mut self, sensor: &dyn Sensor) -> ConfigStatus {
        let mut status = ConfigStatus::Valid;

        if self.streams.is_empty() {
            return ConfigStatus::Invalid;
        }

        // Single-stream pipeline: excess entries are dropped.
        if self.streams.len() > 1 {
            self.streams.truncate(1);
            status = ConfigStatus::Adjusted;
        }

        let cfg = &mut self.streams[0];

        if !ACCEPTED_FORMATS.contains(&cfg.pixel_format) {
            debug!(requested = %cfg.pixel_format, "adjusting pixel format to NV12");
            cfg.pixel_format = PixelFormat::NV12;
            status = ConfigStatus::Adjusted;
        }

        let mut sensor_format = sensor.pick_format(&SENSOR_CODES, cfg.size);
        if sensor_format.size.is_empty() {
            sensor_format.size = sensor.resolution();
        }
        self.sensor_format = Some(sensor_format);

        let requested = cfg.size;
        if cfg.size.is_empty() {
            // Default to a width that matches the sensor aspect ratio.
            cfg.size.width = DEFAULT_WIDTH;
            cfg.size.height = DEFAULT_WIDTH * sensor_format.size.height / sensor_format.size.width;
        }
        cfg.size = cfg.size.clamped(MIN_SIZE, MAX_SIZE);
        if cfg.size != requested {
            debug!(%requested, adjusted = %cfg.size, "adjusting stream size");
            status = ConfigStatus::Adjusted;
        }

        cfg.buffer_count = BUFFER_COUNT;

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::VirtualSensor;

    fn sensor() -> VirtualSensor {
        VirtualSensor::new(
            "imx219",
            Size::new(3280, 2464),
            vec![MbusCode::Srggb10],
        )
        .0
    }

    fn config_with(pixel_format: PixelFormat, size: Size) -> CameraConfiguration {
        let mut config = CameraConfiguration::new();
        config.push(StreamConfig::new(pixel_format, size));
        config
    }

    #[test]
    fn empty_configuration_is_invalid() {
        let mut config = CameraConfiguration::new();
        assert_eq!(config.validate(&sensor()), ConfigStatus::Invalid);
    }

    #[test]
    fn oversized_alien_format_is_adjusted() {
        let mut config = config_with(PixelFormat::new(*b"YV12"), Size::new(10_000, 10_000));
        assert_eq!(config.validate(&sensor()), ConfigStatus::Adjusted);

        let cfg = config.get(0).unwrap();
        assert_eq!(cfg.pixel_format, PixelFormat::NV12);
        assert_eq!(cfg.size, Size::new(4416, 3312));
        assert_eq!(cfg.buffer_count, 4);
    }

    #[test]
    fn excess_streams_are_dropped() {
        let mut config = config_with(PixelFormat::NV12, Size::new(1280, 960));
        config.push(StreamConfig::new(PixelFormat::NV12, Size::new(640, 480)));
        assert_eq!(config.validate(&sensor()), ConfigStatus::Adjusted);
        assert_eq!(config.len(), 1);
        assert_eq!(config.get(0).unwrap().size, Size::new(1280, 960));
    }

    #[test]
    fn unspecified_size_follows_sensor_aspect() {
        let mut config = config_with(PixelFormat::NV12, Size::default());
        assert_eq!(config.validate(&sensor()), ConfigStatus::Adjusted);
        let cfg = config.get(0).unwrap();
        assert_eq!(cfg.size.width, 1280);
        // 1280 * 2464 / 3280
        assert_eq!(cfg.size.height, 961);
    }

    #[test]
    fn validation_is_idempotent() {
        let mut config = config_with(PixelFormat::new(*b"YV12"), Size::new(10_000, 10_000));
        assert_eq!(config.validate(&sensor()), ConfigStatus::Adjusted);
        let adjusted = config.clone();

        assert_eq!(config.validate(&sensor()), ConfigStatus::Valid);
        assert_eq!(config, adjusted);
    }

    #[test]
    fn sensor_format_prefers_deepest_bayer() {
        let supported = vec![MbusCode::Sbggr8, MbusCode::Srggb10];
        let (sensor, _) = VirtualSensor::new("ov5647", Size::new(2592, 1944), supported);

        let mut config = config_with(PixelFormat::NV12, Size::new(1920, 1080));
        assert_eq!(config.validate(&sensor), ConfigStatus::Valid);
        let format = config.sensor_format().unwrap();
        // 10-bit outranks 8-bit in the candidate ordering.
        assert_eq!(format.code, MbusCode::Srggb10);
        assert_eq!(format.size, Size::new(1920, 1080));
    }
}
