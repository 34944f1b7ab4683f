use std::{fmt, str::FromStr};

/// Four-character pixel format code, as negotiated on a video node.
///
/// # Example
/// ```rust
/// use iris_core::prelude::PixelFormat;
///
/// let fmt = PixelFormat::NV12;
/// assert_eq!(fmt.to_string(), "NV12");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat([u8; 4]);

impl PixelFormat {
    /// Two-plane Y/UV 4:2:0, the pipeline's default output format.
    pub const NV12: PixelFormat = PixelFormat(*b"NV12");
    pub const NV21: PixelFormat = PixelFormat(*b"NV21");
    pub const NV16: PixelFormat = PixelFormat(*b"NV16");
    pub const NV61: PixelFormat = PixelFormat(*b"NV61");
    pub const YUYV: PixelFormat = PixelFormat(*b"YUYV");
    pub const YVYU: PixelFormat = PixelFormat(*b"YVYU");
    pub const VYUY: PixelFormat = PixelFormat(*b"VYUY");
    pub const GREY: PixelFormat = PixelFormat(*b"GREY");

    /// ISP parameter metadata stream format.
    pub const ISP_PARAMS: PixelFormat = PixelFormat(*b"RK1P");
    /// ISP 3A statistics metadata stream format.
    pub const ISP_STAT: PixelFormat = PixelFormat(*b"RK1S");

    /// Construct from raw fourcc bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding, as the kernel reports it.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Printable form, if the code is ASCII.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for PixelFormat {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("pixel format must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(PixelFormat(arr))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for PixelFormat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // String encoding keeps the wire format readable and avoids
        // `deserialize_any` on the receiving side.
        serializer.serialize_str(self.as_str().unwrap_or("????"))
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PixelFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FourccVisitor;

        impl<'de> serde::de::Visitor<'de> for FourccVisitor {
            type Value = PixelFormat;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 4-character pixel format string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                PixelFormat::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(FourccVisitor)
    }
}

/// Frame geometry in pixels.
///
/// Zero width or height means "unspecified"; the configuration validator
/// fills in a default before anything reaches the kernel.
///
/// # Example
/// ```rust
/// use iris_core::prelude::Size;
///
/// let size = Size::new(1920, 1080);
/// assert!(!size.is_empty());
/// assert_eq!(size.clamped(Size::new(32, 16), Size::new(640, 480)), Size::new(640, 480));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is unspecified.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clamp both dimensions into `[min, max]`.
    pub fn clamped(&self, min: Size, max: Size) -> Size {
        Size {
            width: self.width.clamp(min.width, max.width),
            height: self.height.clamp(min.height, max.height),
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Media-bus code negotiated across a pad-to-pad link.
///
/// Only the codes this pipeline can negotiate are represented: the raw
/// Bayer permutations at 8, 10 and 12 bits on the sensor side, and packed
/// YUV on the ISP source pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum MbusCode {
    Sbggr8,
    Sgbrg8,
    Sgrbg8,
    Srggb8,
    Sbggr10,
    Sgbrg10,
    Sgrbg10,
    Srggb10,
    Sbggr12,
    Sgbrg12,
    Sgrbg12,
    Srggb12,
    Yuyv8,
}

impl MbusCode {
    /// The kernel's numeric media-bus code.
    pub fn to_u32(self) -> u32 {
        match self {
            MbusCode::Sbggr8 => 0x3001,
            MbusCode::Sgbrg8 => 0x3013,
            MbusCode::Sgrbg8 => 0x3002,
            MbusCode::Srggb8 => 0x3014,
            MbusCode::Sbggr10 => 0x3007,
            MbusCode::Sgbrg10 => 0x300e,
            MbusCode::Sgrbg10 => 0x300a,
            MbusCode::Srggb10 => 0x300f,
            MbusCode::Sbggr12 => 0x3008,
            MbusCode::Sgbrg12 => 0x3010,
            MbusCode::Sgrbg12 => 0x3011,
            MbusCode::Srggb12 => 0x3012,
            MbusCode::Yuyv8 => 0x2008,
        }
    }

    /// Bits per sample for the raw Bayer codes, `None` for packed YUV.
    pub fn bit_depth(self) -> Option<u32> {
        match self {
            MbusCode::Sbggr8 | MbusCode::Sgbrg8 | MbusCode::Sgrbg8 | MbusCode::Srggb8 => Some(8),
            MbusCode::Sbggr10 | MbusCode::Sgbrg10 | MbusCode::Sgrbg10 | MbusCode::Srggb10 => {
                Some(10)
            }
            MbusCode::Sbggr12 | MbusCode::Sgbrg12 | MbusCode::Sgrbg12 | MbusCode::Srggb12 => {
                Some(12)
            }
            MbusCode::Yuyv8 => None,
        }
    }
}

/// Format on a subdevice pad: media-bus code plus geometry.
///
/// # Example
/// ```rust
/// use iris_core::prelude::{MbusCode, SensorFormat, Size};
///
/// let fmt = SensorFormat::new(MbusCode::Sbggr10, Size::new(1920, 1080));
/// assert_eq!(fmt.size.width, 1920);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorFormat {
    pub code: MbusCode,
    pub size: Size,
}

impl SensorFormat {
    pub const fn new(code: MbusCode, size: Size) -> Self {
        Self { code, size }
    }
}

impl fmt::Display for SensorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.code, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display_roundtrip() {
        assert_eq!(PixelFormat::NV12.to_string(), "NV12");
        assert_eq!("YUYV".parse::<PixelFormat>().unwrap(), PixelFormat::YUYV);
        assert!("NV".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn fourcc_u32_is_little_endian() {
        let fmt = PixelFormat::NV12;
        assert_eq!(PixelFormat::from(fmt.to_u32()), fmt);
        assert_eq!(fmt.to_u32() & 0xff, u32::from(b'N'));
    }

    #[test]
    fn size_clamp_and_empty() {
        assert!(Size::new(0, 1080).is_empty());
        let clamped = Size::new(10_000, 8).clamped(Size::new(32, 16), Size::new(4416, 3312));
        assert_eq!(clamped, Size::new(4416, 16));
    }

    #[test]
    fn mbus_depth() {
        assert_eq!(MbusCode::Srggb12.bit_depth(), Some(12));
        assert_eq!(MbusCode::Yuyv8.bit_depth(), None);
    }
}
