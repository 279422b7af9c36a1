use serde::{Deserialize, Serialize};

// ── Pixel formats ─────────────────────────────────────────────────────────────

/// Pixel format of a raw captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra,
    /// Planar YUV 4:2:0, Y plane followed by interleaved UV.
    Nv12,
}

// ── RawFrame ──────────────────────────────────────────────────────────────────

/// A raw captured video frame.
///
/// The capture source owns its buffers only while the delivery callback runs;
/// by the time a `RawFrame` exists the pixels have been copied into `data`,
/// so it can be cloned cheaply (idle re-send) and handed across stages.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data:   bytes::Bytes,
    pub width:  u32,
    pub height: u32,
    /// Row stride in bytes (≥ width × bytes-per-pixel).
    pub stride: u32,
    pub format: PixelFormat,
    /// Monotonic capture timestamp in nanoseconds.
    pub timestamp_ns: u64,
}

impl RawFrame {
    /// Copy of this frame carrying a fresh capture timestamp.
    ///
    /// Used by the idle re-send path so the client's staleness check sees a
    /// current frame even when the screen content has not changed.
    pub fn restamped(&self, timestamp_ns: u64) -> Self {
        let mut frame = self.clone();
        frame.timestamp_ns = timestamp_ns;
        frame
    }
}

// ── EncodedFrame ──────────────────────────────────────────────────────────────

/// One encoded HEVC access unit (Annex-B byte stream).
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: bytes::Bytes,
    /// Capture timestamp carried through the encoder, nanoseconds.
    pub timestamp_ns: u64,
    pub is_keyframe: bool,
}

// ── Rotation ──────────────────────────────────────────────────────────────────

/// Display rotation in 90° steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

// ── DisplayConfig ─────────────────────────────────────────────────────────────

/// Presented display geometry, sent once on connect and again on rotation
/// changes. The client keeps its decoder configured for the most recently
/// received width × height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width:    u32,
    pub height:   u32,
    pub rotation: Rotation,
}

impl DisplayConfig {
    pub fn new(width: u32, height: u32, rotation: Rotation) -> Self {
        Self { width, height, rotation }
    }
}

impl std::fmt::Display for DisplayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{} rot={}°", self.width, self.height, self.rotation.degrees())
    }
}

// ── Touch ─────────────────────────────────────────────────────────────────────

/// Phase of a touch contact. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPhase {
    Down = 0,
    Move = 1,
    Up   = 2,
}

impl TouchPhase {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Down),
            1 => Some(Self::Move),
            2 => Some(Self::Up),
            _ => None,
        }
    }
}

/// A touch sample with coordinates normalized to the presented display,
/// origin top-left. One or two contacts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchSample {
    pub x: f32,
    pub y: f32,
    /// Second contact, present iff `pointer_count() == 2`.
    pub second: Option<(f32, f32)>,
    pub phase: TouchPhase,
}

impl TouchSample {
    pub fn single(x: f32, y: f32, phase: TouchPhase) -> Self {
        Self { x, y, second: None, phase }
    }

    pub fn dual(x: f32, y: f32, x2: f32, y2: f32, phase: TouchPhase) -> Self {
        Self { x, y, second: Some((x2, y2)), phase }
    }

    pub fn pointer_count(&self) -> u8 {
        if self.second.is_some() { 2 } else { 1 }
    }
}

// ── DisplayBounds ─────────────────────────────────────────────────────────────

/// Screen-pixel rectangle of the streamed display inside the host desktop.
/// Used to denormalize touch coordinates and to map pointer positions into
/// the platform's absolute coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayBounds {
    pub x:      i32,
    pub y:      i32,
    pub width:  u32,
    pub height: u32,
}

impl DisplayBounds {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Project a [0, 1] coordinate pair into screen pixels:
    /// `origin + n × dimension`. Kept fractional so distance math stays
    /// exact; emission points truncate at the edge.
    pub fn project(&self, nx: f32, ny: f32) -> (f32, f32) {
        (
            self.x as f32 + nx * self.width as f32,
            self.y as f32 + ny * self.height as f32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_degrees_roundtrip() {
        for deg in [0, 90, 180, 270] {
            assert_eq!(Rotation::from_degrees(deg).unwrap().degrees(), deg);
        }
        assert!(Rotation::from_degrees(45).is_none());
        assert!(Rotation::from_degrees(-90).is_none());
    }

    #[test]
    fn project_scales_to_the_display() {
        let bounds = DisplayBounds::new(0, 0, 1920, 1080);
        let (sx, sy) = bounds.project(0.5, 0.5);
        assert_eq!((sx, sy), (960.0, 540.0));
        // Fractional pixels survive projection; callers truncate on emit.
        let (sx, sy) = bounds.project(0.505, 0.505);
        assert!((sx - 969.6).abs() < 1e-3, "sx={sx}");
        assert!((sy - 545.4).abs() < 1e-3, "sy={sy}");
    }

    #[test]
    fn project_applies_origin() {
        let bounds = DisplayBounds::new(1920, 0, 1920, 1080);
        assert_eq!(bounds.project(0.0, 0.0), (1920.0, 0.0));
        assert_eq!(bounds.project(1.0, 1.0), (3840.0, 1080.0));
    }

    #[test]
    fn touch_pointer_count() {
        assert_eq!(TouchSample::single(0.1, 0.2, TouchPhase::Down).pointer_count(), 1);
        assert_eq!(TouchSample::dual(0.1, 0.2, 0.3, 0.4, TouchPhase::Move).pointer_count(), 2);
    }
}
