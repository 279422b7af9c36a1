//! `inject` — pointer injection into the local desktop via `/dev/uinput`.
//!
//! # Requirements
//!
//! - Write access to `/dev/uinput` (root, or membership in the `input`
//!   group) and the `uinput` kernel module loaded.
//!
//! # Devices created
//!
//! - **sidecast Pointer** — absolute axes (0..65535 virtual desktop),
//!   BTN_LEFT/BTN_RIGHT, high-resolution wheels for scrolling.
//! - **sidecast Keyboard** — KEY_LEFTCTRL only, used as the zoom modifier.
//!
//! # Coordinate mapping
//!
//! The gesture machine hands over absolute screen pixels. They are projected
//! into the kernel's 0..65535 absolute space across the full desktop span,
//! which grows automatically when a streamed display sits beyond the primary
//! monitor (`set_display_bounds`).
//!
//! When uinput is unavailable every call degrades to a traced no-op, so a
//! host without injection privileges still streams.

use std::sync::Mutex;

use sidecast_core::backend::PointerSink;
use sidecast_core::DisplayBounds;
use tracing::{debug, trace, warn};

/// Upper bound of the kernel's absolute coordinate space.
const ABS_RANGE: i32 = 65_535;

/// Pixels of touch travel per full wheel detent.
const PIXELS_PER_DETENT: f32 = 15.0;

/// High-resolution wheel units per detent (evdev convention).
const HI_RES_PER_DETENT: f32 = 120.0;

/// Project a screen pixel coordinate into 0..65535 across `span` pixels.
fn to_abs(value: i32, span: u32) -> i32 {
    if span == 0 {
        return 0;
    }
    let scaled = value as i64 * ABS_RANGE as i64 / span.max(1) as i64;
    scaled.clamp(0, ABS_RANGE as i64) as i32
}

/// Convert a fractional pixel delta into whole hi-res wheel units, carrying
/// the remainder so slow momentum tails are not quantized away.
fn drain_wheel(accumulator: &mut f32, delta_px: f32) -> i32 {
    *accumulator += delta_px * HI_RES_PER_DETENT / PIXELS_PER_DETENT;
    let whole = accumulator.trunc();
    *accumulator -= whole;
    whole as i32
}

// ── UinputSink ────────────────────────────────────────────────────────────────

/// [`PointerSink`] backed by uinput virtual devices.
pub struct UinputSink {
    devices: Mutex<Option<imp::Devices>>,
    /// Full desktop span in pixels, used for the absolute projection.
    desktop: Mutex<(u32, u32)>,
    /// Fractional hi-res wheel remainders (horizontal, vertical).
    wheel_accum: Mutex<(f32, f32)>,
}

impl UinputSink {
    /// Open the virtual devices. If uinput is not accessible the sink is
    /// created in no-op mode with a warning — injection failures never stop
    /// the stream.
    pub fn new(desktop_width: u32, desktop_height: u32) -> Self {
        let devices = match imp::Devices::open() {
            Ok(devices) => {
                debug!("uinput injector ready (sidecast Pointer + sidecast Keyboard)");
                Some(devices)
            }
            Err(e) => {
                warn!(
                    "uinput unavailable — pointer injection disabled ({e}). \
                     Try: sudo modprobe uinput && sudo chmod 0660 /dev/uinput"
                );
                None
            }
        };
        Self {
            devices: Mutex::new(devices),
            desktop: Mutex::new((desktop_width, desktop_height)),
            wheel_accum: Mutex::new((0.0, 0.0)),
        }
    }

    fn with_devices(&self, f: impl FnOnce(&mut imp::Devices) -> anyhow::Result<()>) {
        let mut guard = self.devices.lock().unwrap();
        if let Some(devices) = guard.as_mut() {
            if let Err(e) = f(devices) {
                debug!("uinput emit failed: {e}");
            }
        }
    }

    fn abs_position(&self, x: i32, y: i32) -> (i32, i32) {
        let (w, h) = *self.desktop.lock().unwrap();
        (to_abs(x, w), to_abs(y, h))
    }
}

impl PointerSink for UinputSink {
    fn set_display_bounds(&self, bounds: DisplayBounds) {
        let mut desktop = self.desktop.lock().unwrap();
        let right = (bounds.x + bounds.width as i32).max(0) as u32;
        let bottom = (bounds.y + bounds.height as i32).max(0) as u32;
        desktop.0 = desktop.0.max(right);
        desktop.1 = desktop.1.max(bottom);
        debug!(
            "display bounds {:?}; absolute space spans {}×{} px",
            bounds, desktop.0, desktop.1
        );
    }

    fn pointer_move(&self, x: i32, y: i32) {
        let (ax, ay) = self.abs_position(x, y);
        trace!("move ({x},{y}) -> abs ({ax},{ay})");
        self.with_devices(|d| d.move_abs(ax, ay));
    }

    fn left_down(&self) {
        self.with_devices(|d| d.button(imp::Button::Left, true));
    }

    fn left_up(&self) {
        self.with_devices(|d| d.button(imp::Button::Left, false));
    }

    fn right_down(&self) {
        self.with_devices(|d| d.button(imp::Button::Right, true));
    }

    fn right_up(&self) {
        self.with_devices(|d| d.button(imp::Button::Right, false));
    }

    fn scroll(&self, x: i32, y: i32, dx: f32, dy: f32) {
        let (ax, ay) = self.abs_position(x, y);
        let (hx, hy) = {
            let mut accum = self.wheel_accum.lock().unwrap();
            (drain_wheel(&mut accum.0, dx), drain_wheel(&mut accum.1, dy))
        };
        if hx == 0 && hy == 0 {
            return;
        }
        // Wheel-down moves content up: vertical sign flips.
        self.with_devices(|d| d.scroll_at(ax, ay, hx, -hy));
    }

    fn double_click(&self, x: i32, y: i32) {
        let (ax, ay) = self.abs_position(x, y);
        self.with_devices(|d| {
            d.move_abs(ax, ay)?;
            d.button(imp::Button::Left, true)?;
            d.button(imp::Button::Left, false)?;
            d.button(imp::Button::Left, true)?;
            d.button(imp::Button::Left, false)
        });
    }

    fn zoom(&self, x: i32, y: i32, delta: i32) {
        if delta == 0 {
            return;
        }
        let (ax, ay) = self.abs_position(x, y);
        // Ctrl + wheel is the universal zoom; one detent per ~10 px of pinch.
        let detents = (delta as f32 / 10.0).round() as i32;
        let detents = if detents == 0 { delta.signum() } else { detents };
        self.with_devices(|d| d.zoom_at(ax, ay, detents));
    }
}

// ── Linux implementation ──────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod imp {
    use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
    use evdev::{
        AbsInfo, AbsoluteAxisType, AttributeSet, EventType, InputEvent, Key, RelativeAxisType,
        UinputAbsSetup,
    };

    use super::{ABS_RANGE, HI_RES_PER_DETENT};

    #[derive(Clone, Copy)]
    pub(super) enum Button {
        Left,
        Right,
    }

    pub(super) struct Devices {
        pointer:  VirtualDevice,
        keyboard: VirtualDevice,
    }

    impl Devices {
        pub(super) fn open() -> anyhow::Result<Self> {
            let mut buttons = AttributeSet::<Key>::new();
            buttons.insert(Key::BTN_LEFT);
            buttons.insert(Key::BTN_RIGHT);

            let mut wheels = AttributeSet::<RelativeAxisType>::new();
            wheels.insert(RelativeAxisType::REL_WHEEL);
            wheels.insert(RelativeAxisType::REL_WHEEL_HI_RES);
            wheels.insert(RelativeAxisType::REL_HWHEEL);
            wheels.insert(RelativeAxisType::REL_HWHEEL_HI_RES);

            let abs = AbsInfo::new(0, 0, ABS_RANGE, 0, 0, 0);
            let pointer = VirtualDeviceBuilder::new()?
                .name("sidecast Pointer")
                .with_keys(&buttons)?
                .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisType::ABS_X, abs))?
                .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisType::ABS_Y, abs))?
                .with_relative_axes(&wheels)?
                .build()?;

            let mut modifier = AttributeSet::<Key>::new();
            modifier.insert(Key::KEY_LEFTCTRL);
            let keyboard = VirtualDeviceBuilder::new()?
                .name("sidecast Keyboard")
                .with_keys(&modifier)?
                .build()?;

            Ok(Self { pointer, keyboard })
        }

        pub(super) fn move_abs(&mut self, ax: i32, ay: i32) -> anyhow::Result<()> {
            self.pointer.emit(&[
                InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_X.0, ax),
                InputEvent::new(EventType::ABSOLUTE, AbsoluteAxisType::ABS_Y.0, ay),
                InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            ])?;
            Ok(())
        }

        pub(super) fn button(&mut self, button: Button, pressed: bool) -> anyhow::Result<()> {
            let key = match button {
                Button::Left => Key::BTN_LEFT,
                Button::Right => Key::BTN_RIGHT,
            };
            self.pointer.emit(&[
                InputEvent::new(EventType::KEY, key.code(), pressed as i32),
                InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            ])?;
            Ok(())
        }

        pub(super) fn scroll_at(
            &mut self,
            ax: i32,
            ay: i32,
            hi_res_x: i32,
            hi_res_y: i32,
        ) -> anyhow::Result<()> {
            self.move_abs(ax, ay)?;
            let detent = HI_RES_PER_DETENT as i32;
            let mut events = Vec::with_capacity(5);
            if hi_res_y != 0 {
                events.push(InputEvent::new(
                    EventType::RELATIVE,
                    RelativeAxisType::REL_WHEEL_HI_RES.0,
                    hi_res_y,
                ));
                if hi_res_y / detent != 0 {
                    events.push(InputEvent::new(
                        EventType::RELATIVE,
                        RelativeAxisType::REL_WHEEL.0,
                        hi_res_y / detent,
                    ));
                }
            }
            if hi_res_x != 0 {
                events.push(InputEvent::new(
                    EventType::RELATIVE,
                    RelativeAxisType::REL_HWHEEL_HI_RES.0,
                    hi_res_x,
                ));
                if hi_res_x / detent != 0 {
                    events.push(InputEvent::new(
                        EventType::RELATIVE,
                        RelativeAxisType::REL_HWHEEL.0,
                        hi_res_x / detent,
                    ));
                }
            }
            events.push(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
            self.pointer.emit(&events)?;
            Ok(())
        }

        pub(super) fn zoom_at(&mut self, ax: i32, ay: i32, detents: i32) -> anyhow::Result<()> {
            self.move_abs(ax, ay)?;
            self.keyboard.emit(&[
                InputEvent::new(EventType::KEY, Key::KEY_LEFTCTRL.code(), 1),
                InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            ])?;
            self.pointer.emit(&[
                InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_WHEEL.0, detents),
                InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            ])?;
            self.keyboard.emit(&[
                InputEvent::new(EventType::KEY, Key::KEY_LEFTCTRL.code(), 0),
                InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            ])?;
            Ok(())
        }
    }
}

// ── Non-Linux stub ────────────────────────────────────────────────────────────

#[cfg(not(target_os = "linux"))]
mod imp {
    #[derive(Clone, Copy)]
    pub(super) enum Button {
        Left,
        Right,
    }

    pub(super) struct Devices;

    impl Devices {
        pub(super) fn open() -> anyhow::Result<Self> {
            anyhow::bail!("uinput injection is Linux-only")
        }

        pub(super) fn move_abs(&mut self, _ax: i32, _ay: i32) -> anyhow::Result<()> {
            Ok(())
        }
        pub(super) fn button(&mut self, _b: Button, _p: bool) -> anyhow::Result<()> {
            Ok(())
        }
        pub(super) fn scroll_at(&mut self, _ax: i32, _ay: i32, _x: i32, _y: i32) -> anyhow::Result<()> {
            Ok(())
        }
        pub(super) fn zoom_at(&mut self, _ax: i32, _ay: i32, _d: i32) -> anyhow::Result<()> {
            Ok(())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
