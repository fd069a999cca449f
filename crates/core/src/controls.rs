//! UVC Processing Unit / Extension Unit control bridge.
//!
//! The USB layer decodes SET_CUR requests and calls a [`ControlHandler`]
//! injected at construction. [`IspControlBridge`] maps the selectors this
//! camera advertises onto an [`IspBackend`]:
//!
//! | Unit | Selector | Control |
//! |------|----------|---------|
//! | PU | `0x02` | Brightness |
//! | PU | `0x03` | Contrast |
//! | PU | `0x06` | Hue |
//! | PU | `0x07` | Saturation |
//! | PU | `0x0A` | White-balance temperature, used as ISP profile select |
//! | XU | `0x01` | ISP profile select |

use crate::error::Result;

pub const PU_BRIGHTNESS: u8 = 0x02;
pub const PU_CONTRAST: u8 = 0x03;
pub const PU_HUE: u8 = 0x06;
pub const PU_SATURATION: u8 = 0x07;
pub const PU_WHITE_BALANCE_TEMPERATURE: u8 = 0x0A;
pub const XU_ISP_PROFILE: u8 = 0x01;

/// Number of ISP color profiles (0 = tungsten .. 5 = shade).
pub const ISP_PROFILE_COUNT: u8 = 6;

/// A single ISP adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IspControl {
    Brightness(i16),
    Contrast(i16),
    Hue(i16),
    Saturation(i16),
    /// Color profile (CCM, white balance, gamma, sharpen) by index.
    Profile(u8),
}

/// Image signal processor that applies controls.
pub trait IspBackend: Send {
    fn apply(&mut self, control: IspControl) -> Result<()>;
}

/// Callbacks for host-issued control changes.
pub trait ControlHandler: Send {
    fn on_processing_unit(&mut self, selector: u8, value: i16);
    fn on_extension_unit(&mut self, selector: u8, value: u8);
}

/// Routes PU/XU requests to an [`IspBackend`].
///
/// Unknown selectors and out-of-range profiles are logged and ignored;
/// the host sees the request succeed either way.
pub struct IspControlBridge<B> {
    backend: B,
}

impl<B: IspBackend> IspControlBridge<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Decode a processing-unit request.
    pub fn decode_processing_unit(selector: u8, value: i16) -> Option<IspControl> {
        match selector {
            PU_BRIGHTNESS => Some(IspControl::Brightness(value)),
            PU_CONTRAST => Some(IspControl::Contrast(value)),
            PU_HUE => Some(IspControl::Hue(value)),
            PU_SATURATION => Some(IspControl::Saturation(value)),
            PU_WHITE_BALANCE_TEMPERATURE => u8::try_from(value).ok().map(IspControl::Profile),
            _ => None,
        }
    }

    fn apply(&mut self, control: IspControl) {
        if let IspControl::Profile(index) = control
            && index >= ISP_PROFILE_COUNT
        {
            tracing::warn!(index, "ISP profile out of range");
            return;
        }
        match self.backend.apply(control) {
            Ok(()) => tracing::info!(?control, "ISP control applied"),
            Err(e) => tracing::warn!(?control, error = %e, "ISP control failed"),
        }
    }
}

impl<B: IspBackend> ControlHandler for IspControlBridge<B> {
    fn on_processing_unit(&mut self, selector: u8, value: i16) {
        match Self::decode_processing_unit(selector, value) {
            Some(control) => self.apply(control),
            None => tracing::warn!(
                selector = format_args!("{:#04x}", selector),
                value,
                "unsupported PU control"
            ),
        }
    }

    fn on_extension_unit(&mut self, selector: u8, value: u8) {
        if selector == XU_ISP_PROFILE {
            self.apply(IspControl::Profile(value));
        } else {
            tracing::warn!(
                selector = format_args!("{:#04x}", selector),
                "unsupported XU control"
            );
        }
    }
}
