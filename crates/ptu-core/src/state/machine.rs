//! Device states, flash loaders and the context tracking both.

use std::fmt;

use crate::events::{PtuEvent, PtuObserver};

/// Where the device is and what is executing on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceState {
    /// Unknown; every failed transition lands here.
    Invalid,
    FwBoot,
    FwScanning,
    FwDeepSleep,
    FwTest,
    FwDeepStandby,
    /// Touch processor running the secondary (programmer) image.
    FwProgrammerImage,
    /// Request-only target: any RAM-exec system mode will do.
    FwSysModeAny,
    Bootloader,
    AuxUtilityImage,
    AuxProgrammerImage,
    /// Not yet talked to.
    #[default]
    Default,
}

impl DeviceState {
    pub fn label(self) -> &'static str {
        match self {
            DeviceState::Invalid => "Invalid device state",
            DeviceState::FwBoot => "Touch Processor, Firmware Exec, Boot Mode",
            DeviceState::FwScanning => "Touch Processor, Firmware Exec, Scanning Mode",
            DeviceState::FwDeepSleep => "Touch Processor, Firmware Exec, Deep Sleep Mode",
            DeviceState::FwTest => "Touch Processor, Firmware Exec, Test Mode",
            DeviceState::FwDeepStandby => "Touch Processor, Firmware Exec, Deep Standby Mode",
            DeviceState::FwProgrammerImage => {
                "Touch Processor, Firmware Exec, Programmer Image Mode"
            }
            DeviceState::FwSysModeAny => "Touch Processor, Firmware Exec (any System Mode)",
            DeviceState::Bootloader => "Touch Processor, Bootloader Exec",
            DeviceState::AuxUtilityImage => "AUX MCU, Firmware Exec, Utility Image",
            DeviceState::AuxProgrammerImage => "AUX MCU, Firmware Exec, Programmer Image",
            DeviceState::Default => "Default device state (not ready for communication)",
        }
    }

    /// Whether the state is reached on the auxiliary processor.
    pub fn is_aux(self) -> bool {
        matches!(
            self,
            DeviceState::AuxUtilityImage | DeviceState::AuxProgrammerImage
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Firmware component able to write the device's flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlashLoader {
    #[default]
    None,
    /// Secondary image on the touch processor, driven over PIP3.
    TouchProgrammerImage,
    /// ROM boot loader, driven over PIP2.
    RomBootloader,
    /// Programmer image on the auxiliary processor, driven over PIP3.
    AuxProgrammerImage,
}

impl FlashLoader {
    /// Device state the loader runs in.
    pub fn device_state(self) -> Option<DeviceState> {
        match self {
            FlashLoader::None => None,
            FlashLoader::TouchProgrammerImage => Some(DeviceState::FwProgrammerImage),
            FlashLoader::RomBootloader => Some(DeviceState::Bootloader),
            FlashLoader::AuxProgrammerImage => Some(DeviceState::AuxProgrammerImage),
        }
    }
}

impl fmt::Display for FlashLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashLoader::None => write!(f, "No active flash loader"),
            FlashLoader::TouchProgrammerImage => write!(f, "Touch Programmer Image"),
            FlashLoader::RomBootloader => write!(f, "PIP2 ROM Bootloader"),
            FlashLoader::AuxProgrammerImage => write!(f, "AUX MCU Programmer Image"),
        }
    }
}

/// Current device state and active flash loader.
#[derive(Debug, Default)]
pub struct StateContext {
    state: DeviceState,
    loader: FlashLoader,
}

impl StateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn loader(&self) -> FlashLoader {
        self.loader
    }

    /// Transition to a new state, telling the observer when it changes.
    pub fn goto_state<O: PtuObserver + ?Sized>(&mut self, new_state: DeviceState, observer: &O) {
        if new_state == self.state {
            return;
        }
        tracing::debug!(from = %self.state, to = %new_state, "State transition");
        observer.on_event(&PtuEvent::StateChanged {
            from: self.state,
            to: new_state,
        });
        self.state = new_state;
    }

    pub fn set_loader<O: PtuObserver + ?Sized>(&mut self, loader: FlashLoader, observer: &O) {
        if loader == self.loader {
            return;
        }
        tracing::debug!(from = %self.loader, to = %loader, "Flash loader change");
        observer.on_event(&PtuEvent::LoaderChanged {
            from: self.loader,
            to: loader,
        });
        self.loader = loader;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;

    #[test]
    fn test_context_starts_at_default() {
        let ctx = StateContext::new();
        assert_eq!(ctx.state(), DeviceState::Default);
        assert_eq!(ctx.loader(), FlashLoader::None);
    }

    #[test]
    fn test_goto_state_and_loader() {
        let mut ctx = StateContext::new();
        ctx.goto_state(DeviceState::FwScanning, &NullObserver);
        ctx.set_loader(FlashLoader::RomBootloader, &NullObserver);
        assert_eq!(ctx.state(), DeviceState::FwScanning);
        assert_eq!(
            ctx.loader().device_state(),
            Some(DeviceState::Bootloader)
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(
            DeviceState::Bootloader.to_string(),
            "Touch Processor, Bootloader Exec"
        );
        assert!(DeviceState::AuxProgrammerImage.is_aux());
        assert!(!DeviceState::FwProgrammerImage.is_aux());
    }
}
