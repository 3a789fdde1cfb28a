/// Power rail / clock gating states, coarsest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    On,
    ClockOn,
    ClockOff,
    Off,
}

/// Clock and power control for the device. Transitions are idempotent and
/// synchronous: when `set_power_state` returns the device is in the requested
/// state.
pub trait PowerControl: Send + Sync {
    fn set_power_state(&self, state: PowerState);
}
