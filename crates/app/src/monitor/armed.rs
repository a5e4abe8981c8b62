use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Shared arm/disarm switch.
///
/// Written by the local control routes and by authorized remote commands,
/// read by the alert gate on every tick. Concurrent writers race and the
/// last write wins; readers observe a change no later than their next load.
#[derive(Clone, Debug)]
pub struct ArmedState(Arc<AtomicBool>);

impl ArmedState {
    pub fn new(armed: bool) -> Self {
        Self(Arc::new(AtomicBool::new(armed)))
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Set the mode, returning the previous value.
    pub fn set(&self, armed: bool) -> bool {
        self.0.swap(armed, Ordering::AcqRel)
    }

    pub fn arm(&self) -> bool {
        self.set(true)
    }

    pub fn disarm(&self) -> bool {
        self.set(false)
    }

    pub fn label(&self) -> &'static str {
        if self.is_armed() { "ARMED" } else { "STANDBY" }
    }
}

impl Default for ArmedState {
    fn default() -> Self {
        Self::new(true)
    }
}
