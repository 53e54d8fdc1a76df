/// Sticky fault flag: only the first fault a component sees is reported
/// outward, later ones are logged by the caller and dropped.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    tripped: bool,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once, for the first fault.
    pub fn trip(&mut self) -> bool {
        !std::mem::replace(&mut self.tripped, true)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }
}
