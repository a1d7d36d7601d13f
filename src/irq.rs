//! IRQ sink interface for chips with interrupt outputs (OPL3, OPM, Y8950).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receiver for a chip's interrupt pin.
pub trait IrqSink: Send {
    /// Assert the interrupt line.
    fn set(&mut self);
    /// Release the interrupt line.
    fn reset(&mut self);
}

/// A shareable IRQ line backed by an atomic flag.
///
/// Hand a clone to the chip as its sink and poll `pending()` from the
/// interrupt controller side.
#[derive(Debug, Clone, Default)]
pub struct IrqLine {
    pending: Arc<AtomicBool>,
}

impl IrqLine {
    /// A released line.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the line is asserted.
    pub fn pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl IrqSink for IrqLine {
    fn set(&mut self) {
        self.pending.store(true, Ordering::Release);
    }

    fn reset(&mut self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// Sink that ignores the interrupt pin (chip wired to nothing).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullIrq;

impl IrqSink for NullIrq {
    fn set(&mut self) {}
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_follows_sink() {
        let line = IrqLine::new();
        let mut sink = line.clone();
        assert!(!line.pending());
        sink.set();
        assert!(line.pending());
        sink.reset();
        assert!(!line.pending());
    }
}
