//! Frame and Slot Layout
//!
//! Every Opal value is a dual word: a value word and a type-tag word that
//! always travel together. A function frame is an ordered run of parameter
//! slots followed by local-variable slots, each one dual word wide.
//!
//! [`FrameLayout`] is the declaring state of the per-function lifecycle.
//! It is consumed when an assembler is constructed, so declaring a slot
//! after the prologue is unrepresentable rather than merely checked.
//!
//! [`Abi`] captures what the two encoders share about frame addressing:
//! word and slot widths, the slot-to-offset mapping, and the signed-8-bit
//! displacement threshold.

use crate::region::WordWidth;
use crate::{BackendError, Result};

/// Parameter and variable slots of one function, declared before any code
/// is emitted. Parameters first, left to right, then variables; the
/// ordering fixes slot numbering and with it the caller/callee argument
/// contract.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    parameters: usize,
    variables: usize,
}

impl FrameLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next parameter, to the right of the previous one.
    /// Returns the slot used to address it inside the function.
    pub fn add_parameter(&mut self) -> usize {
        assert_eq!(
            self.variables, 0,
            "parameters must be declared before variables"
        );
        let slot = self.parameters;
        self.parameters += 1;
        slot
    }

    /// Declare the next local variable. Returns its slot.
    pub fn add_variable(&mut self) -> usize {
        let slot = self.parameters + self.variables;
        self.variables += 1;
        slot
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters
    }

    pub fn variable_count(&self) -> usize {
        self.variables
    }

    /// One more than the highest declared slot.
    pub fn slot_count(&self) -> usize {
        self.parameters + self.variables
    }
}

/// Frame-addressing facts one encoder instantiates.
#[derive(Debug, Clone, Copy)]
pub struct Abi {
    pub word: WordWidth,
}

impl Abi {
    pub const X86: Abi = Abi { word: WordWidth::W32 };
    pub const X64: Abi = Abi { word: WordWidth::W64 };

    /// Machine word size in bytes.
    #[inline]
    pub fn word_size(self) -> i64 {
        self.word.size() as i64
    }

    /// Width of one dual-word slot: value word plus type word.
    #[inline]
    pub fn slot_width(self) -> i64 {
        self.word_size() * 2
    }

    /// Frame-pointer-relative offset of a slot's value word. Parameters
    /// sit above the saved frame pointer and return address, variables
    /// below; the type word is one machine word above the value word.
    ///
    /// Offsets outside the signed 32-bit displacement range are an
    /// unsupported program shape, not an encoder bug: a function would
    /// need hundreds of millions of slots to get there, but such input is
    /// rejected with a diagnostic rather than an assertion.
    pub fn frame_offset(self, frame: &FrameLayout, slot: usize) -> Result<i32> {
        let parameters = frame.parameter_count() as i64;
        let slot = slot as i64;
        let offset = if slot < parameters {
            (parameters - slot) * self.slot_width()
        } else {
            (parameters - slot - 1) * self.slot_width()
        };
        narrow_offset(offset)
    }

    /// Whether a displacement fits the short (signed 8-bit) encoding.
    #[inline]
    pub fn fits_disp8(value: i64) -> bool {
        (-128..=127).contains(&value)
    }
}

pub(crate) fn narrow_offset(offset: i64) -> Result<i32> {
    i32::try_from(offset).map_err(|_| BackendError::FrameOffsetTooLarge { offset })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_number_left_to_right() {
        let mut frame = FrameLayout::new();
        assert_eq!(frame.add_parameter(), 0);
        assert_eq!(frame.add_parameter(), 1);
        assert_eq!(frame.add_variable(), 2);
        assert_eq!(frame.add_variable(), 3);
        assert_eq!(frame.slot_count(), 4);
        assert_eq!(frame.parameter_count(), 2);
        assert_eq!(frame.variable_count(), 2);
    }

    #[test]
    #[should_panic(expected = "before variables")]
    fn parameter_after_variable_is_fatal() {
        let mut frame = FrameLayout::new();
        frame.add_variable();
        frame.add_parameter();
    }

    #[test]
    fn x86_frame_offsets() {
        let mut frame = FrameLayout::new();
        let p0 = frame.add_parameter();
        let p1 = frame.add_parameter();
        let v0 = frame.add_variable();
        let v1 = frame.add_variable();

        let abi = Abi::X86;
        assert_eq!(abi.frame_offset(&frame, p0).unwrap(), 16);
        assert_eq!(abi.frame_offset(&frame, p1).unwrap(), 8);
        assert_eq!(abi.frame_offset(&frame, v0).unwrap(), -8);
        assert_eq!(abi.frame_offset(&frame, v1).unwrap(), -16);
    }

    #[test]
    fn x64_frame_offsets() {
        let mut frame = FrameLayout::new();
        let p0 = frame.add_parameter();
        let v0 = frame.add_variable();

        let abi = Abi::X64;
        assert_eq!(abi.frame_offset(&frame, p0).unwrap(), 16);
        assert_eq!(abi.frame_offset(&frame, v0).unwrap(), -16);
    }

    #[test]
    fn disp8_threshold() {
        assert!(Abi::fits_disp8(127));
        assert!(Abi::fits_disp8(-128));
        assert!(!Abi::fits_disp8(128));
        assert!(!Abi::fits_disp8(-129));
    }
}
