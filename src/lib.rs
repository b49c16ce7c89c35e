//! # Opal Native Code Generation Backend
//!
//! The instruction-emission and relocation substrate of the Opal
//! ahead-of-time compiler. The semantic layer drives an [`Assembler`]
//! per function body; the backend turns that call sequence into exact
//! machine bytes for a 32-bit or 64-bit x86 target, deferring every
//! address it cannot know yet through placeholders that a single
//! resolution pass patches once layout is final.
//!
//! ## Architecture
//!
//! ```text
//! semantic layer → Assembler (x86 | x64) → Region bytes + relocations
//!                                             → linker layout → resolve
//!                                               → PE/ELF writers
//! ```
//!
//! Every Opal value is a *dual word* — a value word and a type-tag word
//! that move together through the accumulator, the operand stack and
//! frame slots. The two encoders keep that invariant across two ABIs;
//! everything above them is ISA-neutral.
//!
//! ## Modules
//!
//! - [`region`]: relocatable regions, placeholders, deferred tokens
//! - [`jump`]: branch-patching tokens
//! - [`frame`]: frame/slot layout and the shared ABI descriptor
//! - [`assembler`]: the ISA-neutral operation surface
//! - [`unwind`]: exception handler record layout
//! - [`x86`], [`x64`]: the concrete encoders
//!
//! ## Two-phase protocol
//!
//! Emission is append-only and single-threaded per region; nothing reads
//! back emitted bytes except through tokens and placeholders. Once every
//! function and data blob is emitted, the linker assigns each region its
//! final addresses and [`RegionArena::resolve`] patches every relocation
//! exactly once. Asking for an address before then is an error, not
//! undefined behavior.

pub mod assembler;
pub mod frame;
pub mod jump;
pub mod region;
pub mod unwind;
pub mod x64;
pub mod x86;

use thiserror::Error;

pub use assembler::Assembler;
pub use frame::{Abi, FrameLayout};
pub use jump::JumpToken;
pub use region::{
    IntToken, LongToken, NumberToken, PatchWidth, Placeholder, PlaceholderCell, Region,
    RegionArena, RegionId, RegionKind, RelocMode, RelocTarget, Relocation, WordToken, WordWidth,
};
pub use unwind::HandlerRecord;
pub use x64::X64Assembler;
pub use x86::X86Assembler;

/// Backend failure conditions.
///
/// These are the *unsupported program shape* and *phase misuse* cases a
/// caller can meet with legitimate input — an offset beyond the encodable
/// displacement range, an address queried before layout. Violations of
/// internal invariants (slots declared after sealing, a second jump-token
/// destination, a value that does not fit the requested write width) are
/// encoder or caller bugs and fail fast with a panic instead.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("frame offset {offset} does not fit in a signed 32-bit displacement")]
    FrameOffsetTooLarge { offset: i64 },

    #[error("field offset {offset} does not fit in a signed 32-bit displacement")]
    FieldOffsetTooLarge { offset: i64 },

    #[error("operand stack depth {depth} does not fit the encodable displacement range")]
    StackDepthTooLarge { depth: usize },

    #[error("immediate {value} does not fit in a 32-bit operand")]
    ImmediateTooWide { value: i64 },

    #[error("region {region:?} was never assigned a memory address")]
    UnassignedMemoryLocation { region: RegionId },

    #[error("region {region:?} was never assigned a file offset")]
    UnassignedFileLocation { region: RegionId },

    #[error("placeholder cell was never bound to a location")]
    UnboundPlaceholderCell,

    #[error("relocations were already resolved")]
    AlreadyResolved,
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
