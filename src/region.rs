//! Relocatable Regions
//!
//! A [`Region`] is one contiguous chunk of code or data under construction:
//! an append-only byte buffer plus the set of relocations that must be
//! patched once every region has been assigned its final address.
//!
//! Regions live in a [`RegionArena`] and are addressed by [`RegionId`];
//! a [`Placeholder`] is a `(region, offset)` pair naming a byte position
//! whose final address is not known until layout. Emission and resolution
//! form a strict two-phase protocol:
//!
//! ```text
//! emit (append-only, record relocations)
//!   → assign_addresses (linker layout, exactly once per region)
//!     → resolve (patch every relocation exactly once)
//! ```
//!
//! Deferred tokens ([`WordToken`], [`IntToken`], [`LongToken`]) are the
//! exception to append-only writing: they reserve a zeroed slot whose value
//! the writer itself supplies later, for lengths and distances computed
//! purely from already-emitted bytes. They are not relocations and do not
//! wait for layout.

use std::cell::Cell;
use std::rc::Rc;

use log::{debug, trace};

use crate::{BackendError, Result};

/// Width of a machine word in a region, fixing the patch width of
/// address-sized fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    W32,
    W64,
}

impl WordWidth {
    /// Size of one word in bytes.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            WordWidth::W32 => 4,
            WordWidth::W64 => 8,
        }
    }
}

/// Section category a region belongs to, as consumed by the
/// executable-format writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Code,
    ReadOnlyData,
    Data,
}

/// Handle of a region within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u32);

impl RegionId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A byte position whose final address is assigned during layout.
///
/// Placeholders are plain values; arithmetic between two placeholders is
/// only meaningful when both live in the same region, where their relative
/// distance is invariant under layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placeholder {
    region: RegionId,
    offset: u64,
}

impl Placeholder {
    pub(crate) fn new(region: RegionId, offset: u64) -> Self {
        Self { region, offset }
    }

    #[inline]
    pub fn region(&self) -> RegionId {
        self.region
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The placeholder `amount` bytes further into the same region.
    pub fn increment(&self, amount: u64) -> Placeholder {
        Placeholder {
            region: self.region,
            offset: self.offset + amount,
        }
    }

    /// Distance in bytes from `other` to `self`.
    ///
    /// Both placeholders must name positions in the same region; the
    /// distance between positions of different regions is unknown until
    /// layout, and asking for it is an encoder bug.
    pub fn distance_from(&self, other: Placeholder) -> i64 {
        assert_eq!(
            self.region, other.region,
            "placeholder distance across regions is undefined before layout"
        );
        self.offset as i64 - other.offset as i64
    }
}

/// A shared, late-bound placeholder.
///
/// Created empty and bound exactly once, typically for positions that do
/// not exist yet when the bytes referencing them are written: exception
/// handler entry points, forward references to functions not yet emitted.
/// All clones observe the binding.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderCell {
    inner: Rc<Cell<Option<Placeholder>>>,
}

impl PlaceholderCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the cell. Binding twice is a caller bug.
    pub fn set(&self, location: Placeholder) {
        assert!(
            self.inner.get().is_none(),
            "placeholder cell bound more than once"
        );
        self.inner.set(Some(location));
    }

    pub fn get(&self) -> Option<Placeholder> {
        self.inner.get()
    }
}

/// How a relocated field is computed from the target's final address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocMode {
    /// Final virtual address of the target.
    Absolute,
    /// Address relative to the image base (PE-style RVAs).
    ImageRelative,
    /// Address relative to the target region's section base.
    SectionRelative,
    /// The target's offset within the output file.
    FileRelative,
    /// 32-bit displacement from the byte after the field to the target
    /// (RIP-relative operands). Always patched 4 bytes wide.
    Relative32,
}

/// Patch width of a relocated field, recorded explicitly per relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchWidth {
    W32,
    W64,
}

/// Target of a relocation: either a known position or a cell bound later.
#[derive(Debug, Clone)]
pub enum RelocTarget {
    Direct(Placeholder),
    Cell(PlaceholderCell),
}

impl RelocTarget {
    fn resolve(&self) -> Result<Placeholder> {
        match self {
            RelocTarget::Direct(p) => Ok(*p),
            RelocTarget::Cell(cell) => cell.get().ok_or(BackendError::UnboundPlaceholderCell),
        }
    }
}

/// One deferred patch: overwrite `width` bytes at `offset` with the value
/// of `target` computed per `mode`, once layout is known.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: u64,
    pub target: RelocTarget,
    pub mode: RelocMode,
    pub width: PatchWidth,
}

/// One contiguous chunk of code or data under construction.
#[derive(Debug)]
pub struct Region {
    id: RegionId,
    kind: RegionKind,
    word: WordWidth,
    buf: Vec<u8>,
    relocations: Vec<Relocation>,
    memory_location: Option<u64>,
    file_location: Option<u32>,
    section_base: u64,
    empty: bool,
}

impl Region {
    fn new(id: RegionId, kind: RegionKind, word: WordWidth) -> Self {
        Self {
            id,
            kind,
            word,
            buf: Vec::new(),
            relocations: Vec::new(),
            memory_location: None,
            file_location: None,
            section_base: 0,
            empty: false,
        }
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    pub fn word_width(&self) -> WordWidth {
        self.word
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Emitted bytes so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Relocations recorded so far.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Flag this region as elidable by the section writers.
    pub fn mark_empty(&mut self) {
        self.empty = true;
    }

    pub fn is_marked_empty(&self) -> bool {
        self.empty
    }

    /// Placeholder for the first byte of this region.
    pub fn base_location(&self) -> Placeholder {
        Placeholder::new(self.id, 0)
    }

    /// Placeholder for the current write position.
    pub fn current_location(&self) -> Placeholder {
        Placeholder::new(self.id, self.buf.len() as u64)
    }

    // ==================== Writing ====================

    pub fn write_u8(&mut self, data: u8) {
        self.buf.push(data);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Write one byte; the value must fit a byte, signed or unsigned.
    pub fn write_i8(&mut self, data: i64) {
        assert!(
            (-128..=255).contains(&data),
            "value {data} does not fit in one byte"
        );
        self.buf.push(data as u8);
    }

    pub fn write_i16(&mut self, data: i64) {
        assert!(
            i64::from(i16::MIN) <= data && data <= i64::from(u16::MAX),
            "value {data} does not fit in two bytes"
        );
        self.buf.extend_from_slice(&(data as u16).to_le_bytes());
    }

    pub fn write_i32(&mut self, data: i64) {
        assert!(
            i64::from(i32::MIN) <= data && data <= i64::from(u32::MAX),
            "value {data} does not fit in four bytes"
        );
        self.buf.extend_from_slice(&(data as u32).to_le_bytes());
    }

    pub fn write_i64(&mut self, data: i64) {
        self.buf.extend_from_slice(&data.to_le_bytes());
    }

    /// Write one machine word per this region's word width.
    pub fn write_word(&mut self, data: i64) {
        match self.word {
            WordWidth::W32 => self.write_i32(data),
            WordWidth::W64 => self.write_i64(data),
        }
    }

    /// Write `data` scaled by the word size, one word wide. Used for
    /// word-unit table layouts in runtime type structures.
    pub fn write_word_scaled(&mut self, data: i64) {
        match self.word {
            WordWidth::W32 => self.write_i32(data * 4),
            WordWidth::W64 => self.write_i64(data * 8),
        }
    }

    pub fn write_uleb(&mut self, mut data: u64) {
        loop {
            let mut byte = (data & 0x7f) as u8;
            data >>= 7;
            if data != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte);
            if data == 0 {
                break;
            }
        }
    }

    pub fn write_sleb(&mut self, mut data: i64) {
        loop {
            let byte = (data & 0x7f) as u8;
            data >>= 7;
            let done = (data == 0 && byte & 0x40 == 0) || (data == -1 && byte & 0x40 != 0);
            self.write_u8(if done { byte } else { byte | 0x80 });
            if done {
                break;
            }
        }
    }

    pub fn write_utf8_null_terminated(&mut self, data: &str) {
        self.write_bytes(data.as_bytes());
        self.write_u8(0);
    }

    /// Null-terminated UTF-8 padded to an even total length.
    pub fn write_utf8_null_terminated_even(&mut self, data: &str) {
        self.write_bytes(data.as_bytes());
        self.write_u8(0);
        if data.len() % 2 == 0 {
            self.write_u8(0);
        }
    }

    pub fn write_utf16_null_terminated(&mut self, data: &str) {
        for unit in data.encode_utf16() {
            self.buf.extend_from_slice(&unit.to_le_bytes());
        }
        self.write_i16(0);
    }

    /// Pad with `fill` until the cursor is aligned. Alignment is in [1,16].
    pub fn align(&mut self, alignment: usize, fill: u8) {
        assert!((1..=16).contains(&alignment));
        while self.buf.len() % alignment != 0 {
            self.write_u8(fill);
        }
    }

    // ==================== Deferred tokens ====================

    /// Reserve a zeroed 16-bit slot whose value is supplied later.
    pub fn insert_word_token(&mut self) -> WordToken {
        let token = WordToken {
            region: self.id,
            position: self.buf.len(),
        };
        self.write_i16(0);
        token
    }

    /// Reserve a zeroed 32-bit slot whose value is supplied later.
    pub fn insert_int_token(&mut self) -> IntToken {
        let token = IntToken {
            region: self.id,
            position: self.buf.len(),
            location: self.current_location(),
        };
        self.write_i32(0);
        token
    }

    /// Reserve a zeroed 64-bit slot whose value is supplied later.
    pub fn insert_long_token(&mut self) -> LongToken {
        let token = LongToken {
            region: self.id,
            position: self.buf.len(),
            location: self.current_location(),
        };
        self.write_i64(0);
        token
    }

    /// Reserve a zeroed word-wide slot per this region's word width.
    pub fn insert_number_token(&mut self) -> NumberToken {
        match self.word {
            WordWidth::W32 => NumberToken::Int(self.insert_int_token()),
            WordWidth::W64 => NumberToken::Long(self.insert_long_token()),
        }
    }

    // ==================== Placeholder fields ====================

    /// Reserve an address-sized field referencing `target` and record the
    /// relocation that will patch it.
    pub fn write_placeholder(&mut self, target: Placeholder, mode: RelocMode) {
        self.write_reloc_field(RelocTarget::Direct(target), mode);
    }

    /// As [`write_placeholder`](Self::write_placeholder), for a target
    /// bound later through a cell.
    pub fn write_placeholder_cell(&mut self, target: &PlaceholderCell, mode: RelocMode) {
        self.write_reloc_field(RelocTarget::Cell(target.clone()), mode);
    }

    fn write_reloc_field(&mut self, target: RelocTarget, mode: RelocMode) {
        let offset = self.buf.len() as u64;
        let width = match mode {
            RelocMode::Relative32 => {
                self.write_i32(0);
                PatchWidth::W32
            }
            _ => {
                self.write_word(0);
                match self.word {
                    WordWidth::W32 => PatchWidth::W32,
                    WordWidth::W64 => PatchWidth::W64,
                }
            }
        };
        self.relocations.push(Relocation {
            offset,
            target,
            mode,
            width,
        });
    }

    // ==================== Patching ====================

    pub(crate) fn patch_i16(&mut self, offset: usize, value: i16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn patch_i32(&mut self, offset: usize, value: i32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn patch_i64(&mut self, offset: usize, value: i64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    // ==================== Layout ====================

    pub fn section_base(&self) -> u64 {
        self.section_base
    }

    pub fn set_section_base(&mut self, base: u64) {
        self.section_base = base;
    }

    pub fn memory_location(&self) -> Result<u64> {
        self.memory_location
            .ok_or(BackendError::UnassignedMemoryLocation { region: self.id })
    }

    pub fn file_location(&self) -> Result<u32> {
        self.file_location
            .ok_or(BackendError::UnassignedFileLocation { region: self.id })
    }
}

/// A reserved 16-bit slot; the writer supplies the value once enough of
/// the region has been emitted.
#[derive(Debug)]
pub struct WordToken {
    region: RegionId,
    position: usize,
}

impl WordToken {
    pub fn set_value(&self, region: &mut Region, value: i32) {
        assert_eq!(region.id, self.region);
        assert!(
            i32::from(i16::MIN) <= value && value <= i32::from(i16::MAX),
            "word token value {value} does not fit in 16 bits"
        );
        region.patch_i16(self.position, value as i16);
    }

    /// Set the value to the number of bytes written since the token was
    /// taken (length-prefix idiom).
    pub fn set_distance_since_taken(&self, region: &mut Region) {
        let distance = region.len() - self.position;
        self.set_value(region, distance as i32);
    }
}

/// A reserved 32-bit slot supplied later by the writer.
#[derive(Debug)]
pub struct IntToken {
    region: RegionId,
    position: usize,
    location: Placeholder,
}

impl IntToken {
    /// Position of the reserved field itself.
    pub fn location(&self) -> Placeholder {
        self.location
    }

    pub fn set_value(&self, region: &mut Region, value: i32) {
        assert_eq!(region.id, self.region);
        region.patch_i32(self.position, value);
    }
}

/// A reserved 64-bit slot supplied later by the writer.
#[derive(Debug)]
pub struct LongToken {
    region: RegionId,
    position: usize,
    location: Placeholder,
}

impl LongToken {
    pub fn location(&self) -> Placeholder {
        self.location
    }

    pub fn set_value(&self, region: &mut Region, value: i64) {
        assert_eq!(region.id, self.region);
        region.patch_i64(self.position, value);
    }
}

/// A reserved word-wide slot, 32 or 64 bits per the region it was taken
/// from.
#[derive(Debug)]
pub enum NumberToken {
    Int(IntToken),
    Long(LongToken),
}

impl NumberToken {
    pub fn set_value(&self, region: &mut Region, value: i64) {
        match self {
            NumberToken::Int(token) => {
                assert!(
                    i64::from(i32::MIN) <= value && value <= i64::from(i32::MAX),
                    "number token value {value} does not fit in 32 bits"
                );
                token.set_value(region, value as i32);
            }
            NumberToken::Long(token) => token.set_value(region, value),
        }
    }
}

/// Owner of every region, and the site of the resolution pass.
#[derive(Debug, Default)]
pub struct RegionArena {
    regions: Vec<Region>,
    resolved: bool,
}

impl RegionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_region(&mut self, kind: RegionKind, word: WordWidth) -> RegionId {
        let id = RegionId(self.regions.len() as u32);
        self.regions.push(Region::new(id, kind, word));
        id
    }

    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.index()]
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut Region {
        &mut self.regions[id.index()]
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Assign a region's final addresses. Called by the linker layout pass,
    /// exactly once per region; addresses are nonzero.
    pub fn assign_addresses(&mut self, id: RegionId, memory_location: u64, file_location: u32) {
        let region = &mut self.regions[id.index()];
        assert!(
            region.memory_location.is_none() && region.file_location.is_none(),
            "region {id:?} assigned addresses twice"
        );
        assert!(memory_location > 0 && file_location > 0);
        trace!(
            "region {:?}: memory {:#x}, file {:#x}",
            id,
            memory_location,
            file_location
        );
        region.memory_location = Some(memory_location);
        region.file_location = Some(file_location);
    }

    /// Final virtual address of a placeholder. Defined only after layout.
    pub fn address_of(&self, placeholder: Placeholder) -> Result<u64> {
        let region = self.region(placeholder.region());
        Ok(region.memory_location()? + placeholder.offset())
    }

    /// Final file offset of a placeholder. Defined only after layout.
    pub fn file_address_of(&self, placeholder: Placeholder) -> Result<u64> {
        let region = self.region(placeholder.region());
        Ok(u64::from(region.file_location()?) + placeholder.offset())
    }

    /// Patch every recorded relocation, exactly once, after every region
    /// has been assigned its addresses. A pure function of the layout.
    pub fn resolve(&mut self, image_base: u64) -> Result<()> {
        if self.resolved {
            return Err(BackendError::AlreadyResolved);
        }

        // Snapshot the layout first; patching below mutates the buffers
        // but never the layout.
        let mut layout = Vec::with_capacity(self.regions.len());
        for region in &self.regions {
            layout.push((region.memory_location, region.file_location, region.section_base));
        }

        let mut patched = 0usize;
        for region in &mut self.regions {
            let own_memory = layout[region.id.index()].0;
            let relocations = region.relocations.clone();
            for reloc in &relocations {
                let target = reloc.target.resolve()?;
                let (target_memory, target_file, target_section) = layout[target.region().index()];
                let target_memory = target_memory
                    .ok_or(BackendError::UnassignedMemoryLocation { region: target.region() })?;

                match reloc.mode {
                    RelocMode::Relative32 => {
                        let own_memory = own_memory
                            .ok_or(BackendError::UnassignedMemoryLocation { region: region.id })?;
                        let from = own_memory + reloc.offset + 4;
                        let to = target_memory + target.offset();
                        region.patch_i32(reloc.offset as usize, (to as i64 - from as i64) as i32);
                    }
                    mode => {
                        let value = match mode {
                            RelocMode::Absolute => target_memory + target.offset(),
                            RelocMode::ImageRelative => {
                                target_memory + target.offset() - image_base
                            }
                            RelocMode::SectionRelative => {
                                target_memory + target.offset() - target_section
                            }
                            RelocMode::FileRelative => {
                                let file = target_file.ok_or(
                                    BackendError::UnassignedFileLocation {
                                        region: target.region(),
                                    },
                                )?;
                                u64::from(file) + target.offset()
                            }
                            RelocMode::Relative32 => unreachable!(),
                        };
                        match reloc.width {
                            PatchWidth::W32 => {
                                region.patch_i32(reloc.offset as usize, value as i32)
                            }
                            PatchWidth::W64 => {
                                region.patch_i64(reloc.offset as usize, value as i64)
                            }
                        }
                    }
                }
                patched += 1;
            }
        }

        self.resolved = true;
        debug!(
            "resolved {} relocations across {} regions",
            patched,
            self.regions.len()
        );
        Ok(())
    }
}
