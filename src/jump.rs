//! Jump Tokens
//!
//! A [`JumpToken`] pairs the displacement operands of branch instructions
//! with their eventual destination. The destination is write-once; jump
//! sites accumulate, so one token serves forward branches (site first),
//! backward branches (destination first) and multi-source convergence
//! (every `break` in a loop shares the skip token).
//!
//! The patched displacement is always
//! `destination - (site + operand width)` — relative to the address
//! immediately following the operand, which is how the CPU computes
//! relative jumps. Sites and destination must live in the same region;
//! their relative distance is layout-invariant, so patching happens as
//! soon as both ends of a pair are known, while the region is still being
//! written.

use crate::region::{PatchWidth, Placeholder, Region};

#[derive(Debug, Clone, Copy)]
struct JumpSite {
    operand: Placeholder,
    width: PatchWidth,
}

/// A branch destination and the set of operand sites that jump to it.
#[derive(Debug, Default)]
pub struct JumpToken {
    destination: Option<Placeholder>,
    pending: Vec<JumpSite>,
    jump_count: usize,
}

impl JumpToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jump sites ever attached to this token. Callers use this
    /// to learn whether any branch targets the destination at all (e.g.
    /// whether a loop body contains an exit).
    pub fn jump_count(&self) -> usize {
        self.jump_count
    }

    pub fn destination_set(&self) -> bool {
        self.destination.is_some()
    }

    /// Attach a branch operand site. Called by an encoder immediately
    /// after emitting the branch opcode and reserving its displacement
    /// operand. Patches at once when the destination is already known.
    pub fn add_site(&mut self, region: &mut Region, operand: Placeholder, width: PatchWidth) {
        self.jump_count += 1;
        let site = JumpSite { operand, width };
        match self.destination {
            Some(destination) => patch_site(region, site, destination),
            None => self.pending.push(site),
        }
    }

    /// Set the branch destination, draining any pending sites. A token has
    /// exactly one destination; setting a second is a caller bug.
    pub fn set_destination(&mut self, region: &mut Region, destination: Placeholder) {
        assert!(
            self.destination.is_none(),
            "jump token destination set more than once"
        );
        self.destination = Some(destination);
        for site in self.pending.drain(..) {
            patch_site(region, site, destination);
        }
    }
}

fn patch_site(region: &mut Region, site: JumpSite, destination: Placeholder) {
    match site.width {
        PatchWidth::W32 => {
            let displacement = destination.distance_from(site.operand.increment(4));
            assert!(
                i64::from(i32::MIN) <= displacement && displacement <= i64::from(i32::MAX),
                "jump displacement {displacement} does not fit in 32 bits"
            );
            region.patch_i32(site.operand.offset() as usize, displacement as i32);
        }
        PatchWidth::W64 => {
            let displacement = destination.distance_from(site.operand.increment(8));
            region.patch_i64(site.operand.offset() as usize, displacement);
        }
    }
}
