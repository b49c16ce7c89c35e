//! Integration tests for the Opal backend
//!
//! Drives the full pipeline on both encoders: emit → assign layout →
//! resolve → inspect the patched bytes.

use opal_backend::{
    Abi, Assembler, FrameLayout, HandlerRecord, PlaceholderCell, RegionArena, RegionKind,
    RelocMode, WordWidth, X64Assembler, X86Assembler,
};
use proptest::prelude::*;

#[test]
fn x86_function_resolves_absolute_addresses() {
    let mut arena = RegionArena::new();
    let data = arena.add_region(RegionKind::Data, WordWidth::W32);
    let int_type = arena.region(data).current_location();
    arena.region_mut(data).write_i32(0);

    let code = arena.add_region(RegionKind::Code, WordWidth::W32);
    {
        let mut frame = FrameLayout::new();
        let param = frame.add_parameter();
        let local = frame.add_variable();
        let mut asm = X86Assembler::new(arena.region_mut(code), frame, false);

        asm.start_function();
        asm.set_immediate_value(int_type, 41).unwrap();
        asm.store_variable(local).unwrap();
        asm.retrieve_variable(param).unwrap();
        asm.stop_function();
    }

    arena.assign_addresses(code, 0x40_1000, 0x400);
    arena.assign_addresses(data, 0x40_3000, 0x600);
    arena.resolve(0x40_0000).unwrap();

    // prologue: push ebp; mov ebp, esp; xor eax, eax; push eax x2
    let bytes = arena.region(code).bytes();
    assert_eq!(&bytes[..7], [0x55, 0x8b, 0xec, 0x31, 0xc0, 0x50, 0x50]);
    // mov eax, 41; mov edx, <type address>
    assert_eq!(&bytes[7..12], [0xb8, 0x29, 0x00, 0x00, 0x00]);
    assert_eq!(bytes[12], 0xba);
    assert_eq!(&bytes[13..17], 0x40_3000u32.to_le_bytes());
    // epilogue pops the one dual-word parameter
    assert_eq!(&bytes[bytes.len() - 3..], [0xc2, 0x08, 0x00]);
}

#[test]
fn x64_function_resolves_rip_relative_displacements() {
    let mut arena = RegionArena::new();
    let data = arena.add_region(RegionKind::ReadOnlyData, WordWidth::W64);
    let int_type = arena.region(data).current_location();
    arena.region_mut(data).write_i64(0);

    let code = arena.add_region(RegionKind::Code, WordWidth::W64);
    let reloc_offset;
    {
        let mut frame = FrameLayout::new();
        frame.add_parameter();
        let mut asm = X64Assembler::new(arena.region_mut(code), frame);

        asm.start_function();
        asm.set_immediate_value(int_type, 0).unwrap();
        reloc_offset = asm.region().relocations()[0].offset;
        asm.stop_function();
    }

    arena.assign_addresses(code, 0x1000, 0x100);
    arena.assign_addresses(data, 0x9000, 0x900);
    arena.resolve(0x1000).unwrap();

    let bytes = arena.region(code).bytes();
    let at = reloc_offset as usize;
    let disp = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
    // displacement counts from the byte after the operand
    assert_eq!(0x1000 + at as i64 + 4 + i64::from(disp), 0x9000);
}

#[test]
fn cross_region_direct_call_targets_the_callee() {
    // 32-bit: the call operand is the callee's absolute address.
    let mut arena = RegionArena::new();
    let callee = arena.add_region(RegionKind::Code, WordWidth::W32);
    {
        let mut asm = X86Assembler::new(arena.region_mut(callee), FrameLayout::new(), false);
        asm.start_function();
        asm.stop_function();
    }
    let callee_entry = arena.region(callee).base_location();

    let caller = arena.add_region(RegionKind::Code, WordWidth::W32);
    {
        let mut asm = X86Assembler::new(arena.region_mut(caller), FrameLayout::new(), false);
        asm.call_direct(callee_entry);
    }

    arena.assign_addresses(callee, 0x5000, 0x500);
    arena.assign_addresses(caller, 0x6000, 0x600);
    arena.resolve(0x4000).unwrap();

    let bytes = arena.region(caller).bytes();
    assert_eq!(bytes[0], 0xb9);
    assert_eq!(&bytes[1..5], 0x5000u32.to_le_bytes());

    // 64-bit: the lea displacement reaches the callee rip-relatively.
    let mut arena = RegionArena::new();
    let callee = arena.add_region(RegionKind::Code, WordWidth::W64);
    {
        let mut asm = X64Assembler::new(arena.region_mut(callee), FrameLayout::new());
        asm.start_function();
        asm.stop_function();
    }
    let callee_entry = arena.region(callee).base_location();

    let caller = arena.add_region(RegionKind::Code, WordWidth::W64);
    {
        let mut asm = X64Assembler::new(arena.region_mut(caller), FrameLayout::new());
        asm.call_direct(callee_entry);
    }

    arena.assign_addresses(callee, 0x5000, 0x500);
    arena.assign_addresses(caller, 0x6000, 0x600);
    arena.resolve(0x4000).unwrap();

    let bytes = arena.region(caller).bytes();
    let disp = i32::from_le_bytes(bytes[3..7].try_into().unwrap());
    assert_eq!(0x6000 + 3 + 4 + i64::from(disp), 0x5000);
}

#[test]
fn store_and_retrieve_address_the_same_dual_word() {
    // A stored accumulator must read back from the same two frame
    // offsets, on both encoders.
    let mut arena = RegionArena::new();
    let code = arena.add_region(RegionKind::Code, WordWidth::W64);
    let mut frame = FrameLayout::new();
    frame.add_parameter();
    let local = frame.add_variable();
    let mut asm = X64Assembler::new(arena.region_mut(code), frame);

    asm.store_variable(local).unwrap();
    let store_len = asm.region().len();
    asm.retrieve_variable(local).unwrap();
    let bytes = asm.region().bytes();

    // store: 48 89 45 d lsdw / 48 89 55 msdw; retrieve: 48 8b ...
    let (store, retrieve) = bytes.split_at(store_len);
    assert_eq!(store[2], retrieve[2]);
    assert_eq!(store[3], retrieve[3]); // value word displacement
    assert_eq!(store[6], retrieve[6]);
    assert_eq!(store[7], retrieve[7]); // type word displacement
}

#[test]
fn loop_with_break_counts_its_exits() {
    // The shape the semantic layer emits for `while` loops: a loop head
    // token set before the condition, a skip token taken on false and by
    // every break. The skip token's jump count tells the caller whether
    // the body ever exits.
    let mut arena = RegionArena::new();
    let code = arena.add_region(RegionKind::Code, WordWidth::W64);
    let mut asm = X64Assembler::new(arena.region_mut(code), FrameLayout::new());

    let mut loop_token = asm.create_jump_token();
    let mut skip_token = asm.create_jump_token();

    asm.set_destination(&mut loop_token); // loop head (backward target)
    asm.jump_if_false(&mut skip_token); // condition exit (forward)
    asm.integer_add(); // body
    asm.jump(&mut skip_token); // break (forward)
    asm.jump(&mut loop_token); // loop back edge
    asm.set_destination(&mut skip_token);

    assert_eq!(skip_token.jump_count(), 2);
    assert_eq!(loop_token.jump_count(), 1);

    let bytes = asm.region().bytes();
    let end = bytes.len() as i64;

    // condition exit: operand after `and rax, rax; jz` at 5..9
    let disp = i32::from_le_bytes(bytes[5..9].try_into().unwrap());
    assert_eq!(9 + i64::from(disp), end);
    // break: jmp operand at 18..22
    let disp = i32::from_le_bytes(bytes[18..22].try_into().unwrap());
    assert_eq!(22 + i64::from(disp), end);
    // back edge: jmp operand at 23..27 targets offset 0
    let disp = i32::from_le_bytes(bytes[23..27].try_into().unwrap());
    assert_eq!(27 + i64::from(disp), 0);
}

#[test]
fn overflow_check_skips_exactly_the_handler_call() {
    let mut arena = RegionArena::new();
    let handler_region = arena.add_region(RegionKind::Data, WordWidth::W64);
    let handler = arena.region(handler_region).base_location();
    let code = arena.add_region(RegionKind::Code, WordWidth::W64);
    let mut asm = X64Assembler::new(arena.region_mut(code), FrameLayout::new());

    asm.integer_add();
    let before = asm.region().len();
    asm.check_overflow(handler);
    let bytes = asm.region().bytes();

    // jno skips to the end of the emitted call, leaving rax/rdx alone
    assert_eq!(bytes[before], 0x71);
    let skip = bytes[before + 1] as usize;
    assert_eq!(before + 2 + skip, bytes.len());
}

#[test]
fn handler_record_walk_restores_the_matching_frame() {
    // Simulate the invoke walk over the record layout: three frames, the
    // innermost one's saved pointer aimed at the second frame's record.
    // Word-unit memory; cell N holds the "word at address N".
    const ENTRY2: u64 = 0xbeef;
    let mut memory = vec![0u64; 64];

    // second frame's handler record at address 20
    memory[20 + HandlerRecord::LINK] = 40; // link out to caller frame
    memory[20 + HandlerRecord::MARKER] = 0;
    memory[20 + HandlerRecord::ENTRY] = ENTRY2;
    memory[20 + HandlerRecord::PADDING] = 0;

    // innermost frame: a normal frame whose saved pointer is the record
    memory[10] = 20; // [fp] -> second frame's record
    memory[40] = 48; // caller frame link
    memory[41] = 0x4242; // return address: nonzero, not a record

    // the walk from exception_handler_invoke
    let mut fp = 10u64;
    loop {
        let candidate = memory[fp as usize];
        if memory[candidate as usize + HandlerRecord::MARKER] == 0 {
            break;
        }
        fp = memory[fp as usize];
    }
    let record = memory[fp as usize];
    assert_eq!(record, 20);
    assert_eq!(memory[record as usize + HandlerRecord::ENTRY], ENTRY2);
}

#[test]
fn exception_scopes_balance_across_both_encoders() {
    let mut arena = RegionArena::new();
    let code32 = arena.add_region(RegionKind::Code, WordWidth::W32);
    {
        let mut asm = X86Assembler::new(arena.region_mut(code32), FrameLayout::new(), false);
        let site = PlaceholderCell::new();
        asm.start_function();
        asm.exception_handler_setup(&site);
        asm.exception_handler_remove();
        asm.set_destination_cell(&site);
        asm.stop_function();
        assert!(site.get().is_some());
    }

    let code64 = arena.add_region(RegionKind::Code, WordWidth::W64);
    {
        let mut asm = X64Assembler::new(arena.region_mut(code64), FrameLayout::new());
        let site = PlaceholderCell::new();
        asm.start_function();
        asm.exception_handler_setup(&site);
        asm.exception_handler_remove();
        asm.set_destination_cell(&site);
        asm.stop_function();
    }
}

#[test]
fn built_in_call_padding_resolves_argument_targets() {
    let mut arena = RegionArena::new();
    let data = arena.add_region(RegionKind::Data, WordWidth::W64);
    for _ in 0..16 {
        arena.region_mut(data).write_i64(0);
    }
    let function = arena.region(data).base_location();
    let args: Vec<_> = (1..8u64)
        .map(|i| arena.region(data).base_location().increment(i * 8))
        .collect();

    let code = arena.add_region(RegionKind::Code, WordWidth::W64);
    {
        let mut asm = X64Assembler::new(arena.region_mut(code), FrameLayout::new());
        asm.call_built_in(function, &args);
    }

    arena.assign_addresses(code, 0x1000, 0x100);
    arena.assign_addresses(data, 0x8000, 0x800);
    arena.resolve(0x1000).unwrap();

    // every lea operand must land on its argument after resolution
    let region = arena.region(code);
    let bytes = region.bytes().to_vec();
    for reloc in region.relocations() {
        let at = reloc.offset as usize;
        let disp = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        let resolved = 0x1000 + at as i64 + 4 + i64::from(disp);
        let target = match &reloc.target {
            opal_backend::RelocTarget::Direct(p) => arena.address_of(*p).unwrap(),
            opal_backend::RelocTarget::Cell(c) => arena.address_of(c.get().unwrap()).unwrap(),
        };
        assert_eq!(resolved, target as i64);
    }
}

proptest! {
    /// Frame displacements use the short form exactly when they fit in a
    /// signed byte, and either form decodes back to the same offset.
    #[test]
    fn displacement_width_follows_the_offset(parameters in 1usize..40, slot in 0usize..40) {
        prop_assume!(slot < parameters);

        let mut frame = FrameLayout::new();
        for _ in 0..parameters {
            frame.add_parameter();
        }
        let expected = i64::from(Abi::X86.frame_offset(&frame, slot).unwrap());

        let mut arena = RegionArena::new();
        let code = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(code), frame, false);
        asm.retrieve_variable(slot).unwrap();
        let bytes = asm.region().bytes();

        prop_assert_eq!(bytes[0], 0x8b);
        let decoded = match bytes[1] {
            0x45 => {
                prop_assert!(Abi::fits_disp8(expected));
                i64::from(bytes[2] as i8)
            }
            0x85 => {
                prop_assert!(!Abi::fits_disp8(expected));
                i64::from(i32::from_le_bytes(bytes[2..6].try_into().unwrap()))
            }
            other => {
                prop_assert!(false, "unexpected ModR/M {:#x}", other);
                unreachable!()
            }
        };
        prop_assert_eq!(decoded, expected);
    }

    /// Forward and backward jumps both patch dest - (site + 4).
    #[test]
    fn jump_displacement_is_relative_to_operand_end(pad_before in 0usize..32, pad_after in 1usize..32) {
        let mut arena = RegionArena::new();
        let code = arena.add_region(RegionKind::Code, WordWidth::W64);
        let mut asm = X64Assembler::new(arena.region_mut(code), FrameLayout::new());

        // backward: destination first
        let mut back = asm.create_jump_token();
        asm.raw(&vec![0x90; pad_before]);
        asm.set_destination(&mut back);
        asm.raw(&vec![0x90; pad_after]);
        asm.jump(&mut back);

        // forward: site first
        let mut fwd = asm.create_jump_token();
        asm.jump(&mut fwd);
        asm.raw(&vec![0x90; pad_after]);
        asm.set_destination(&mut fwd);

        let bytes = asm.region().bytes();
        let back_op = pad_before + pad_after + 1;
        let disp = i64::from(i32::from_le_bytes(bytes[back_op..back_op + 4].try_into().unwrap()));
        prop_assert_eq!(back_op as i64 + 4 + disp, pad_before as i64);

        let fwd_op = back_op + 5;
        let disp = i64::from(i32::from_le_bytes(bytes[fwd_op..fwd_op + 4].try_into().unwrap()));
        prop_assert_eq!(fwd_op as i64 + 4 + disp, bytes.len() as i64);
    }
}

#[test]
fn region_report_for_the_writers_is_complete() {
    // What the PE/ELF writers consume: bytes, relocations with mode and
    // width, section kind.
    let mut arena = RegionArena::new();
    let data = arena.add_region(RegionKind::Data, WordWidth::W32);
    let target = arena.region(data).current_location();
    arena.region_mut(data).write_i32(1);

    let code = arena.add_region(RegionKind::Code, WordWidth::W32);
    {
        let mut asm = X86Assembler::new(arena.region_mut(code), FrameLayout::new(), false);
        asm.load(target);
        asm.store(target);
    }

    let region = arena.region(code);
    assert_eq!(region.kind(), RegionKind::Code);
    assert_eq!(region.relocations().len(), 2);
    for reloc in region.relocations() {
        assert_eq!(reloc.mode, RelocMode::Absolute);
        assert_eq!(reloc.width, opal_backend::PatchWidth::W32);
    }
}
