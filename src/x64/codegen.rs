//! 64-bit Instruction Encoding
//!
//! [`X64Assembler`] maps the assembler contract to exact x86-64 bytes.
//!
//! Register discipline: the accumulator lives in rax (value word) and rdx
//! (type word); rcx and r11 are scratch. Dual words occupy 16 bytes
//! everywhere. Native calls place the first arguments in System V
//! registers and spill the rest; Opal calls are callee-cleanup via
//! `ret imm16`.
//!
//! The emitted code is position-independent: every address referenced
//! from code is a RIP-relative 32-bit displacement behind an
//! instruction-pointer-relative `lea` ([`RelocMode::Relative32`]),
//! never a 64-bit absolute immediate embedded mid-instruction. Immediate
//! *values* wider than 32 bits still use `mov rax, imm64`.

use log::trace;

use super::registers::{modrm, rex, Reg64, ARG_PAIRS, ARG_REGS};
use crate::frame::{narrow_offset, Abi, FrameLayout};
use crate::jump::JumpToken;
use crate::region::{
    PatchWidth, Placeholder, PlaceholderCell, Region, RegionKind, RelocMode, WordWidth,
};
use crate::unwind::HandlerRecord;
use crate::{Assembler, BackendError, Result};

/// The 64-bit encoder. One instance per function body.
pub struct X64Assembler<'a> {
    region: &'a mut Region,
    frame: FrameLayout,
    handler_scopes: usize,
    finished: bool,
}

impl<'a> X64Assembler<'a> {
    pub fn new(region: &'a mut Region, frame: FrameLayout) -> Self {
        assert_eq!(region.word_width(), WordWidth::W64);
        assert_eq!(region.kind(), RegionKind::Code);
        Self {
            region,
            frame,
            handler_scopes: 0,
            finished: false,
        }
    }

    fn frame_offset(&self, slot: usize) -> Result<i32> {
        Abi::X64.frame_offset(&self.frame, slot)
    }

    fn field_offset(&self, slot: usize) -> Result<i32> {
        let offset = slot as i64 * 8;
        i32::try_from(offset).map_err(|_| BackendError::FieldOffsetTooLarge { offset })
    }

    /// mov dst, [base+disp], choosing the disp8 form when it fits.
    fn mov_reg_mem(&mut self, dst: Reg64, base: Reg64, disp: i32) {
        debug_assert!(base != Reg64::RSP);
        self.region.write_u8(rex(true, dst, base));
        self.region.write_u8(0x8b);
        self.mem_operand(dst, base, disp);
    }

    /// mov [base+disp], src.
    fn mov_mem_reg(&mut self, base: Reg64, disp: i32, src: Reg64) {
        debug_assert!(base != Reg64::RSP);
        self.region.write_u8(rex(true, src, base));
        self.region.write_u8(0x89);
        self.mem_operand(src, base, disp);
    }

    fn mem_operand(&mut self, reg: Reg64, base: Reg64, disp: i32) {
        if Abi::fits_disp8(disp.into()) {
            self.region
                .write_u8(modrm(0b01, reg.encoding(), base.encoding()));
            self.region.write_i8(disp.into());
        } else {
            self.region
                .write_u8(modrm(0b10, reg.encoding(), base.encoding()));
            self.region.write_i32(disp.into());
        }
    }

    /// lea dst, [rip+disp32]; the caller writes the displacement operand,
    /// normally a [`RelocMode::Relative32`] placeholder.
    fn lea_rip(&mut self, dst: Reg64) {
        let prefix = if dst.needs_rex_ext() { 0x4c } else { 0x48 };
        self.region.write_u8(prefix);
        self.region.write_u8(0x8d);
        self.region.write_u8(modrm(0b00, dst.encoding(), 0b101));
    }

    /// lea dst, [rip+disp32] resolving to `target`.
    fn lea_rip_placeholder(&mut self, dst: Reg64, target: Placeholder) {
        self.lea_rip(dst);
        self.region.write_placeholder(target, RelocMode::Relative32);
    }

    /// push [rbp+disp].
    fn push_frame_word(&mut self, disp: i32) {
        if Abi::fits_disp8(disp.into()) {
            self.region.write_bytes(&[0xff, 0x75]);
            self.region.write_i8(disp.into());
        } else {
            self.region.write_bytes(&[0xff, 0xb5]);
            self.region.write_i32(disp.into());
        }
    }

    /// mov rax, imm: the zero, imm32 and imm64 forms.
    fn mov_rax_imm(&mut self, value: i64) {
        if i32::try_from(value).is_err() {
            self.region.write_bytes(&[0x48, 0xb8]); // mov rax, imm64
            self.region.write_i64(value);
        } else if value == 0 {
            self.region.write_bytes(&[0x48, 0x31, 0xc0]); // xor rax, rax
        } else {
            self.region.write_bytes(&[0x48, 0xc7, 0xc0]); // mov rax, imm32
            self.region.write_i32(value);
        }
    }

    /// Reserve a 4-byte branch operand and attach it to the token.
    fn jump_site(&mut self, token: &mut JumpToken) {
        let operand = self.region.current_location();
        self.region.write_i32(0);
        token.add_site(self.region, operand, PatchWidth::W32);
    }

    /// Compare the popped value with the accumulator, leaving a boolean.
    /// `skip` is the condition that skips the `xor rax, 1`.
    fn integer_compare(&mut self, skip: u8) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x48, 0x31, 0xc0, // xor rax, rax
            0x59, // pop rcx
            0x48, 0x39, 0xd1, // cmp rcx, rdx
        ]);
        self.region.write_u8(skip);
        self.region.write_bytes(&[
            0x04, // skip distance
            0x48, 0x83, 0xf0, 0x01, // xor rax, 1
            0x59, // pop rcx
        ]);
    }
}

impl Assembler for X64Assembler<'_> {
    fn region(&self) -> &Region {
        self.region
    }

    fn region_mut(&mut self) -> &mut Region {
        self.region
    }

    fn slot_count(&self) -> usize {
        self.frame.slot_count()
    }

    fn stack_root(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x31, 0xed, // xor rbp, rbp
            0x48, 0x89, 0xe7, // mov rdi, rsp
        ]);
    }

    fn start_function(&mut self) {
        trace!(
            "x64 prologue: {} parameters, {} variables",
            self.frame.parameter_count(),
            self.frame.variable_count()
        );
        self.region.write_bytes(&[
            0x55, // push rbp
            0x48, 0x89, 0xe5, // mov rbp, rsp
        ]);
        if self.frame.variable_count() > 0 {
            self.region.write_bytes(&[0x48, 0x31, 0xc0]); // xor rax, rax
            for _ in 0..self.frame.variable_count() {
                self.region.write_bytes(&[0x50, 0x50]); // push rax; push rax
            }
        }
    }

    fn stop_function(&mut self) {
        assert_eq!(
            self.handler_scopes, 0,
            "function epilogue inside an open exception handler scope"
        );
        assert!(!self.finished, "function epilogue emitted twice");
        self.finished = true;
        self.region.write_u8(0xc9); // leave
        if self.frame.parameter_count() > 0 {
            self.region.write_u8(0xc2); // ret imm16
            self.region
                .write_i16(self.frame.parameter_count() as i64 * 16);
        } else {
            self.region.write_u8(0xc3); // ret
        }
    }

    fn retrieve_variable(&mut self, slot: usize) -> Result<()> {
        let lsdw = self.frame_offset(slot)?;
        let msdw = narrow_offset(i64::from(lsdw) + 8)?;
        self.mov_reg_mem(Reg64::RAX, Reg64::RBP, lsdw);
        self.mov_reg_mem(Reg64::RDX, Reg64::RBP, msdw);
        Ok(())
    }

    fn store_variable(&mut self, slot: usize) -> Result<()> {
        let lsdw = self.frame_offset(slot)?;
        let msdw = narrow_offset(i64::from(lsdw) + 8)?;
        self.mov_mem_reg(Reg64::RBP, lsdw, Reg64::RAX);
        self.mov_mem_reg(Reg64::RBP, msdw, Reg64::RDX);
        Ok(())
    }

    fn fetch_field(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.mov_reg_mem(Reg64::RCX, Reg64::RDX, offset);
        self.region.write_bytes(&[
            0x48, 0x8b, 0x54, 0x08, 0x08, // mov rdx, [rax+rcx+8]
            0x48, 0x8b, 0x04, 0x08, // mov rax, [rax+rcx]
        ]);
        Ok(())
    }

    fn fetch_method(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.mov_reg_mem(Reg64::RDX, Reg64::RDX, offset);
        Ok(())
    }

    fn push_value(&mut self) {
        self.region.write_bytes(&[
            0x52, // push rdx
            0x50, // push rax
        ]);
    }

    fn pop_value(&mut self) {
        self.region.write_bytes(&[
            0x58, // pop rax
            0x5a, // pop rdx
        ]);
    }

    fn peek_value(&mut self, depth: usize) -> Result<()> {
        let offset = depth as i64 * 16 + 8;
        if !Abi::fits_disp8(offset) {
            return Err(BackendError::StackDepthTooLarge { depth });
        }
        self.region.write_bytes(&[0x48, 0x8b, 0x44, 0x24]); // mov rax, [rsp+disp8]
        self.region.write_i8(offset - 8);
        self.region.write_bytes(&[0x48, 0x8b, 0x54, 0x24]); // mov rdx, [rsp+disp8]
        self.region.write_i8(offset);
        Ok(())
    }

    fn drop_stack_top(&mut self) {
        self.region.write_bytes(&[0x59, 0x59]); // pop rcx; pop rcx
    }

    fn push_value_part(&mut self) {
        self.region.write_u8(0x50); // push rax
    }

    fn call_from_stack(&mut self, parameter_count: usize) -> Result<Placeholder> {
        let offset = narrow_offset(parameter_count as i64 * 16 + 8)?;
        if Abi::fits_disp8(offset.into()) {
            self.region.write_bytes(&[0x48, 0x8b, 0x44, 0x24]); // mov rax, [rsp+disp8]
            self.region.write_i8(offset.into());
        } else {
            self.region.write_bytes(&[0x48, 0x8b, 0x84, 0x24]); // mov rax, [rsp+disp32]
            self.region.write_i32(offset.into());
        }
        self.region.write_bytes(&[
            0x48, 0x8b, 0x50, 0x28, // mov rdx, [rax+0x28]
        ]);
        if Abi::fits_disp8(offset.into()) {
            self.region.write_bytes(&[0x48, 0x89, 0x54, 0x24]); // mov [rsp+disp8], rdx
            self.region.write_i8(offset.into());
        } else {
            self.region.write_bytes(&[0x48, 0x89, 0x94, 0x24]); // mov [rsp+disp32], rdx
            self.region.write_i32(offset.into());
        }
        self.region.write_bytes(&[0xff, 0x50, 0x20]); // call [rax+0x20]
        Ok(self.region.current_location())
    }

    fn call_direct(&mut self, function: Placeholder) -> Placeholder {
        self.lea_rip_placeholder(Reg64::RCX, function);
        self.region.write_bytes(&[0xff, 0xd1]); // call rcx
        self.region.current_location()
    }

    fn load_method_struct(&mut self, method_struct: Placeholder) {
        self.lea_rip_placeholder(Reg64::RDX, method_struct);
        self.region.write_bytes(&[0x48, 0x31, 0xc0]); // xor rax, rax
    }

    fn call_allocator(&mut self, allocator: Placeholder, size: i32, type_of: Placeholder) {
        self.region.write_bytes(&[0x48, 0xc7, 0xc7]); // mov rdi, imm32
        self.region.write_i32(size.into());
        self.region.write_bytes(&[0x48, 0x31, 0xf6]); // xor rsi, rsi
        // fake call frame, so stack walking sees a consistent chain
        self.region.write_bytes(&[
            0x55, // push rbp
            0x55, // push rbp
            0x48, 0x89, 0xe5, // mov rbp, rsp
        ]);
        self.region.write_bytes(&[0x48, 0x89, 0xea]); // mov rdx, rbp
        self.lea_rip_placeholder(Reg64::R11, allocator);
        self.region.write_bytes(&[0x41, 0xff, 0x13]); // call [r11]
        self.lea_rip_placeholder(Reg64::RDX, type_of);
        self.region.write_bytes(&[0x5d, 0x5d]); // pop rbp; pop rbp
    }

    fn empty(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x31, 0xc0, // xor rax, rax
            0x48, 0x31, 0xd2, // xor rdx, rdx
        ]);
    }

    fn store_in_field_of_slot(&mut self, touch: Placeholder, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.region.write_bytes(&[0x48, 0x8b, 0x4c, 0x24, 0x08]); // mov rcx, [rsp+8]
        self.mov_reg_mem(Reg64::RCX, Reg64::RCX, offset);
        self.region.write_bytes(&[
            0x48, 0x03, 0x0c, 0x24, // add rcx, [rsp]
            0x48, 0x89, 0x01, // mov [rcx], rax
            0x48, 0x89, 0x51, 0x08, // mov [rcx+8], rdx
        ]);
        self.region.write_bytes(&[0x48, 0x89, 0xcf]); // mov rdi, rcx
        self.lea_rip_placeholder(Reg64::R11, touch);
        self.region.write_bytes(&[0x41, 0xff, 0x13]); // call [r11]
        self.region.write_bytes(&[0x59, 0x59]); // pop rcx; pop rcx
        Ok(())
    }

    fn store_in_field_of_slot_no_touch(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.region.write_bytes(&[0x48, 0x8b, 0x4c, 0x24, 0x08]); // mov rcx, [rsp+8]
        self.mov_reg_mem(Reg64::RCX, Reg64::RCX, offset);
        self.region.write_bytes(&[
            0x48, 0x03, 0x0c, 0x24, // add rcx, [rsp]
            0x48, 0x89, 0x01, // mov [rcx], rax
            0x48, 0x89, 0x51, 0x08, // mov [rcx+8], rdx
            0x59, 0x59, // pop rcx; pop rcx
        ]);
        Ok(())
    }

    fn set_value(&mut self, type_of: Placeholder, value: Placeholder) {
        self.lea_rip_placeholder(Reg64::RAX, value);
        self.lea_rip_placeholder(Reg64::RDX, type_of);
    }

    fn set_immediate_value(&mut self, type_of: Placeholder, value: i64) -> Result<()> {
        self.mov_rax_imm(value);
        self.lea_rip_placeholder(Reg64::RDX, type_of);
        Ok(())
    }

    fn set_only_value(&mut self, value: i64) -> Result<()> {
        self.mov_rax_imm(value);
        self.region.write_bytes(&[0x48, 0x31, 0xd2]); // xor rdx, rdx
        Ok(())
    }

    fn set_type_part(&mut self, type_of: Placeholder) {
        self.lea_rip_placeholder(Reg64::RDX, type_of);
    }

    fn break_point(&mut self) {
        self.region.write_u8(0xcc); // int3
    }

    fn jump(&mut self, token: &mut JumpToken) {
        self.region.write_u8(0xe9); // jmp rel32
        self.jump_site(token);
    }

    fn jump_if_true(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x48, 0x21, 0xc0, // and rax, rax
            0x0f, 0x85, // jnz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_false(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x48, 0x21, 0xc0, // and rax, rax
            0x0f, 0x84, // jz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_assigned(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x48, 0x21, 0xd2, // and rdx, rdx
            0x0f, 0x85, // jnz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_unassigned(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x48, 0x21, 0xd2, // and rdx, rdx
            0x0f, 0x84, // jz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_not_marked(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x48, 0xf7, 0xc2, 0x01, 0x00, 0x00, 0x00, // test rdx, 1
            0x0f, 0x84, // jz rel32
        ]);
        self.jump_site(token);
    }

    fn set_destination(&mut self, token: &mut JumpToken) {
        let location = self.region.current_location();
        token.set_destination(self.region, location);
    }

    fn set_destination_cell(&mut self, cell: &PlaceholderCell) {
        cell.set(self.region.current_location());
    }

    fn call_built_in(&mut self, indirect_function: Placeholder, arguments: &[Placeholder]) {
        // Spilled arguments leave the stack 16-byte aligned only in pairs:
        // one zero padding slot first when the spill count is odd.
        let spills = arguments.len().saturating_sub(ARG_REGS.len());
        let mut stack_reserve = 0usize;
        if spills % 2 == 1 {
            stack_reserve += 1;
            self.region.write_bytes(&[0x6a, 0x00]); // push 0
        }
        for argument in arguments.iter().skip(ARG_REGS.len()).rev() {
            stack_reserve += 1;
            self.lea_rip_placeholder(Reg64::RAX, *argument);
            self.region.write_u8(0x50); // push rax
        }
        for index in (0..arguments.len().min(ARG_REGS.len())).rev() {
            self.lea_rip_placeholder(ARG_REGS[index], arguments[index]);
        }
        self.lea_rip_placeholder(Reg64::R11, indirect_function);
        self.region.write_bytes(&[0x41, 0xff, 0x13]); // call [r11]
        if stack_reserve > 0 {
            self.region.write_bytes(&[0x48, 0x81, 0xc4]); // add rsp, imm32
            self.region.write_i32(stack_reserve as i64 * 8);
        }
    }

    fn jump_built_in(&mut self, indirect_function: Placeholder) {
        self.lea_rip_placeholder(Reg64::R11, indirect_function);
        self.region.write_bytes(&[0x41, 0xff, 0x23]); // jmp [r11]
    }

    fn type_conversion(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.region.write_bytes(&[0x48, 0x21, 0xd2]); // and rdx, rdx
        if Abi::fits_disp8(offset.into()) {
            self.region.write_bytes(&[0x74, 0x04]); // je past the 4-byte mov
        } else {
            self.region.write_bytes(&[0x74, 0x07]); // je past the 7-byte mov
        }
        self.mov_reg_mem(Reg64::RDX, Reg64::RDX, offset);
        Ok(())
    }

    fn type_conversion_not_null(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.mov_reg_mem(Reg64::RDX, Reg64::RDX, offset);
        Ok(())
    }

    fn type_conversion_dynamic_not_null(&mut self, type_id: i64) {
        self.region.write_bytes(&[
            0x48, 0x8b, 0x4a, 0x08, // mov rcx, [rdx+8]
            0x52, // push rdx
            0x50, // push rax
            0x48, 0x31, 0xd2, // xor rdx, rdx
            0x48, 0xb8, // mov rax, imm64
        ]);
        self.region.write_i64(type_id);
        self.region.write_bytes(&[
            0x52, // push rdx
            0x50, // push rax
            0xff, 0xd1, // call rcx
        ]);
    }

    fn raw(&mut self, code: &[u8]) {
        self.region.write_bytes(code);
    }

    fn boolean_not(&mut self) {
        self.region.write_bytes(&[0x48, 0x83, 0xf0, 0x01]); // xor rax, 1
    }

    fn is_not_null(&mut self) {
        let mut zero_jump = JumpToken::new();
        self.region.write_bytes(&[
            0x48, 0x31, 0xc0, // xor rax, rax
            0x48, 0x21, 0xd2, // and rdx, rdx
            0x0f, 0x84, // jz rel32
        ]);
        self.jump_site(&mut zero_jump);
        self.region.write_bytes(&[0x48, 0x83, 0xf0, 0x01]); // xor rax, 1
        let location = self.region.current_location();
        zero_jump.set_destination(self.region, location);
    }

    fn setup_native_return_space(&mut self) {}

    fn setup_native_stack_frame_argument(&mut self, argument_count: usize) {
        match argument_count {
            0 => self.region.write_bytes(&[0x48, 0x89, 0xef]), // mov rdi, rbp
            1 => self.region.write_bytes(&[0x48, 0x89, 0xea]), // mov rdx, rbp
            2 => self.region.write_bytes(&[0x49, 0x89, 0xe8]), // mov r8, rbp
            _ => self.region.write_bytes(&[0x55, 0x55]),       // push rbp; push rbp
        }
    }

    fn call_native(
        &mut self,
        function: Placeholder,
        argument_count: usize,
        stack_frame: bool,
        trampoline: bool,
    ) {
        self.lea_rip_placeholder(Reg64::R11, function);
        if trampoline {
            assert!(!stack_frame && argument_count == 0);
            self.region.write_bytes(&[0x41, 0xff, 0x23]); // jmp [r11]
        } else {
            self.region.write_bytes(&[0x41, 0xff, 0x13]); // call [r11]
        }
        if argument_count >= 3 {
            // the spilled stack-frame words from the setup
            self.region.write_bytes(&[0x59, 0x59]); // pop rcx; pop rcx
        }
    }

    fn set_native_argument(&mut self, slot: usize, index: usize, count: usize) -> Result<()> {
        // reverse argument order for the native convention
        assert!(index < count);
        let index = count - index - 1;
        let lsdw = self.frame_offset(slot)?;
        let msdw = narrow_offset(i64::from(lsdw) + 8)?;
        if let Some(&(value_reg, type_reg)) = ARG_PAIRS.get(index) {
            self.mov_reg_mem(value_reg, Reg64::RBP, lsdw);
            self.mov_reg_mem(type_reg, Reg64::RBP, msdw);
        } else {
            self.push_frame_word(msdw);
            self.push_frame_word(lsdw);
        }
        Ok(())
    }

    fn pop_native_argument(&mut self) {
        self.region.write_bytes(&[0x5e, 0x5f]); // pop rsi; pop rdi
    }

    fn crash_if_null(&mut self) {
        self.region.write_bytes(&[0x48, 0x8b, 0x0a]); // mov rcx, [rdx]
    }

    fn integer_negate(&mut self) {
        self.region.write_bytes(&[0x48, 0xf7, 0xd8]); // neg rax
    }

    fn integer_equals(&mut self) {
        self.integer_compare(0x75); // jne
    }

    fn integer_not_equals(&mut self) {
        self.integer_compare(0x74); // je
    }

    fn integer_greater_than(&mut self) {
        self.integer_compare(0x7e); // jle
    }

    fn integer_less_than(&mut self) {
        self.integer_compare(0x7d); // jge
    }

    fn integer_greater_equals(&mut self) {
        self.integer_compare(0x7c); // jl
    }

    fn integer_less_equals(&mut self) {
        self.integer_compare(0x7f); // jg
    }

    fn integer_add(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x58, // pop rax
            0x48, 0x01, 0xd0, // add rax, rdx
            0x5a, // pop rdx
        ]);
    }

    fn integer_subtract(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x58, // pop rax
            0x48, 0x29, 0xd0, // sub rax, rdx
            0x5a, // pop rdx
        ]);
    }

    fn integer_left(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc1, // mov rcx, rax
            0x58, // pop rax
            0x48, 0xd3, 0xe0, // sal rax, cl
            0x5a, // pop rdx
        ]);
    }

    fn integer_right(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc1, // mov rcx, rax
            0x58, // pop rax
            0x48, 0xd3, 0xf8, // sar rax, cl
            0x5a, // pop rdx
        ]);
    }

    fn integer_multiply(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x58, // pop rax
            0x48, 0xf7, 0xea, // imul rdx
            0x5a, // pop rdx
        ]);
    }

    fn integer_divide(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc1, // mov rcx, rax
            0x58, // pop rax
            0x48, 0x99, // cqo
            0x48, 0xf7, 0xf9, // idiv rcx
            0x5a, // pop rdx
        ]);
    }

    fn integer_modulo(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc1, // mov rcx, rax
            0x58, // pop rax
            0x48, 0x99, // cqo
            0x48, 0xf7, 0xf9, // idiv rcx
            0x48, 0x89, 0xd0, // mov rax, rdx
            0x5a, // pop rdx
        ]);
    }

    fn check_overflow(&mut self, overflow_handler: Placeholder) -> Placeholder {
        self.region.write_bytes(&[0x71, 0x0a]); // jno past the lea+call
        self.lea_rip_placeholder(Reg64::R11, overflow_handler);
        self.region.write_bytes(&[0x41, 0xff, 0x13]); // call [r11]
        self.region.current_location()
    }

    fn array_fetch_byte(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x58, // pop rax
            0x48, 0x8b, 0x00, // mov rax, [rax]
            0x8a, 0x04, 0x10, // mov al, [rax+rdx]
            0x48, 0x0f, 0xbe, 0xc0, // movsx rax, al
            0x5a, // pop rdx
        ]);
    }

    fn array_store_byte(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc1, // mov rcx, rax
            0x58, // pop rax
            0x5a, // pop rdx
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x58, // pop rax
            0x48, 0x8b, 0x00, // mov rax, [rax]
            0x88, 0x0c, 0x10, // mov [rax+rdx], cl
            0x5a, // pop rdx
        ]);
    }

    fn array_fetch_int(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x58, // pop rax
            0x48, 0x8b, 0x00, // mov rax, [rax]
            0x48, 0x8b, 0x04, 0xd0, // mov rax, [rax+rdx*8]
            0x5a, // pop rdx
        ]);
    }

    fn array_store_int(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x89, 0xc1, // mov rcx, rax
            0x58, // pop rax
            0x5a, // pop rdx
            0x48, 0x89, 0xc2, // mov rdx, rax
            0x58, // pop rax
            0x48, 0x8b, 0x00, // mov rax, [rax]
            0x48, 0x89, 0x0c, 0xd0, // mov [rax+rdx*8], rcx
            0x5a, // pop rdx
        ]);
    }

    fn exception_handler_setup(&mut self, site: &PlaceholderCell) {
        self.handler_scopes += 1;
        self.region.write_bytes(&[
            0x48, 0x31, 0xc9, // xor rcx, rcx
            0x51, // push rcx        (padding word)
        ]);
        self.lea_rip(Reg64::RCX); // lea rcx, [rip+site]
        self.region.write_placeholder_cell(site, RelocMode::Relative32);
        self.region.write_bytes(&[
            0x51, // push rcx        (handler entry)
            0x48, 0x31, 0xc9, // xor rcx, rcx
            0x51, // push rcx        (marker word, zero)
            0xff, 0x75, 0x00, // push [rbp]      (link word)
            0x48, 0x89, 0x65, 0x00, // mov [rbp], rsp
        ]);
    }

    fn exception_handler_remove(&mut self) {
        assert!(self.handler_scopes > 0, "no exception handler scope open");
        self.handler_scopes -= 1;
        self.region.write_bytes(&[
            0x8f, 0x45, 0x00, // pop [rbp]
            0x59, 0x59, 0x59, // pop rcx x3
        ]);
    }

    fn exception_handler_invoke(&mut self) {
        self.region.write_bytes(&[
            0x48, 0x8b, 0x4d, 0x00, // walk: mov rcx, [rbp]
            0x48, 0x8b, 0x49, HandlerRecord::marker_disp(WordWidth::W64), // mov rcx, [rcx+marker]
            0x48, 0x85, 0xc9, // test rcx, rcx
            0x74, 0x06, // je found
            0x48, 0x8b, 0x6d, 0x00, // mov rbp, [rbp]
            0xeb, 0xed, // jmp walk
            0x48, 0x8b, 0x4d, 0x00, // found: mov rcx, [rbp]
            0x48, 0x89, 0xcc, // mov rsp, rcx
            0x8f, 0x45, 0x00, // pop [rbp]
            0x59, // pop rcx         (marker word)
            0x41, 0x5b, // pop r11    (handler entry)
            0x59, // pop rcx         (padding word)
            0x41, 0xff, 0xe3, // jmp r11
        ]);
    }

    fn load(&mut self, location: Placeholder) {
        self.lea_rip_placeholder(Reg64::RCX, location);
        self.region.write_bytes(&[
            0x48, 0x8b, 0x01, // mov rax, [rcx]
            0x48, 0x8b, 0x51, 0x08, // mov rdx, [rcx+8]
        ]);
    }

    fn store(&mut self, location: Placeholder) {
        self.lea_rip_placeholder(Reg64::RCX, location);
        self.region.write_bytes(&[
            0x48, 0x89, 0x01, // mov [rcx], rax
            0x48, 0x89, 0x51, 0x08, // mov [rcx+8], rdx
        ]);
    }

    fn setup_fpu(&mut self) {
        self.region.write_bytes(&[
            0x9b, 0xdb, 0xe2, // fclex
            0x48, 0xc7, 0xc0, 0x3f, 0x13, 0x00, 0x00, // mov rax, 0x133f
            0x50, // push rax
            0x48, 0x8d, 0x04, 0x24, // lea rax, [rsp]
            0xd9, 0x28, // fldcw [rax]
            0x58, // pop rax
        ]);
    }

    fn mark_type(&mut self) {
        self.region.write_bytes(&[0x48, 0x83, 0xca, 0x01]); // or rdx, 1
    }

    fn unmark_type(&mut self) {
        self.region.write_bytes(&[0x48, 0x83, 0xe2, 0xfe]); // and rdx, -2
    }
}
