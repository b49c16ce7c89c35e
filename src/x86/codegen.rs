//! 32-bit Instruction Encoding
//!
//! [`X86Assembler`] maps the assembler contract to exact x86 bytes.
//!
//! Register discipline: the accumulator lives in eax (value word) and edx
//! (type word); expressions that consume a second value pop it from the
//! operand stack; ecx is scratch. Dual words occupy 8 bytes everywhere.
//! Native calls push every argument word and clean up with an explicit
//! `add esp, n`; Opal calls are callee-cleanup via `ret imm16`.
//!
//! Addresses referenced from code are absolute 32-bit immediates, patched
//! by the relocation pass ([`RelocMode::Absolute`]).

use log::trace;

use super::registers::{modrm, Reg32};
use crate::frame::{narrow_offset, Abi, FrameLayout};
use crate::jump::JumpToken;
use crate::region::{
    PatchWidth, Placeholder, PlaceholderCell, Region, RegionKind, RelocMode, WordWidth,
};
use crate::unwind::HandlerRecord;
use crate::{Assembler, BackendError, Result};

/// The 32-bit encoder. One instance per function body.
pub struct X86Assembler<'a> {
    region: &'a mut Region,
    frame: FrameLayout,
    /// Pass a hidden out-pointer for two-register native results
    /// (32-bit linux cdecl).
    stack_return: bool,
    handler_scopes: usize,
    finished: bool,
}

impl<'a> X86Assembler<'a> {
    pub fn new(region: &'a mut Region, frame: FrameLayout, stack_return: bool) -> Self {
        assert_eq!(region.word_width(), WordWidth::W32);
        assert_eq!(region.kind(), RegionKind::Code);
        Self {
            region,
            frame,
            stack_return,
            handler_scopes: 0,
            finished: false,
        }
    }

    fn frame_offset(&self, slot: usize) -> Result<i32> {
        Abi::X86.frame_offset(&self.frame, slot)
    }

    fn field_offset(&self, slot: usize) -> Result<i32> {
        let offset = slot as i64 * 4;
        i32::try_from(offset).map_err(|_| BackendError::FieldOffsetTooLarge { offset })
    }

    /// mov dst, [base+disp], choosing the disp8 form when it fits.
    fn mov_reg_mem(&mut self, dst: Reg32, base: Reg32, disp: i32) {
        debug_assert!(base != Reg32::ESP);
        self.region.write_u8(0x8b);
        self.mem_operand(dst, base, disp);
    }

    /// mov [base+disp], src.
    fn mov_mem_reg(&mut self, base: Reg32, disp: i32, src: Reg32) {
        debug_assert!(base != Reg32::ESP);
        self.region.write_u8(0x89);
        self.mem_operand(src, base, disp);
    }

    fn mem_operand(&mut self, reg: Reg32, base: Reg32, disp: i32) {
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

    /// push [ebp+disp].
    fn push_frame_word(&mut self, disp: i32) {
        if Abi::fits_disp8(disp.into()) {
            self.region.write_bytes(&[0xff, 0x75]);
            self.region.write_i8(disp.into());
        } else {
            self.region.write_bytes(&[0xff, 0xb5]);
            self.region.write_i32(disp.into());
        }
    }

    /// Reserve a 4-byte branch operand and attach it to the token.
    fn jump_site(&mut self, token: &mut JumpToken) {
        let operand = self.region.current_location();
        self.region.write_i32(0);
        token.add_site(self.region, operand, PatchWidth::W32);
    }
}

impl Assembler for X86Assembler<'_> {
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
            0x8b, 0xec, // mov ebp, esp
            0x55, // push ebp
            0x31, 0xed, // xor ebp, ebp
        ]);
    }

    fn start_function(&mut self) {
        trace!(
            "x86 prologue: {} parameters, {} variables",
            self.frame.parameter_count(),
            self.frame.variable_count()
        );
        self.region.write_bytes(&[
            0x55, // push ebp
            0x8b, 0xec, // mov ebp, esp
        ]);
        if self.frame.variable_count() > 0 {
            self.region.write_bytes(&[0x31, 0xc0]); // xor eax, eax
            for _ in 0..self.frame.variable_count() {
                self.region.write_bytes(&[0x50, 0x50]); // push eax; push eax
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
        self.region.write_bytes(&[
            0x8b, 0xe5, // mov esp, ebp
            0x5d, // pop ebp
        ]);
        if self.frame.parameter_count() > 0 {
            self.region.write_u8(0xc2); // ret imm16
            self.region
                .write_i16(self.frame.parameter_count() as i64 * 8);
        } else {
            self.region.write_u8(0xc3); // ret
        }
    }

    fn retrieve_variable(&mut self, slot: usize) -> Result<()> {
        let lsdw = self.frame_offset(slot)?;
        let msdw = narrow_offset(i64::from(lsdw) + 4)?;
        self.mov_reg_mem(Reg32::EAX, Reg32::EBP, lsdw);
        self.mov_reg_mem(Reg32::EDX, Reg32::EBP, msdw);
        Ok(())
    }

    fn store_variable(&mut self, slot: usize) -> Result<()> {
        let lsdw = self.frame_offset(slot)?;
        let msdw = narrow_offset(i64::from(lsdw) + 4)?;
        self.mov_mem_reg(Reg32::EBP, lsdw, Reg32::EAX);
        self.mov_mem_reg(Reg32::EBP, msdw, Reg32::EDX);
        Ok(())
    }

    fn fetch_field(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.mov_reg_mem(Reg32::ECX, Reg32::EDX, offset);
        self.region.write_bytes(&[
            0x8b, 0x54, 0x01, 0x04, // mov edx, [ecx+eax+4]
            0x8b, 0x04, 0x01, // mov eax, [ecx+eax]
        ]);
        Ok(())
    }

    fn fetch_method(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.mov_reg_mem(Reg32::EDX, Reg32::EDX, offset);
        Ok(())
    }

    fn push_value(&mut self) {
        self.region.write_bytes(&[
            0x52, // push edx
            0x50, // push eax
        ]);
    }

    fn pop_value(&mut self) {
        self.region.write_bytes(&[
            0x58, // pop eax
            0x5a, // pop edx
        ]);
    }

    fn peek_value(&mut self, depth: usize) -> Result<()> {
        let offset = depth as i64 * 8 + 4;
        if !Abi::fits_disp8(offset) {
            return Err(BackendError::StackDepthTooLarge { depth });
        }
        self.region.write_bytes(&[0x8b, 0x44, 0x24]); // mov eax, [esp+disp8]
        self.region.write_i8(offset - 4);
        self.region.write_bytes(&[0x8b, 0x54, 0x24]); // mov edx, [esp+disp8]
        self.region.write_i8(offset);
        Ok(())
    }

    fn drop_stack_top(&mut self) {
        self.region.write_bytes(&[0x59, 0x59]); // pop ecx; pop ecx
    }

    fn push_value_part(&mut self) {
        self.region.write_u8(0x50); // push eax
    }

    fn call_from_stack(&mut self, parameter_count: usize) -> Result<Placeholder> {
        let offset = parameter_count as i64 * 8 + 4;
        if !Abi::fits_disp8(offset) {
            return Err(BackendError::StackDepthTooLarge {
                depth: parameter_count,
            });
        }
        self.region.write_bytes(&[0x8b, 0x44, 0x24]); // mov eax, [esp+disp8]
        self.region.write_i8(offset);
        self.region.write_bytes(&[
            0x8b, 0x50, 0x14, // mov edx, [eax+0x14]
        ]);
        self.region.write_bytes(&[0x89, 0x54, 0x24]); // mov [esp+disp8], edx
        self.region.write_i8(offset);
        self.region.write_bytes(&[0xff, 0x50, 0x10]); // call [eax+0x10]
        Ok(self.region.current_location())
    }

    fn call_direct(&mut self, function: Placeholder) -> Placeholder {
        self.region.write_u8(0xb9); // mov ecx, imm32
        self.region.write_placeholder(function, RelocMode::Absolute);
        self.region.write_bytes(&[0xff, 0xd1]); // call ecx
        self.region.current_location()
    }

    fn load_method_struct(&mut self, method_struct: Placeholder) {
        self.region.write_u8(0xba); // mov edx, imm32
        self.region
            .write_placeholder(method_struct, RelocMode::Absolute);
        self.region.write_bytes(&[0x31, 0xc0]); // xor eax, eax
    }

    fn call_allocator(&mut self, allocator: Placeholder, size: i32, type_of: Placeholder) {
        // fake call frame, so stack walking sees a consistent chain
        self.region.write_bytes(&[
            0x55, // push ebp
            0x55, // push ebp
            0x89, 0xe5, // mov ebp, esp
        ]);
        self.region.write_u8(0x55); // push ebp
        self.region.write_u8(0x68); // push imm32
        self.region.write_i32(0);
        self.region.write_u8(0x68); // push imm32
        self.region.write_i32(size.into());
        self.region.write_bytes(&[0xff, 0x15]); // call [imm32]
        self.region.write_placeholder(allocator, RelocMode::Absolute);
        self.region.write_u8(0xba); // mov edx, imm32
        self.region.write_placeholder(type_of, RelocMode::Absolute);
        self.region.write_bytes(&[0x83, 0xc4, 0x10]); // add esp, 16
        self.region.write_u8(0x5d); // pop ebp
    }

    fn empty(&mut self) {
        self.region.write_bytes(&[
            0x31, 0xc0, // xor eax, eax
            0x31, 0xd2, // xor edx, edx
        ]);
    }

    fn store_in_field_of_slot(&mut self, touch: Placeholder, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.region.write_bytes(&[0x8b, 0x4c, 0x24, 0x04]); // mov ecx, [esp+4]
        self.mov_reg_mem(Reg32::ECX, Reg32::ECX, offset);
        self.region.write_bytes(&[
            0x03, 0x0c, 0x24, // add ecx, [esp]
            0x89, 0x01, // mov [ecx], eax
            0x89, 0x51, 0x04, // mov [ecx+4], edx
            0x51, // push ecx
            0xff, 0x15, // call [imm32]
        ]);
        self.region.write_placeholder(touch, RelocMode::Absolute);
        self.region.write_bytes(&[0x59, 0x59, 0x59]); // pop ecx x3
        Ok(())
    }

    fn store_in_field_of_slot_no_touch(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.region.write_bytes(&[0x8b, 0x4c, 0x24, 0x04]); // mov ecx, [esp+4]
        self.mov_reg_mem(Reg32::ECX, Reg32::ECX, offset);
        self.region.write_bytes(&[
            0x03, 0x0c, 0x24, // add ecx, [esp]
            0x89, 0x01, // mov [ecx], eax
            0x89, 0x51, 0x04, // mov [ecx+4], edx
            0x59, 0x59, // pop ecx; pop ecx
        ]);
        Ok(())
    }

    fn set_value(&mut self, type_of: Placeholder, value: Placeholder) {
        self.region.write_u8(0xb8); // mov eax, imm32
        self.region.write_placeholder(value, RelocMode::Absolute);
        self.region.write_u8(0xba); // mov edx, imm32
        self.region.write_placeholder(type_of, RelocMode::Absolute);
    }

    fn set_immediate_value(&mut self, type_of: Placeholder, value: i64) -> Result<()> {
        if i32::try_from(value).is_err() {
            return Err(BackendError::ImmediateTooWide { value });
        }
        self.region.write_u8(0xb8); // mov eax, imm32
        self.region.write_i32(value);
        self.region.write_u8(0xba); // mov edx, imm32
        self.region.write_placeholder(type_of, RelocMode::Absolute);
        Ok(())
    }

    fn set_only_value(&mut self, value: i64) -> Result<()> {
        if i32::try_from(value).is_err() {
            return Err(BackendError::ImmediateTooWide { value });
        }
        self.region.write_bytes(&[0x31, 0xd2]); // xor edx, edx
        self.region.write_u8(0xb8); // mov eax, imm32
        self.region.write_i32(value);
        Ok(())
    }

    fn set_type_part(&mut self, type_of: Placeholder) {
        self.region.write_u8(0xba); // mov edx, imm32
        self.region.write_placeholder(type_of, RelocMode::Absolute);
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
            0x21, 0xc0, // and eax, eax
            0x0f, 0x85, // jnz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_false(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x21, 0xc0, // and eax, eax
            0x0f, 0x84, // jz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_assigned(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x21, 0xd2, // and edx, edx
            0x0f, 0x85, // jnz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_unassigned(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0x21, 0xd2, // and edx, edx
            0x0f, 0x84, // jz rel32
        ]);
        self.jump_site(token);
    }

    fn jump_if_not_marked(&mut self, token: &mut JumpToken) {
        self.region.write_bytes(&[
            0xf7, 0xc2, 0x01, 0x00, 0x00, 0x00, // test edx, 1
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
        for argument in arguments.iter().rev() {
            self.region.write_u8(0x68); // push imm32
            self.region.write_placeholder(*argument, RelocMode::Absolute);
        }
        self.region.write_bytes(&[0xff, 0x15]); // call [imm32]
        self.region
            .write_placeholder(indirect_function, RelocMode::Absolute);
        if !arguments.is_empty() {
            self.region.write_bytes(&[0x83, 0xc4]); // add esp, imm8
            self.region.write_i8(arguments.len() as i64 * 4);
        }
    }

    fn jump_built_in(&mut self, indirect_function: Placeholder) {
        self.region.write_bytes(&[0xff, 0x25]); // jmp [imm32]
        self.region
            .write_placeholder(indirect_function, RelocMode::Absolute);
    }

    fn type_conversion(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.region.write_bytes(&[0x21, 0xd2]); // and edx, edx
        if Abi::fits_disp8(offset.into()) {
            self.region.write_bytes(&[0x74, 0x03]); // je past the 3-byte mov
        } else {
            self.region.write_bytes(&[0x74, 0x06]); // je past the 6-byte mov
        }
        self.mov_reg_mem(Reg32::EDX, Reg32::EDX, offset);
        Ok(())
    }

    fn type_conversion_not_null(&mut self, slot: usize) -> Result<()> {
        let offset = self.field_offset(slot)?;
        self.mov_reg_mem(Reg32::EDX, Reg32::EDX, offset);
        Ok(())
    }

    fn type_conversion_dynamic_not_null(&mut self, type_id: i64) {
        self.region.write_bytes(&[
            0x8b, 0x4a, 0x04, // mov ecx, [edx+4]
            0x52, // push edx
            0x50, // push eax
            0x31, 0xd2, // xor edx, edx
            0xb8, // mov eax, imm32
        ]);
        self.region.write_i32(type_id);
        self.region.write_bytes(&[
            0x52, // push edx
            0x50, // push eax
            0xff, 0xd1, // call ecx
        ]);
    }

    fn raw(&mut self, code: &[u8]) {
        self.region.write_bytes(code);
    }

    fn boolean_not(&mut self) {
        self.region.write_bytes(&[0x83, 0xf0, 0x01]); // xor eax, 1
    }

    fn is_not_null(&mut self) {
        let mut zero_jump = JumpToken::new();
        self.region.write_bytes(&[
            0x31, 0xc0, // xor eax, eax
            0x21, 0xd2, // and edx, edx
            0x0f, 0x84, // jz rel32
        ]);
        self.jump_site(&mut zero_jump);
        self.region.write_bytes(&[0x83, 0xf0, 0x01]); // xor eax, 1
        let location = self.region.current_location();
        zero_jump.set_destination(self.region, location);
    }

    fn setup_native_return_space(&mut self) {
        if self.stack_return {
            self.region.write_bytes(&[
                0x31, 0xc9, // xor ecx, ecx
                0x51, 0x51, // push ecx; push ecx
            ]);
        }
    }

    fn setup_native_stack_frame_argument(&mut self, _argument_count: usize) {
        self.region.write_u8(0x55); // push ebp
    }

    fn call_native(
        &mut self,
        function: Placeholder,
        argument_count: usize,
        stack_frame: bool,
        trampoline: bool,
    ) {
        let cleanup = (argument_count + usize::from(stack_frame)) as i64 * 4;
        if self.stack_return && !trampoline {
            self.region.write_bytes(&[0x8d, 0x4c, 0x24]); // lea ecx, [esp+imm8]
            self.region.write_i8(cleanup);
            self.region.write_u8(0x51); // push ecx
        }
        self.region.write_u8(0xb9); // mov ecx, imm32
        self.region.write_placeholder(function, RelocMode::Absolute);
        if trampoline {
            assert!(!stack_frame && argument_count == 0);
            self.region.write_bytes(&[0xff, 0x21]); // jmp [ecx]
        } else {
            self.region.write_bytes(&[0xff, 0x11]); // call [ecx]
        }
        if argument_count > 0 {
            self.region.write_bytes(&[0x83, 0xc4]); // add esp, imm8
            self.region.write_i8(cleanup);
        }
        if self.stack_return && !trampoline {
            self.region.write_bytes(&[
                0x58, // pop eax
                0x5a, // pop edx
            ]);
        }
    }

    fn set_native_argument(&mut self, slot: usize, _index: usize, _count: usize) -> Result<()> {
        let lsdw = self.frame_offset(slot)?;
        let msdw = narrow_offset(i64::from(lsdw) + 4)?;
        self.push_frame_word(msdw);
        self.push_frame_word(lsdw);
        Ok(())
    }

    fn pop_native_argument(&mut self) {}

    fn crash_if_null(&mut self) {
        self.region.write_bytes(&[0x8b, 0x0a]); // mov ecx, [edx]
    }

    fn integer_negate(&mut self) {
        self.region.write_bytes(&[0xf7, 0xd8]); // neg eax
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
            0x89, 0xc2, // mov edx, eax
            0x58, // pop eax
            0x01, 0xd0, // add eax, edx
            0x5a, // pop edx
        ]);
    }

    fn integer_subtract(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc2, // mov edx, eax
            0x58, // pop eax
            0x29, 0xd0, // sub eax, edx
            0x5a, // pop edx
        ]);
    }

    fn integer_left(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc1, // mov ecx, eax
            0x58, // pop eax
            0xd3, 0xe0, // sal eax, cl
            0x5a, // pop edx
        ]);
    }

    fn integer_right(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc1, // mov ecx, eax
            0x58, // pop eax
            0xd3, 0xf8, // sar eax, cl
            0x5a, // pop edx
        ]);
    }

    fn integer_multiply(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc2, // mov edx, eax
            0x58, // pop eax
            0xf7, 0xea, // imul edx
            0x5a, // pop edx
        ]);
    }

    fn integer_divide(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc1, // mov ecx, eax
            0x58, // pop eax
            0x99, // cdq
            0xf7, 0xf9, // idiv ecx
            0x5a, // pop edx
        ]);
    }

    fn integer_modulo(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc1, // mov ecx, eax
            0x58, // pop eax
            0x99, // cdq
            0xf7, 0xf9, // idiv ecx
            0x89, 0xd0, // mov eax, edx
            0x5a, // pop edx
        ]);
    }

    fn check_overflow(&mut self, overflow_handler: Placeholder) -> Placeholder {
        self.region.write_bytes(&[
            0x71, 0x06, // jno past the call
            0xff, 0x15, // call [imm32]
        ]);
        self.region
            .write_placeholder(overflow_handler, RelocMode::Absolute);
        self.region.current_location()
    }

    fn array_fetch_byte(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc2, // mov edx, eax
            0x58, // pop eax
            0x8b, 0x00, // mov eax, [eax]
            0x8a, 0x04, 0x02, // mov al, [edx+eax]
            0x0f, 0xb6, 0xc0, // movzx eax, al
            0x5a, // pop edx
        ]);
    }

    fn array_store_byte(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc1, // mov ecx, eax
            0x58, // pop eax
            0x5a, // pop edx
            0x89, 0xc2, // mov edx, eax
            0x58, // pop eax
            0x8b, 0x00, // mov eax, [eax]
            0x88, 0x0c, 0x02, // mov [edx+eax], cl
            0x5a, // pop edx
        ]);
    }

    fn array_fetch_int(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc2, // mov edx, eax
            0x58, // pop eax
            0x8b, 0x00, // mov eax, [eax]
            0x8b, 0x04, 0x90, // mov eax, [eax+edx*4]
            0x5a, // pop edx
        ]);
    }

    fn array_store_int(&mut self) {
        self.region.write_bytes(&[
            0x89, 0xc1, // mov ecx, eax
            0x58, // pop eax
            0x5a, // pop edx
            0x89, 0xc2, // mov edx, eax
            0x58, // pop eax
            0x8b, 0x00, // mov eax, [eax]
            0x89, 0x0c, 0x90, // mov [eax+edx*4], ecx
            0x5a, // pop edx
        ]);
    }

    fn exception_handler_setup(&mut self, site: &PlaceholderCell) {
        self.handler_scopes += 1;
        self.region.write_bytes(&[
            0x31, 0xc9, // xor ecx, ecx
            0x51, // push ecx         (padding word)
        ]);
        self.region.write_u8(0x68); // push imm32      (handler entry)
        self.region.write_placeholder_cell(site, RelocMode::Absolute);
        self.region.write_bytes(&[
            0x51, // push ecx         (marker word, zero)
            0xff, 0x75, 0x00, // push [ebp]       (link word)
            0x89, 0x65, 0x00, // mov [ebp], esp
        ]);
    }

    fn exception_handler_remove(&mut self) {
        assert!(self.handler_scopes > 0, "no exception handler scope open");
        self.handler_scopes -= 1;
        self.region.write_bytes(&[
            0x8f, 0x45, 0x00, // pop [ebp]
            0x59, 0x59, 0x59, // pop ecx x3
        ]);
    }

    fn exception_handler_invoke(&mut self) {
        self.region.write_bytes(&[
            0x8b, 0x4d, 0x00, // walk: mov ecx, [ebp]
            0x8b, 0x49, HandlerRecord::marker_disp(WordWidth::W32), // mov ecx, [ecx+marker]
            0x85, 0xc9, // test ecx, ecx
            0x74, 0x05, // je found
            0x8b, 0x6d, 0x00, // mov ebp, [ebp]
            0xeb, 0xf1, // jmp walk
            0x8b, 0x4d, 0x00, // found: mov ecx, [ebp]
            0x89, 0xcc, // mov esp, ecx
            0x8f, 0x45, 0x00, // pop [ebp]
            0x8b, 0x4c, 0x24, 0x04, // mov ecx, [esp+4]
            0x83, 0xc4, HandlerRecord::bytes_after_unlink(WordWidth::W32), // add esp, 12
            0xff, 0xe1, // jmp ecx
        ]);
    }

    fn load(&mut self, location: Placeholder) {
        self.region.write_u8(0xb9); // mov ecx, imm32
        self.region.write_placeholder(location, RelocMode::Absolute);
        self.region.write_bytes(&[
            0x8b, 0x01, // mov eax, [ecx]
            0x8b, 0x51, 0x04, // mov edx, [ecx+4]
        ]);
    }

    fn store(&mut self, location: Placeholder) {
        self.region.write_u8(0xb9); // mov ecx, imm32
        self.region.write_placeholder(location, RelocMode::Absolute);
        self.region.write_bytes(&[
            0x89, 0x01, // mov [ecx], eax
            0x89, 0x51, 0x04, // mov [ecx+4], edx
        ]);
    }

    fn setup_fpu(&mut self) {
        self.region.write_bytes(&[
            0xdb, 0xe2, // fclex
            0xb8, 0x3f, 0x13, 0x00, 0x00, // mov eax, 0x133f
            0x50, // push eax
            0x8d, 0x04, 0x24, // lea eax, [esp]
            0xd9, 0x28, // fldcw [eax]
            0x58, // pop eax
        ]);
    }

    fn mark_type(&mut self) {
        self.region.write_bytes(&[0x83, 0xca, 0x01]); // or edx, 1
    }

    fn unmark_type(&mut self) {
        self.region.write_bytes(&[0x83, 0xe2, 0xfe]); // and edx, -2
    }
}

impl X86Assembler<'_> {
    /// Compare the popped value with the accumulator, leaving a boolean.
    /// `skip` is the condition that skips the `xor eax, 1`.
    fn integer_compare(&mut self, skip: u8) {
        self.region.write_bytes(&[
            0x89, 0xc2, // mov edx, eax
            0x31, 0xc0, // xor eax, eax
            0x59, // pop ecx
            0x39, 0xd1, // cmp ecx, edx
        ]);
        self.region.write_u8(skip);
        self.region.write_bytes(&[
            0x03, // skip distance
            0x83, 0xf0, 0x01, // xor eax, 1
            0x59, // pop ecx
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionArena;

    fn emit(frame: FrameLayout, f: impl FnOnce(&mut X86Assembler)) -> Vec<u8> {
        let mut arena = RegionArena::new();
        let id = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(id), frame, false);
        f(&mut asm);
        asm.region().bytes().to_vec()
    }

    fn data_placeholder(arena: &mut RegionArena) -> Placeholder {
        let id = arena.add_region(RegionKind::Data, WordWidth::W32);
        arena.region(id).base_location()
    }

    #[test]
    fn prologue_zeroes_variables() {
        let mut frame = FrameLayout::new();
        frame.add_parameter();
        frame.add_variable();
        frame.add_variable();
        let code = emit(frame, |asm| asm.start_function());
        assert_eq!(
            code,
            [0x55, 0x8b, 0xec, 0x31, 0xc0, 0x50, 0x50, 0x50, 0x50]
        );
    }

    #[test]
    fn epilogue_pops_caller_arguments() {
        let mut frame = FrameLayout::new();
        frame.add_parameter();
        frame.add_parameter();
        let code = emit(frame, |asm| asm.stop_function());
        assert_eq!(code, [0x8b, 0xe5, 0x5d, 0xc2, 0x10, 0x00]);
    }

    #[test]
    fn epilogue_without_parameters_is_plain_ret() {
        let code = emit(FrameLayout::new(), |asm| asm.stop_function());
        assert_eq!(code, [0x8b, 0xe5, 0x5d, 0xc3]);
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn double_epilogue_is_fatal() {
        emit(FrameLayout::new(), |asm| {
            asm.stop_function();
            asm.stop_function();
        });
    }

    #[test]
    fn retrieve_variable_uses_short_displacement() {
        let mut frame = FrameLayout::new();
        let p = frame.add_parameter();
        let code = emit(frame, |asm| asm.retrieve_variable(p).unwrap());
        assert_eq!(code, [0x8b, 0x45, 0x08, 0x8b, 0x55, 0x0c]);
    }

    #[test]
    fn retrieve_variable_uses_long_displacement() {
        let mut frame = FrameLayout::new();
        let first = frame.add_parameter();
        for _ in 0..19 {
            frame.add_parameter();
        }
        // slot 0 of 20 parameters sits at +160, past the disp8 range
        let code = emit(frame, |asm| asm.retrieve_variable(first).unwrap());
        assert_eq!(
            code,
            [0x8b, 0x85, 0xa0, 0x00, 0x00, 0x00, 0x8b, 0x95, 0xa4, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn store_variable_mirrors_retrieve() {
        let mut frame = FrameLayout::new();
        let v = frame.add_variable();
        let code = emit(frame, |asm| asm.store_variable(v).unwrap());
        assert_eq!(code, [0x89, 0x45, 0xf8, 0x89, 0x55, 0xfc]);
    }

    #[test]
    fn stack_ops() {
        let code = emit(FrameLayout::new(), |asm| {
            asm.push_value();
            asm.pop_value();
            asm.drop_stack_top();
        });
        assert_eq!(code, [0x52, 0x50, 0x58, 0x5a, 0x59, 0x59]);
    }

    #[test]
    fn peek_value_addresses_both_words() {
        let code = emit(FrameLayout::new(), |asm| asm.peek_value(2).unwrap());
        assert_eq!(code, [0x8b, 0x44, 0x24, 0x10, 0x8b, 0x54, 0x24, 0x14]);
    }

    #[test]
    fn peek_value_depth_limit() {
        let err = {
            let mut arena = RegionArena::new();
            let id = arena.add_region(RegionKind::Code, WordWidth::W32);
            let mut asm = X86Assembler::new(arena.region_mut(id), FrameLayout::new(), false);
            asm.peek_value(16).unwrap_err()
        };
        assert!(matches!(err, BackendError::StackDepthTooLarge { depth: 16 }));
    }

    #[test]
    fn set_immediate_value_records_type_relocation() {
        let mut arena = RegionArena::new();
        let type_of = data_placeholder(&mut arena);
        let id = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(id), FrameLayout::new(), false);
        asm.set_immediate_value(type_of, 42).unwrap();
        assert_eq!(
            asm.region().bytes(),
            [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xba, 0x00, 0x00, 0x00, 0x00]
        );
        let relocs = asm.region().relocations();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].offset, 6);
        assert_eq!(relocs[0].mode, RelocMode::Absolute);
    }

    #[test]
    fn set_immediate_value_rejects_wide_immediates() {
        let mut arena = RegionArena::new();
        let type_of = data_placeholder(&mut arena);
        let id = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(id), FrameLayout::new(), false);
        let err = asm.set_immediate_value(type_of, 1 << 40).unwrap_err();
        assert!(matches!(err, BackendError::ImmediateTooWide { .. }));
    }

    #[test]
    fn integer_add_sequence() {
        let code = emit(FrameLayout::new(), |asm| asm.integer_add());
        assert_eq!(code, [0x89, 0xc2, 0x58, 0x01, 0xd0, 0x5a]);
    }

    #[test]
    fn integer_equals_sequence() {
        let code = emit(FrameLayout::new(), |asm| asm.integer_equals());
        assert_eq!(
            code,
            [0x89, 0xc2, 0x31, 0xc0, 0x59, 0x39, 0xd1, 0x75, 0x03, 0x83, 0xf0, 0x01, 0x59]
        );
    }

    #[test]
    fn forward_conditional_jump_patches() {
        let code = emit(FrameLayout::new(), |asm| {
            let mut token = asm.create_jump_token();
            asm.jump_if_false(&mut token);
            asm.integer_add(); // 6 bytes
            asm.set_destination(&mut token);
        });
        assert_eq!(&code[..4], [0x21, 0xc0, 0x0f, 0x84]);
        let disp = i32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!(disp, 6);
    }

    #[test]
    fn backward_jump_patches() {
        let code = emit(FrameLayout::new(), |asm| {
            let mut token = asm.create_jump_token();
            asm.set_destination(&mut token);
            asm.integer_add();
            asm.jump(&mut token);
        });
        // jmp at 6, operand 7..11, next instruction 11, destination 0
        assert_eq!(code[6], 0xe9);
        let disp = i32::from_le_bytes(code[7..11].try_into().unwrap());
        assert_eq!(disp, -11);
    }

    #[test]
    fn is_not_null_skips_the_invert() {
        let code = emit(FrameLayout::new(), |asm| asm.is_not_null());
        assert_eq!(
            code,
            [0x31, 0xc0, 0x21, 0xd2, 0x0f, 0x84, 0x03, 0x00, 0x00, 0x00, 0x83, 0xf0, 0x01]
        );
    }

    #[test]
    fn check_overflow_skips_handler_call() {
        let mut arena = RegionArena::new();
        let handler = data_placeholder(&mut arena);
        let id = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(id), FrameLayout::new(), false);
        let site = asm.check_overflow(handler);
        assert_eq!(
            asm.region().bytes(),
            [0x71, 0x06, 0xff, 0x15, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(site.offset(), 8);
    }

    #[test]
    fn call_built_in_pushes_reversed() {
        let mut arena = RegionArena::new();
        let f = data_placeholder(&mut arena);
        let a = data_placeholder(&mut arena).increment(4);
        let b = data_placeholder(&mut arena).increment(8);
        let id = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(id), FrameLayout::new(), false);
        asm.call_built_in(f, &[a, b]);
        let code = asm.region().bytes();
        // push b; push a; call [f]; add esp, 8
        assert_eq!(code[0], 0x68);
        assert_eq!(code[5], 0x68);
        assert_eq!(&code[10..12], [0xff, 0x15]);
        assert_eq!(&code[16..19], [0x83, 0xc4, 0x08]);
        let relocs = asm.region().relocations();
        assert_eq!(relocs.len(), 3);
        assert!(matches!(&relocs[0].target,
            crate::region::RelocTarget::Direct(p) if p.offset() == b.offset()));
        assert!(matches!(&relocs[1].target,
            crate::region::RelocTarget::Direct(p) if p.offset() == a.offset()));
    }

    #[test]
    fn call_native_with_stack_return() {
        let mut arena = RegionArena::new();
        let f = data_placeholder(&mut arena);
        let id = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(id), FrameLayout::new(), true);
        asm.call_native(f, 2, false, false);
        assert_eq!(
            asm.region().bytes(),
            [
                0x8d, 0x4c, 0x24, 0x08, // lea ecx, [esp+8]
                0x51, // push ecx
                0xb9, 0x00, 0x00, 0x00, 0x00, // mov ecx, f
                0xff, 0x11, // call [ecx]
                0x83, 0xc4, 0x08, // add esp, 8
                0x58, 0x5a, // pop eax; pop edx
            ]
        );
    }

    #[test]
    #[should_panic]
    fn trampoline_with_arguments_is_fatal() {
        let mut arena = RegionArena::new();
        let f = data_placeholder(&mut arena);
        let id = arena.add_region(RegionKind::Code, WordWidth::W32);
        let mut asm = X86Assembler::new(arena.region_mut(id), FrameLayout::new(), false);
        asm.call_native(f, 1, false, true);
    }

    #[test]
    fn exception_handler_setup_builds_record() {
        let code = emit(FrameLayout::new(), |asm| {
            let site = PlaceholderCell::new();
            asm.exception_handler_setup(&site);
        });
        assert_eq!(
            code,
            [
                0x31, 0xc9, // xor ecx, ecx
                0x51, // push ecx
                0x68, 0x00, 0x00, 0x00, 0x00, // push site
                0x51, // push ecx
                0xff, 0x75, 0x00, // push [ebp]
                0x89, 0x65, 0x00, // mov [ebp], esp
            ]
        );
    }

    #[test]
    fn exception_handler_invoke_walks_the_chain() {
        let code = emit(FrameLayout::new(), |asm| asm.exception_handler_invoke());
        assert_eq!(
            code,
            [
                0x8b, 0x4d, 0x00, 0x8b, 0x49, 0x04, 0x85, 0xc9, 0x74, 0x05, 0x8b, 0x6d, 0x00,
                0xeb, 0xf1, 0x8b, 0x4d, 0x00, 0x89, 0xcc, 0x8f, 0x45, 0x00, 0x8b, 0x4c, 0x24,
                0x04, 0x83, 0xc4, 0x0c, 0xff, 0xe1,
            ]
        );
    }

    #[test]
    #[should_panic(expected = "exception handler scope")]
    fn epilogue_inside_handler_scope_is_fatal() {
        emit(FrameLayout::new(), |asm| {
            let site = PlaceholderCell::new();
            asm.exception_handler_setup(&site);
            asm.stop_function();
        });
    }

    #[test]
    fn mark_and_unmark_type_bit() {
        let code = emit(FrameLayout::new(), |asm| {
            asm.mark_type();
            asm.unmark_type();
        });
        assert_eq!(code, [0x83, 0xca, 0x01, 0x83, 0xe2, 0xfe]);
    }

    #[test]
    fn setup_fpu_resets_control_word() {
        let code = emit(FrameLayout::new(), |asm| asm.setup_fpu());
        assert_eq!(
            code,
            [0xdb, 0xe2, 0xb8, 0x3f, 0x13, 0x00, 0x00, 0x50, 0x8d, 0x04, 0x24, 0xd9, 0x28, 0x58]
        );
    }

    #[test]
    fn stack_root_sequence() {
        let code = emit(FrameLayout::new(), |asm| asm.stack_root());
        assert_eq!(code, [0x8b, 0xec, 0x55, 0x31, 0xed]);
    }
}
