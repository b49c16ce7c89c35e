//! Assembler Contract
//!
//! The ISA-neutral instruction surface the semantic layer drives. One
//! assembler instance emits one function body into one code region; the
//! two concrete encoders live in [`crate::x86`] and [`crate::x64`].
//!
//! The interface is deliberately abstract over registers: the result of
//! the previous operation is kept in the *accumulator* — an implicit
//! dual-word value (value word plus type-tag word) that the next
//! operation consumes. Values move between the accumulator, frame slots
//! and a dual-word operand stack; both words always travel together
//! unless an operation says otherwise.
//!
//! Lifecycle per function: an assembler is constructed from a sealed
//! [`FrameLayout`](crate::frame::FrameLayout) (the declaring state), then
//! `start_function` emits the prologue, body operations follow, and
//! `stop_function` emits the epilogue and is terminal.

use crate::jump::JumpToken;
use crate::region::{Placeholder, PlaceholderCell, Region};
use crate::Result;

/// ISA-neutral instruction emission for one function body.
pub trait Assembler {
    /// The region this assembler emits into.
    fn region(&self) -> &Region;

    /// Mutable access to the region, for interleaved data writes and
    /// location captures by the driving layer.
    fn region_mut(&mut self) -> &mut Region;

    /// One more than the highest declared slot, for closures that need
    /// the frame's total width.
    fn slot_count(&self) -> usize;

    /// Prepare stack and context so stack traces and the collector see a
    /// well-formed chain root. Emitted before the prologue of the
    /// program entry function only.
    fn stack_root(&mut self);

    /// Emit the prologue: stack frame setup and zero-initialized storage
    /// for every variable slot.
    fn start_function(&mut self);

    /// Emit the epilogue: restore the caller frame and pop the caller's
    /// arguments (callee cleanup). Terminal.
    fn stop_function(&mut self);

    /// Load the dual word in `slot` into the accumulator.
    fn retrieve_variable(&mut self, slot: usize) -> Result<()>;

    /// Store the accumulator into `slot`.
    fn store_variable(&mut self, slot: usize) -> Result<()>;

    /// Fetch the `slot`th field of the object in the accumulator into the
    /// accumulator, indexed through the object's type table.
    fn fetch_field(&mut self, slot: usize) -> Result<()>;

    /// Fetch the `slot`th entry of the accumulator's type table into the
    /// type part of the accumulator, preserving the value part.
    fn fetch_method(&mut self, slot: usize) -> Result<()>;

    /// Push the accumulator onto the operand stack.
    fn push_value(&mut self);

    /// Pop the operand stack into the accumulator.
    fn pop_value(&mut self);

    /// Read the dual word `depth` slots down the operand stack into the
    /// accumulator without removing it.
    fn peek_value(&mut self, depth: usize) -> Result<()>;

    /// Discard the top dual word of the operand stack.
    fn drop_stack_top(&mut self);

    /// Push only the value part of the accumulator (calling-convention
    /// conversions).
    fn push_value_part(&mut self);

    /// Call the method pushed as the zeroth argument; arguments were
    /// pushed left to right. Returns the return site, for call traces.
    fn call_from_stack(&mut self, parameter_count: usize) -> Result<Placeholder>;

    /// Call the function starting at `function`. Returns the return site.
    fn call_direct(&mut self, function: Placeholder) -> Placeholder;

    /// Load `method_struct` as the accumulator's type part and clear the
    /// value part. Only suited to static methods.
    fn load_method_struct(&mut self, method_struct: Placeholder);

    /// Call the allocator for `size` bytes and place (memory, `type_of`)
    /// in the accumulator. Also synthesizes a fake call frame so stack
    /// walking sees a consistent chain through the allocator.
    fn call_allocator(&mut self, allocator: Placeholder, size: i32, type_of: Placeholder);

    /// Mark the accumulator as the null/unassigned sentinel: both words
    /// zero.
    fn empty(&mut self);

    /// Store the accumulator into field `slot` of the object on top of
    /// the operand stack, then invoke the collector's write barrier
    /// through `touch`.
    fn store_in_field_of_slot(&mut self, touch: Placeholder, slot: usize) -> Result<()>;

    /// As [`store_in_field_of_slot`](Self::store_in_field_of_slot), for
    /// field types the collector does not track.
    fn store_in_field_of_slot_no_touch(&mut self, slot: usize) -> Result<()>;

    /// Load the literal dual word (`value`, `type_of`), both placeholders.
    fn set_value(&mut self, type_of: Placeholder, value: Placeholder);

    /// Load the literal dual word (`value`, `type_of`) with an immediate
    /// value word.
    fn set_immediate_value(&mut self, type_of: Placeholder, value: i64) -> Result<()>;

    /// Load an immediate value word and clear the type word.
    fn set_only_value(&mut self, value: i64) -> Result<()>;

    /// Overwrite the type part of the accumulator.
    fn set_type_part(&mut self, type_of: Placeholder);

    /// Runtime breakpoint.
    fn break_point(&mut self);

    /// Unconditional jump to the token's destination; forward or
    /// backward, local to this assembler.
    fn jump(&mut self, token: &mut JumpToken);

    /// Jump when the accumulator's value word is true.
    fn jump_if_true(&mut self, token: &mut JumpToken);

    /// Jump when the accumulator's value word is false.
    fn jump_if_false(&mut self, token: &mut JumpToken);

    /// Jump when the accumulator's type word is assigned (non-null).
    fn jump_if_assigned(&mut self, token: &mut JumpToken);

    /// Jump when the accumulator's type word is the null sentinel.
    fn jump_if_unassigned(&mut self, token: &mut JumpToken);

    /// Jump when bit 0 of the type word is clear (no return is unwinding
    /// through the current handler).
    fn jump_if_not_marked(&mut self, token: &mut JumpToken);

    /// Fresh token for [`jump`](Self::jump) and friends.
    fn create_jump_token(&self) -> JumpToken {
        JumpToken::new()
    }

    /// Associate `token`'s destination with the current code position.
    fn set_destination(&mut self, token: &mut JumpToken);

    /// Bind `cell` to the current code position.
    fn set_destination_cell(&mut self, cell: &PlaceholderCell);

    /// Call through a pointer to a function pointer, native ABI, with
    /// single-word `arguments` in declaration order.
    fn call_built_in(&mut self, indirect_function: Placeholder, arguments: &[Placeholder]);

    /// Jump through a pointer to a function pointer.
    fn jump_built_in(&mut self, indirect_function: Placeholder);

    /// Convert the accumulator through entry `slot` of its type table;
    /// leaves null untouched. Down casts only.
    fn type_conversion(&mut self, slot: usize) -> Result<()>;

    /// As [`type_conversion`](Self::type_conversion) when the value is
    /// statically known not to be null.
    fn type_conversion_not_null(&mut self, slot: usize) -> Result<()>;

    /// Convert through the type's dynamic cast hook with a type-name id;
    /// clears the accumulator when the id is unsupported.
    fn type_conversion_dynamic_not_null(&mut self, type_id: i64);

    /// Write the supplied opcode bytes verbatim. Non-portable escape.
    fn raw(&mut self, code: &[u8]);

    /// Invert the accumulator's value word as a boolean.
    fn boolean_not(&mut self);

    /// Test the accumulator for nullness; leaves a boolean value word.
    fn is_not_null(&mut self);

    /// Reserve native return space where the convention wants a hidden
    /// out-pointer for two-register results.
    fn setup_native_return_space(&mut self);

    /// Pass the current frame pointer as a native stack-frame argument.
    fn setup_native_stack_frame_argument(&mut self, argument_count: usize);

    /// Call a native function whose dual-word arguments were marshalled
    /// by [`set_native_argument`](Self::set_native_argument). The
    /// trampoline mode tail-jumps instead of calling.
    fn call_native(
        &mut self,
        function: Placeholder,
        argument_count: usize,
        stack_frame: bool,
        trampoline: bool,
    );

    /// Marshal the dual word in `slot` down to native argument `index` of
    /// `count`, in reverse declaration order per the native convention.
    fn set_native_argument(&mut self, slot: usize, index: usize, count: usize) -> Result<()>;

    /// Drop a marshalled native argument after the call where the
    /// convention needs it.
    fn pop_native_argument(&mut self);

    /// Dereference the type word so a null accumulator faults here, at a
    /// known instruction, instead of somewhere later.
    fn crash_if_null(&mut self);

    /// Arithmetic on the integer value word; type words are ignored.
    fn integer_negate(&mut self);
    fn integer_equals(&mut self);
    fn integer_not_equals(&mut self);
    fn integer_greater_than(&mut self);
    fn integer_less_than(&mut self);
    fn integer_greater_equals(&mut self);
    fn integer_less_equals(&mut self);
    fn integer_add(&mut self);
    fn integer_subtract(&mut self);
    fn integer_left(&mut self);
    fn integer_right(&mut self);
    fn integer_multiply(&mut self);
    fn integer_divide(&mut self);
    fn integer_modulo(&mut self);

    /// Call `overflow_handler` if the preceding arithmetic operation set
    /// the overflow flag; the accumulator is untouched otherwise. Returns
    /// the return site of the handler call.
    fn check_overflow(&mut self, overflow_handler: Placeholder) -> Placeholder;

    /// Unchecked array access through one level of header indirection:
    /// the array object holds a pointer to its payload.
    fn array_fetch_byte(&mut self);
    fn array_store_byte(&mut self);
    fn array_fetch_int(&mut self);
    fn array_store_int(&mut self);

    /// Open a handler scope: push a handler record whose entry address is
    /// bound later through `site`, and hook it into the chain.
    fn exception_handler_setup(&mut self, site: &PlaceholderCell);

    /// Close the innermost handler scope, unlinking its record.
    fn exception_handler_remove(&mut self);

    /// Unwind to the innermost handler record reachable through saved
    /// frame pointers and jump to its entry.
    fn exception_handler_invoke(&mut self);

    /// Load the accumulator from the dual word at `location`.
    fn load(&mut self, location: Placeholder);

    /// Store the accumulator into the dual word at `location`.
    fn store(&mut self, location: Placeholder);

    /// Reset the floating-point control word to the runtime's default.
    fn setup_fpu(&mut self);

    /// Set bit 0 of the type word: a return is unwinding through the
    /// current handler. The bit is free because type pointers are
    /// aligned.
    fn mark_type(&mut self);

    /// Clear bit 0 of the type word.
    fn unmark_type(&mut self);
}
