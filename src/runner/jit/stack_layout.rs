//! Frame layout of a JIT-compiled function.
//!
//! ```text
//!                  +---------------------------+
//!                  | return address / lr       |
//!      fp -->      | saved frame pointer       |
//!                  | saved context register    |
//!  locals -->      | saved locals register     |
//!                  +---------------------------+
//!                  | temp 0 .. temp n-1        |  8 bytes each, boxed
//!                  +---------------------------+
//!                  | call arguments            |  max_call_args Values
//!                  +---------------------------+
//!                  | saved registers as Values |
//!                  +---------------------------+
//!                  | padding                   |
//!                  | outgoing stack arguments  |
//!      sp -->      | shadow space              |
//!                  +---------------------------+
//! ```
//!
//! The frame is sized so that `sp` meets the target's call alignment after
//! the prologue.

use crate::runner::jit::masm::Reg;
use crate::runner::jit::target::TargetDescriptor;

/// Largest number of native arguments any runtime call takes.
pub const MAX_RUNTIME_CALL_ARGS: u32 = 6;

/// Callee-saved registers pushed after the frame pointer.
const SAVED_REGISTER_COUNT: u32 = 2;

/// A memory operand, `[base + offset]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Reg,
    pub offset: i32,
}

impl Address {
    pub fn new(base: Reg, offset: i32) -> Self {
        Address { base, offset }
    }
}

#[derive(Debug, Clone)]
pub struct StackLayout {
    frame_pointer: Reg,
    stack_pointer: Reg,
    locals_register: Reg,
    pointer_size: u32,
    shadow_space: u32,
    alignment: u32,
    stack_argument_slots: u32,
    temp_count: u32,
    max_call_args: u32,
    saved_value_count: u32,
}

impl StackLayout {
    pub fn new(target: &dyn TargetDescriptor, temp_count: u32, max_call_args: u32, saved_value_count: u32) -> Self {
        let register_args = target.argument_register_count() as u32;
        StackLayout {
            frame_pointer: target.frame_pointer(),
            stack_pointer: target.stack_pointer(),
            locals_register: target.locals_register(),
            pointer_size: target.pointer_size(),
            shadow_space: target.shadow_space(),
            alignment: target.stack_alignment(),
            stack_argument_slots: MAX_RUNTIME_CALL_ARGS.saturating_sub(register_args),
            temp_count,
            max_call_args,
            saved_value_count,
        }
    }

    /// Bytes pushed by the call and the prologue before the frame is
    /// allocated.
    pub fn header_size(&self) -> u32 {
        self.pointer_size * (2 + SAVED_REGISTER_COUNT)
    }

    fn body_size(&self) -> u32 {
        8 * (self.temp_count + self.max_call_args + self.saved_value_count)
            + self.shadow_space
            + self.pointer_size * self.stack_argument_slots
    }

    /// What the prologue subtracts from `sp` after pushing the saved
    /// registers.
    pub fn calculate_stack_frame_size(&self) -> u32 {
        let total = self.header_size() + self.body_size();
        let aligned = (total + self.alignment - 1) / self.alignment * self.alignment;
        aligned - self.header_size()
    }

    /// Offset of the locals base from the frame pointer.
    pub fn locals_offset(&self) -> i32 {
        -((self.pointer_size * SAVED_REGISTER_COUNT) as i32)
    }

    /// Where the callee-saved registers live, relative to the frame pointer.
    pub fn saved_register_offsets(&self) -> [i32; 2] {
        let p = self.pointer_size as i32;
        [-p, -2 * p]
    }

    pub fn stack_slot_pointer(&self, temp: u32) -> Address {
        Address::new(self.locals_register, -8 * (temp as i32 + 1))
    }

    fn call_args_base(&self) -> i32 {
        self.locals_offset() - 8 * (self.temp_count + self.max_call_args) as i32
    }

    /// Slot `index` of the argument array handed to calls.
    pub fn call_argument(&self, index: u32) -> Address {
        Address::new(self.frame_pointer, self.call_args_base() + 8 * index as i32)
    }

    pub fn call_arguments_base(&self) -> Address {
        self.call_argument(0)
    }

    pub fn saved_register_pointer(&self, index: u32) -> Address {
        Address::new(self.frame_pointer, self.call_args_base() - 8 * (index as i32 + 1))
    }

    /// Native argument `index` past the register arguments, at call time.
    pub fn outgoing_stack_argument(&self, index: u32) -> Address {
        Address::new(
            self.stack_pointer,
            (self.shadow_space + index * self.pointer_size) as i32,
        )
    }

    /// Where the first stack-passed argument of this function's own caller
    /// is, relative to the frame pointer.
    pub fn incoming_stack_argument(&self, index: u32) -> Address {
        let p = self.pointer_size;
        Address::new(self.frame_pointer, (2 * p + self.shadow_space + index * p) as i32)
    }

    pub fn temp_count(&self) -> u32 {
        self.temp_count
    }

    pub fn max_call_args(&self) -> u32 {
        self.max_call_args
    }

    pub fn stack_argument_slots(&self) -> u32 {
        self.stack_argument_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::config::TargetKind;
    use crate::runner::jit::target::descriptor;

    #[test]
    fn test_frame_keeps_call_alignment() {
        for kind in TargetKind::ALL {
            let d = descriptor(kind);
            for temps in [0, 1, 3, 17] {
                for args in [0, 1, 5] {
                    let l = StackLayout::new(d, temps, args, 2);
                    let total = l.header_size() + l.calculate_stack_frame_size();
                    assert_eq!(total % d.stack_alignment(), 0, "{} {} {}", kind, temps, args);
                    assert!(total >= l.header_size() + l.body_size());
                }
            }
        }
    }

    #[test]
    fn test_x86_64_offsets() {
        let d = descriptor(TargetKind::X86_64SysV);
        let l = StackLayout::new(d, 3, 2, 2);
        assert_eq!(l.locals_offset(), -16);
        assert_eq!(l.stack_slot_pointer(0), Address::new(d.locals_register(), -8));
        assert_eq!(l.stack_slot_pointer(2).offset, -24);
        // fp - 16 - 3 temps - 2 args
        assert_eq!(l.call_argument(0), Address::new(d.frame_pointer(), -56));
        assert_eq!(l.call_argument(1).offset, -48);
        assert_eq!(l.saved_register_pointer(0).offset, -64);
        assert_eq!(l.saved_register_pointer(1).offset, -72);
        assert_eq!(l.stack_argument_slots(), 0);
    }

    #[test]
    fn test_stack_arguments_sit_above_shadow_space() {
        let win = StackLayout::new(descriptor(TargetKind::X86_64Win64), 0, 0, 0);
        assert_eq!(win.stack_argument_slots(), 2);
        assert_eq!(win.outgoing_stack_argument(0).offset, 32);
        assert_eq!(win.outgoing_stack_argument(1).offset, 40);
        let x86 = StackLayout::new(descriptor(TargetKind::X86), 0, 0, 0);
        assert_eq!(x86.stack_argument_slots(), 6);
        assert_eq!(x86.outgoing_stack_argument(2).offset, 8);
        assert_eq!(x86.incoming_stack_argument(0).offset, 8);
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let d = descriptor(TargetKind::X86);
        let l = StackLayout::new(d, 4, 3, 2);
        let frame = (l.header_size() + l.calculate_stack_frame_size()) as i32;
        // fp sits two pointers below the call site
        let sp_from_fp = -(frame - 2 * d.pointer_size() as i32);
        let lowest_saved = l.saved_register_pointer(1).offset;
        let outgoing_top = sp_from_fp + (l.shadow_space + l.stack_argument_slots() * 4) as i32;
        assert!(outgoing_top <= lowest_saved);
    }
}
