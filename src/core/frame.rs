//! Stack frame layout for one method.
//!
//! Every variable a method names gets an 8-byte slot; slots are handed out in
//! sorted-name order so the layout is deterministic. The total is rounded up
//! to 16 bytes. Methods that contain a stack-hungry intrinsic get an extra
//! reserve added before the rounding.

use std::collections::BTreeMap;

use super::error::{CompileError, CompileResult};
use crate::ir::{visit, Method};

/// Size of one variable slot.
pub const VAR_SLOT_SIZE: u32 = 8;

/// Required alignment of the frame.
pub const STACK_ALIGNMENT: u32 = 16;

/// Offsets of every variable relative to the stack pointer after the prologue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    offsets: BTreeMap<String, i32>,
    var_frame_size: u32,
    frame_size: u32,
    reserve: u32,
}

impl FrameLayout {
    /// Lay out `method`. `intrinsic_reserve` is added when the method
    /// contains a printf at any depth.
    pub fn compute(method: &Method, intrinsic_reserve: u32) -> CompileResult<Self> {
        let names = visit::collect_variables(method);

        let var_bytes = names.len() as u64 * VAR_SLOT_SIZE as u64;
        let reserve = if visit::contains_printf(method) {
            intrinsic_reserve
        } else {
            0
        };
        let total = align_to(var_bytes + reserve as u64, STACK_ALIGNMENT as u64);
        if total > i32::MAX as u64 {
            return Err(CompileError::FrameTooLarge { size: total });
        }

        let offsets = names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name, idx as i32 * VAR_SLOT_SIZE as i32))
            .collect();

        Ok(Self {
            offsets,
            var_frame_size: var_bytes as u32,
            frame_size: total as u32,
            reserve,
        })
    }

    /// Offset of a variable.
    pub fn offset(&self, name: &str) -> CompileResult<i32> {
        self.offsets
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnknownVariable {
                name: name.to_string(),
            })
    }

    /// Bytes used by variable slots.
    pub fn var_frame_size(&self) -> u32 {
        self.var_frame_size
    }

    /// Total stack adjustment, 16-byte aligned.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Intrinsic reserve included in the frame.
    pub fn reserve(&self) -> u32 {
        self.reserve
    }

    pub fn variable_count(&self) -> usize {
        self.offsets.len()
    }
}

pub fn align_to(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}
