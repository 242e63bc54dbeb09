//! WebAssembly function translation state.
//!
//! The `FuncTranslationState` struct defined in this module is used to keep
//! track of the WebAssembly value and control stacks during the translation
//! of a single function.

use crate::{WasmError, WasmResult};
use cot_codegen::ir::{Block, Value};

/// A control stack frame can be an `if`, a `block` or a `loop`, each one
/// having the following fields:
///
/// - `destination`: reference to the `Block` that will hold the code after
///   the control block;
/// - `num_return_values`: number of values returned by the control block;
/// - `original_stack_size`: size of the value stack at the beginning of the
///   control block.
///
/// The `if` frame additionally records its deferred `else` block, and the
/// `loop` frame its header.
#[derive(Debug)]
pub enum ControlStackFrame {
    /// An `if ... else ... end` region.
    If {
        /// The code after the `end`.
        destination: Block,
        /// The deferred alternative branch.
        else_block: Block,
        /// Values the region leaves on the stack.
        num_return_values: usize,
        /// Stack height at region entry.
        original_stack_size: usize,
        /// Was the exit branched to?
        exit_is_branched_to: bool,
        /// Was the head of the `if` reachable?
        head_is_reachable: bool,
        /// What was the reachability at the end of the consequent? `None`
        /// until an `else` is seen (or the `end` when there is none).
        consequent_ends_reachable: Option<bool>,
    },
    /// A `block ... end` region.
    Block {
        /// The code after the `end`.
        destination: Block,
        /// Values the region leaves on the stack.
        num_return_values: usize,
        /// Stack height at region entry.
        original_stack_size: usize,
        /// Was the exit branched to?
        exit_is_branched_to: bool,
    },
    /// A `loop ... end` region.
    Loop {
        /// The code after the `end`.
        destination: Block,
        /// The loop header; branches to this frame re-enter the loop.
        header: Block,
        /// Values the region leaves on the stack.
        num_return_values: usize,
        /// Stack height at region entry.
        original_stack_size: usize,
    },
}

impl ControlStackFrame {
    /// Values the region leaves on the stack.
    pub fn num_return_values(&self) -> usize {
        match *self {
            ControlStackFrame::If {
                num_return_values, ..
            }
            | ControlStackFrame::Block {
                num_return_values, ..
            }
            | ControlStackFrame::Loop {
                num_return_values, ..
            } => num_return_values,
        }
    }

    /// The block holding the code after the region.
    pub fn following_code(&self) -> Block {
        match *self {
            ControlStackFrame::If { destination, .. }
            | ControlStackFrame::Block { destination, .. }
            | ControlStackFrame::Loop { destination, .. } => destination,
        }
    }

    /// The target of a `br` to this frame: loops branch to their header,
    /// everything else to the continuation.
    pub fn br_destination(&self) -> Block {
        match *self {
            ControlStackFrame::If { destination, .. }
            | ControlStackFrame::Block { destination, .. } => destination,
            ControlStackFrame::Loop { header, .. } => header,
        }
    }

    /// Stack height at region entry.
    pub fn original_stack_size(&self) -> usize {
        match *self {
            ControlStackFrame::If {
                original_stack_size,
                ..
            }
            | ControlStackFrame::Block {
                original_stack_size,
                ..
            }
            | ControlStackFrame::Loop {
                original_stack_size,
                ..
            } => original_stack_size,
        }
    }

    /// Values a `br` to this frame carries: nothing for loops (no loop
    /// parameters), the region results otherwise.
    pub fn num_branch_args(&self) -> usize {
        match *self {
            ControlStackFrame::Loop { .. } => 0,
            _ => self.num_return_values(),
        }
    }

    /// Is this a loop frame?
    pub fn is_loop(&self) -> bool {
        matches!(*self, ControlStackFrame::Loop { .. })
    }

    /// Was the exit branched to?
    pub fn exit_is_branched_to(&self) -> bool {
        match *self {
            ControlStackFrame::If {
                exit_is_branched_to,
                ..
            }
            | ControlStackFrame::Block {
                exit_is_branched_to,
                ..
            } => exit_is_branched_to,
            ControlStackFrame::Loop { .. } => false,
        }
    }

    /// Record that something branched to the exit.
    pub fn set_branched_to_exit(&mut self) {
        match *self {
            ControlStackFrame::If {
                ref mut exit_is_branched_to,
                ..
            }
            | ControlStackFrame::Block {
                ref mut exit_is_branched_to,
                ..
            } => *exit_is_branched_to = true,
            ControlStackFrame::Loop { .. } => {}
        }
    }

    /// Was the head of this frame reachable?
    pub fn head_is_reachable(&self) -> bool {
        match *self {
            ControlStackFrame::If {
                head_is_reachable, ..
            } => head_is_reachable,
            _ => true,
        }
    }
}

/// Contains information passed along during a function's translation: the
/// current value and control stacks, and the reachability state.
pub struct FuncTranslationState {
    /// A stack of values corresponding to the active values in the input
    /// wasm function at this point.
    pub(crate) stack: Vec<Value>,
    /// A stack of active control flow operations at this point in the input
    /// wasm function.
    pub(crate) control_stack: Vec<ControlStackFrame>,
    /// Is the current translation state still reachable? This is false when
    /// translating operators like End, Return, or Unreachable.
    pub(crate) reachable: bool,
}

impl FuncTranslationState {
    /// Construct a new, empty state.
    pub(crate) fn new() -> Self {
        Self {
            stack: Vec::new(),
            control_stack: Vec::new(),
            reachable: true,
        }
    }

    pub(crate) fn clear(&mut self) {
        debug_assert!(self.stack.is_empty());
        debug_assert!(self.control_stack.is_empty());
        self.reachable = true;
    }

    /// True if the current translation state expresses reachable code.
    #[inline]
    pub fn reachable(&self) -> bool {
        self.reachable
    }

    /// Push a value.
    pub(crate) fn push1(&mut self, val: Value) {
        self.stack.push(val);
    }

    /// Pop one value.
    pub(crate) fn pop1(&mut self) -> WasmResult<Value> {
        self.stack.pop().ok_or(WasmError::StackUnderflow)
    }

    /// Pop two values. Return them in the order they were pushed.
    pub(crate) fn pop2(&mut self) -> WasmResult<(Value, Value)> {
        let v2 = self.pop1()?;
        let v1 = self.pop1()?;
        Ok((v1, v2))
    }

    /// Pop three values. Return them in the order they were pushed.
    pub(crate) fn pop3(&mut self) -> WasmResult<(Value, Value, Value)> {
        let v3 = self.pop1()?;
        let v2 = self.pop1()?;
        let v1 = self.pop1()?;
        Ok((v1, v2, v3))
    }

    /// Pop the top `n` values on the stack.
    pub(crate) fn popn(&mut self, n: usize) -> WasmResult<()> {
        if n > self.stack.len() {
            return Err(WasmError::StackUnderflow);
        }
        let new_len = self.stack.len() - n;
        self.stack.truncate(new_len);
        Ok(())
    }

    /// Peek at the top `n` values on the stack in the order they were
    /// pushed.
    pub(crate) fn peekn(&self, n: usize) -> WasmResult<&[Value]> {
        if n > self.stack.len() {
            return Err(WasmError::StackUnderflow);
        }
        Ok(&self.stack[self.stack.len() - n..])
    }

    /// Push a block region on the control stack.
    pub(crate) fn push_block(&mut self, following_code: Block, num_result_types: usize) {
        self.control_stack.push(ControlStackFrame::Block {
            destination: following_code,
            original_stack_size: self.stack.len(),
            num_return_values: num_result_types,
            exit_is_branched_to: false,
        });
    }

    /// Push a loop region on the control stack.
    pub(crate) fn push_loop(
        &mut self,
        header: Block,
        following_code: Block,
        num_result_types: usize,
    ) {
        self.control_stack.push(ControlStackFrame::Loop {
            header,
            destination: following_code,
            original_stack_size: self.stack.len(),
            num_return_values: num_result_types,
        });
    }

    /// Push an if region on the control stack.
    pub(crate) fn push_if(
        &mut self,
        destination: Block,
        else_block: Block,
        num_result_types: usize,
        head_is_reachable: bool,
    ) {
        self.control_stack.push(ControlStackFrame::If {
            destination,
            else_block,
            original_stack_size: self.stack.len(),
            num_return_values: num_result_types,
            exit_is_branched_to: false,
            head_is_reachable,
            consequent_ends_reachable: None,
        });
    }
}
