//! Jump table representation.

use crate::ir::Block;
use std::fmt;

/// Contents of a jump table.
///
/// All jump table entries are target blocks taking no arguments; the indexed
/// branch selects `table[x]`, or the default block when `x` is out of range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JumpTableData {
    /// The default target, taken when the index is out of range.
    pub default: Block,
    /// The table of targets, indexed by the branch operand.
    pub table: Vec<Block>,
}

impl JumpTableData {
    /// Create a jump table with the given entries.
    pub fn new(default: Block, table: Vec<Block>) -> Self {
        Self { default, table }
    }

    /// Iterate over every distinct target of this table, default included.
    pub fn all_targets(&self) -> impl Iterator<Item = Block> + '_ {
        self.table.iter().copied().chain(std::iter::once(self.default))
    }
}

impl fmt::Display for JumpTableData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "jump_table [")?;
        for (i, b) in self.table.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", b)?;
        }
        write!(f, "], default {}", self.default)
    }
}
