//! Trap codes describing the reason for a trap.

use std::fmt;

/// A trap code describing the reason for a trap.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum TrapCode {
    /// An integer division by zero.
    IntegerDivisionByZero,
    /// An integer arithmetic operation overflowed.
    IntegerOverflow,
    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,
    /// An object was used after its teardown began.
    UseDuringDeinit,
    /// A user-defined trap code.
    User(u16),
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use TrapCode::*;
        match *self {
            IntegerDivisionByZero => f.write_str("int_divz"),
            IntegerOverflow => f.write_str("int_ovf"),
            UnreachableCodeReached => f.write_str("unreachable"),
            UseDuringDeinit => f.write_str("use_during_deinit"),
            User(c) => write!(f, "user{}", c),
        }
    }
}
