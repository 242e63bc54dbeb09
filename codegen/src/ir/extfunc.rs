//! External function calls and signatures.
//!
//! These data structures declare the functions that can be called from a
//! CLIF function, together with their calling-convention-level signatures.

use crate::ir::{SigRef, Type};
use std::fmt;

/// Calling convention identifier.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum CallConv {
    /// The System V AMD64 ABI / AAPCS64 default convention.
    SystemV,
    /// Apple's aarch64 variant of AAPCS64.
    AppleAarch64,
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            CallConv::SystemV => "system_v",
            CallConv::AppleAarch64 => "apple_aarch64",
        })
    }
}

/// The special purpose of a parameter or return value.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum ArgumentPurpose {
    /// An ordinary user program value.
    Normal,
    /// A pointer to the VM context, moved into the pinned register by the
    /// function prologue.
    VMContext,
    /// A hidden pointer to a caller-allocated buffer receiving an oversized
    /// return value.
    StructReturn,
}

/// Function parameter or return value descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct AbiParam {
    /// Type of the argument value.
    pub value_type: Type,
    /// Special purpose of the argument, or `Normal`.
    pub purpose: ArgumentPurpose,
}

impl AbiParam {
    /// Create a parameter with default flags.
    pub fn new(value_type: Type) -> Self {
        Self {
            value_type,
            purpose: ArgumentPurpose::Normal,
        }
    }

    /// Create a special-purpose parameter that is not part of the user
    /// program.
    pub fn special(value_type: Type, purpose: ArgumentPurpose) -> Self {
        Self {
            value_type,
            purpose,
        }
    }
}

impl fmt::Display for AbiParam {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.value_type)?;
        match self.purpose {
            ArgumentPurpose::Normal => Ok(()),
            ArgumentPurpose::VMContext => f.write_str(" vmctx"),
            ArgumentPurpose::StructReturn => f.write_str(" sret"),
        }
    }
}

/// A function signature: the types a caller and callee agree on.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Signature {
    /// The arguments passed to the function.
    pub params: Vec<AbiParam>,
    /// Values returned from the function.
    pub returns: Vec<AbiParam>,
    /// Calling convention.
    pub call_conv: CallConv,
}

impl Signature {
    /// Create a new blank signature.
    pub fn new(call_conv: CallConv) -> Self {
        Self {
            params: Vec::new(),
            returns: Vec::new(),
            call_conv,
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")?;
        if !self.returns.is_empty() {
            write!(f, " -> ")?;
            for (i, r) in self.returns.iter().enumerate() {
                if i != 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", r)?;
            }
        }
        write!(f, " {}", self.call_conv)
    }
}

/// The name of an external function, resolved by the linker or by the object
/// writer for colocated functions.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct ExternalName(pub String);

impl ExternalName {
    /// Create a name from anything string-like.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The symbol string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An external function reference inside a CLIF function.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct ExtFuncData {
    /// The name of the function.
    pub name: ExternalName,
    /// The signature of the function.
    pub signature: SigRef,
    /// Will this function be defined in the same object file as the caller?
    /// Colocated functions can be reached with shorter PC-relative
    /// relocations.
    pub colocated: bool,
}

impl fmt::Display for ExtFuncData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.colocated {
            write!(f, "colocated ")?;
        }
        write!(f, "{} {}", self.name, self.signature)
    }
}
