//! Owned representation of one instruction.

use std::fmt;

use common::unicode;

/// An opcode with its arguments, decoupled from any parser buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    opcode: String,
    args: Vec<String>,
}

impl Instruction {
    /// Builds an instruction from an opcode and arguments.
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    /// The instruction's opcode.
    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    /// The instruction's arguments, in order.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Instruction {
    /// Renders the instruction in wire form, code-point length prefixes
    /// included.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            unicode::strlen(self.opcode.as_bytes()),
            self.opcode
        )?;
        for arg in &self.args {
            write!(f, ",{}.{}", unicode::strlen(arg.as_bytes()), arg)?;
        }
        f.write_str(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_counts_code_points() {
        let instruction = Instruction::new(
            "clipboard",
            vec!["a\u{10123}b\u{10123}c".to_string()],
        );
        assert_eq!(
            instruction.to_string(),
            "9.clipboard,5.a\u{10123}b\u{10123}c;"
        );
    }

    #[test]
    fn zero_argument_instruction_is_just_the_opcode() {
        let instruction = Instruction::new("nop", Vec::new());
        assert_eq!(instruction.to_string(), "3.nop;");
    }
}
