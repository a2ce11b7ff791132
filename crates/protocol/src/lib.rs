//! Instruction codec for the Guacamole display protocol.
//!
//! An instruction on the wire is a sequence of length-prefixed UTF-8
//! elements terminated by a semicolon:
//!
//! ```text
//! <len1> "." <elt1> "," <len2> "." <elt2> ... "," <lenN> "." <eltN> ";"
//! ```
//!
//! Lengths are decimal and count *code points*, not bytes. The first
//! element is the opcode; the rest are uninterpreted string arguments.
//! This crate provides the incremental [`Parser`] assembling instructions
//! from a transport, the [`wire`] framer producing them, the closed
//! [`ProtocolStatus`] enumeration carried by `error` instructions, and the
//! `nest` transport that forwards one socket's output as framed
//! instructions on another.

mod instruction;
mod nest;
mod parser;
mod status;
pub mod wire;

pub use instruction::Instruction;
pub use nest::nest;
pub use parser::{Parser, ParseState};
pub use status::ProtocolStatus;

/// Maximum length of any one element, in code points.
pub const MAX_INSTRUCTION_LENGTH: usize = 8191;

/// Maximum number of elements in one instruction, opcode included.
pub const MAX_ELEMENT_COUNT: usize = 128;

/// Size of the parser's internal buffer; bounds total instruction size.
pub const INSTRUCTION_BUFFER_SIZE: usize = 32768;
