//! Incremental instruction parser.
//!
//! The parser assembles one instruction at a time from bytes arriving on a
//! transport, holding everything inside a fixed 32 KiB buffer. Completed
//! elements are recorded as offset/length pairs into that buffer and
//! surfaced as string slices; buffer contents are never mutated to
//! terminate elements.
//!
//! State machine: `Length` accumulates the decimal code-point count of the
//! next element; `Content` consumes exactly that many UTF-8 code points and
//! then requires `,` (next element) or `;` (instruction complete).
//! `Complete` is sticky until [`Parser::read`] starts the next instruction;
//! `Error` is sticky forever and the parser must be discarded.

use std::time::Duration;

use common::{Error, Result, Status, unicode};
use transport::Socket;

use crate::instruction::Instruction;
use crate::{INSTRUCTION_BUFFER_SIZE, MAX_ELEMENT_COUNT, MAX_INSTRUCTION_LENGTH};

/// Parse progress of the instruction currently being assembled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseState {
    /// Accumulating the length prefix of the next element.
    Length,
    /// Consuming the declared number of code points of element content.
    Content,
    /// A full instruction is available.
    Complete,
    /// The stream violated the protocol; no further bytes are consumed.
    Error,
}

/// Incremental parser for display-protocol instructions.
pub struct Parser {
    buf: Box<[u8; INSTRUCTION_BUFFER_SIZE]>,
    /// First byte not yet consumed by the state machine.
    unparsed_start: usize,
    /// First free byte.
    unparsed_end: usize,
    /// Completed elements of the current instruction, as buffer ranges.
    elements: Vec<(usize, usize)>,
    /// Content start of the element currently being consumed.
    current_start: Option<usize>,
    /// Code points of the current element not yet consumed.
    remaining: usize,
    /// Decimal accumulator for the length prefix.
    length_accum: usize,
    state: ParseState,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self {
            buf: Box::new([0; INSTRUCTION_BUFFER_SIZE]),
            unparsed_start: 0,
            unparsed_end: 0,
            elements: Vec::with_capacity(8),
            current_start: None,
            remaining: 0,
            length_accum: 0,
            state: ParseState::Length,
        }
    }

    /// Current parse state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Prepares the parser for the next instruction. Unconsumed buffered
    /// bytes are retained.
    fn reset(&mut self) {
        self.elements.clear();
        self.current_start = None;
        self.remaining = 0;
        self.length_accum = 0;
        self.state = ParseState::Length;
    }

    /// Runs the state machine over the buffered, unparsed bytes, returning
    /// the number of bytes consumed. Zero means more data is required (or
    /// the state is terminal).
    fn step(&mut self) -> usize {
        let mut consumed = 0;

        if self.state == ParseState::Length {
            while self.unparsed_start + consumed < self.unparsed_end {
                let byte = self.buf[self.unparsed_start + consumed];
                consumed += 1;

                match byte {
                    b'0'..=b'9' => {
                        self.length_accum = self.length_accum * 10 + usize::from(byte - b'0');

                        /* Reject oversized elements as soon as the prefix
                         * exceeds the limit */
                        if self.length_accum > MAX_INSTRUCTION_LENGTH {
                            self.state = ParseState::Error;
                            return 0;
                        }
                    }
                    b'.' => {
                        /* Enforce the element limit before recording the
                         * element start */
                        if self.elements.len() == MAX_ELEMENT_COUNT {
                            self.state = ParseState::Error;
                            return 0;
                        }
                        self.current_start = Some(self.unparsed_start + consumed);
                        self.remaining = self.length_accum;
                        self.state = ParseState::Content;
                        break;
                    }
                    _ => {
                        self.state = ParseState::Error;
                        return 0;
                    }
                }
            }
        }

        if self.state == ParseState::Content {
            loop {
                let position = self.unparsed_start + consumed;

                if self.remaining == 0 {
                    /* The element is fully consumed; the next byte must be
                     * a separator or the instruction terminator */
                    if position >= self.unparsed_end {
                        break;
                    }
                    let byte = self.buf[position];
                    consumed += 1;

                    if !self.record_element(position) {
                        return 0;
                    }

                    match byte {
                        b';' => self.state = ParseState::Complete,
                        b',' => {
                            self.length_accum = 0;
                            self.state = ParseState::Length;
                        }
                        _ => self.state = ParseState::Error,
                    }
                    if self.state == ParseState::Error {
                        return 0;
                    }
                    break;
                }

                if position >= self.unparsed_end {
                    break;
                }

                /* Consume one whole code point, waiting for the rest of a
                 * partial character */
                let size = unicode::charsize(self.buf[position]);
                if position + size > self.unparsed_end {
                    break;
                }
                consumed += size;
                self.remaining -= 1;
            }
        }

        self.unparsed_start += consumed;
        consumed
    }

    /// Records the element ending just before `end` as a completed range,
    /// verifying that its bytes are valid UTF-8.
    fn record_element(&mut self, end: usize) -> bool {
        let Some(start) = self.current_start.take() else {
            self.state = ParseState::Error;
            return false;
        };

        if std::str::from_utf8(&self.buf[start..end]).is_err() {
            self.state = ParseState::Error;
            return false;
        }

        self.elements.push((start, end - start));
        true
    }

    /// First buffer offset still needed by the current instruction.
    fn instruction_base(&self) -> usize {
        self.elements
            .first()
            .map(|&(offset, _)| offset)
            .or(self.current_start)
            .unwrap_or(self.unparsed_start)
    }

    /// Moves the live region of the buffer to the front, rebasing all
    /// recorded offsets, and returns the number of bytes gained.
    fn shift_down(&mut self) -> usize {
        let base = self.instruction_base();
        if base == 0 {
            return 0;
        }

        self.buf.copy_within(base..self.unparsed_end, 0);
        for (offset, _) in &mut self.elements {
            *offset -= base;
        }
        if let Some(start) = self.current_start.as_mut() {
            *start -= base;
        }
        self.unparsed_start -= base;
        self.unparsed_end -= base;
        base
    }

    /// Reads one complete instruction from the given socket.
    ///
    /// A `Timeout` error leaves the parser resumable: a later call may
    /// still complete the instruction once more bytes arrive. `Closed`
    /// reports end of stream; `ProtocolError` is terminal for the parser.
    pub fn read(&mut self, socket: &Socket, timeout: Option<Duration>) -> Result<()> {
        /* Begin the next instruction if the previous one was completed */
        if self.state == ParseState::Complete {
            self.reset();
        }

        while self.state != ParseState::Complete && self.state != ParseState::Error {
            let parsed = self.step();

            if parsed == 0 && self.state != ParseState::Complete && self.state != ParseState::Error
            {
                /* If no space is left to read into, recover what we can by
                 * shifting; a full buffer with nothing to shift means the
                 * instruction cannot fit at all */
                if self.unparsed_end == INSTRUCTION_BUFFER_SIZE && self.shift_down() == 0 {
                    return Err(Error::new(Status::NoMemory, "Instruction too long"));
                }

                if !socket.select(timeout)? {
                    return Err(Error::new(
                        Status::Timeout,
                        "Timeout while waiting for data on socket",
                    ));
                }

                let count = socket.read(&mut self.buf[self.unparsed_end..])?;
                if count == 0 {
                    return Err(Error::new(
                        Status::Closed,
                        "End of stream reached while reading instruction",
                    ));
                }
                self.unparsed_end += count;
            }
        }

        if self.state == ParseState::Error {
            return Err(Error::new(Status::ProtocolError, "Instruction parse error"));
        }

        Ok(())
    }

    /// Reads one instruction and verifies its opcode.
    pub fn expect(&mut self, socket: &Socket, timeout: Option<Duration>, opcode: &str) -> Result<()> {
        self.read(socket, timeout)?;

        if self.opcode() != Some(opcode) {
            return Err(Error::new(
                Status::ProtocolError,
                "Instruction read did not have expected opcode",
            ));
        }

        Ok(())
    }

    fn element_str(&self, index: usize) -> Option<&str> {
        let &(offset, length) = self.elements.get(index)?;
        std::str::from_utf8(&self.buf[offset..offset + length]).ok()
    }

    /// Opcode of the completed instruction.
    pub fn opcode(&self) -> Option<&str> {
        if self.state != ParseState::Complete {
            return None;
        }
        self.element_str(0)
    }

    /// Number of arguments of the completed instruction.
    pub fn argc(&self) -> usize {
        if self.state != ParseState::Complete {
            return 0;
        }
        self.elements.len().saturating_sub(1)
    }

    /// Argument `index` of the completed instruction.
    pub fn arg(&self, index: usize) -> Option<&str> {
        if self.state != ParseState::Complete {
            return None;
        }
        self.element_str(index + 1)
    }

    /// All arguments of the completed instruction, in order.
    pub fn args(&self) -> impl Iterator<Item = &str> {
        (0..self.argc()).filter_map(|index| self.arg(index))
    }

    /// Copies the completed instruction out of the parser buffer.
    pub fn to_instruction(&self) -> Option<Instruction> {
        Some(Instruction::new(
            self.opcode()?,
            self.args().map(str::to_owned).collect(),
        ))
    }

    /// Number of buffered bytes not yet consumed by the state machine.
    pub fn available(&self) -> usize {
        self.unparsed_end - self.unparsed_start
    }

    /// Drains up to `dest.len()` unconsumed bytes out of the parser,
    /// returning how many were copied. Used to recover bytes read past the
    /// final handshake instruction.
    pub fn shift(&mut self, dest: &mut [u8]) -> usize {
        let count = self.available().min(dest.len());
        dest[..count]
            .copy_from_slice(&self.buf[self.unparsed_start..self.unparsed_start + count]);
        self.unparsed_start += count;
        count
    }
}
