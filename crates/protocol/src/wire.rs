//! Instruction framing onto a transport.
//!
//! Each sender acquires the transport's instruction lock for the duration
//! of one instruction, so whole instructions from concurrent writers never
//! interleave even though the individual writes are small.

use common::{Result, unicode};
use transport::Socket;

use crate::status::ProtocolStatus;

/// Writes one length-prefixed element from raw bytes. The length counts
/// code points.
pub(crate) fn write_element_bytes(socket: &Socket, value: &[u8]) -> Result<()> {
    socket.write_int(unicode::strlen(value) as i64)?;
    socket.write(b".")?;
    socket.write(value)
}

/// Writes one length-prefixed element.
pub fn write_element(socket: &Socket, value: &str) -> Result<()> {
    write_element_bytes(socket, value.as_bytes())
}

/// Sends a complete instruction, holding the instruction lock throughout.
pub fn send(socket: &Socket, opcode: &str, args: &[&str]) -> Result<()> {
    let _lock = socket.lock_instruction();

    write_element(socket, opcode)?;
    for arg in args {
        socket.write(b",")?;
        write_element(socket, arg)?;
    }
    socket.write(b";")
}

/// Sends an `error` instruction carrying a short message and a protocol
/// status code.
pub fn send_error(socket: &Socket, message: &str, status: ProtocolStatus) -> Result<()> {
    let code = status.to_string();
    send(socket, "error", &[message, code.as_str()])
}

/// Sends a `nop` instruction.
pub fn send_nop(socket: &Socket) -> Result<()> {
    send(socket, "nop", &[])
}

/// Sends a `disconnect` instruction, notifying the peer that the
/// connection is ending.
pub fn send_disconnect(socket: &Socket) -> Result<()> {
    send(socket, "disconnect", &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    const UTF8_4: &str = "\u{72AC}\u{10B00}z\u{E1}";

    #[test]
    fn framing_counts_code_points() {
        let (socket, handle) = Socket::memory();

        let payload = format!("a{UTF8_4}b{UTF8_4}c");
        send(socket.as_ref(), "clipboard", &[payload.as_str()]).expect("send clipboard");
        send(socket.as_ref(), "sync", &["12345"]).expect("send sync");
        socket.flush().expect("flush");

        let expected = format!("9.clipboard,11.a{UTF8_4}b{UTF8_4}c;4.sync,5.12345;");
        assert_eq!(handle.output(), expected.into_bytes());
    }

    #[test]
    fn error_instruction_carries_message_and_code() {
        let (socket, handle) = Socket::memory();
        send_error(
            socket.as_ref(),
            "No such connection.",
            ProtocolStatus::ResourceNotFound,
        )
        .expect("send error");
        socket.flush().expect("flush");

        assert_eq!(
            handle.output(),
            b"5.error,19.No such connection.,3.516;".to_vec()
        );
    }

    #[test]
    fn nop_is_the_keep_alive_ping() {
        let (socket, handle) = Socket::memory();
        send_nop(socket.as_ref()).expect("send nop");
        assert_eq!(handle.output(), transport::NOP_INSTRUCTION.to_vec());
    }

    #[test]
    fn empty_arguments_frame_as_zero_length_elements() {
        let (socket, handle) = Socket::memory();
        send(socket.as_ref(), "args", &["", "hostname"]).expect("send");
        assert_eq!(handle.output(), b"4.args,0.,8.hostname;".to_vec());
    }

    #[test]
    fn round_trips_through_the_parser() {
        let (socket, handle) = Socket::memory();
        send(socket.as_ref(), "size", &["0", "1024", "768"]).expect("send");

        let (reader, input) = Socket::memory();
        input.push(&handle.output());

        let mut parser = crate::Parser::new();
        parser
            .read(&reader, Some(std::time::Duration::from_secs(1)))
            .expect("read");
        assert_eq!(parser.opcode(), Some("size"));
        assert_eq!(parser.args().collect::<Vec<_>>(), ["0", "1024", "768"]);
    }
}
