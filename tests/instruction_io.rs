//! End-to-end instruction I/O over real descriptors.
//!
//! One thread frames instructions onto its end of a socket pair while the
//! other end parses them back, exercising the framer, the buffered fd
//! transport, and the parser together.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Parser, nest, wire};
use transport::Socket;

const UTF8_4: &str = "\u{72AC}\u{10B00}z\u{E1}";
const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn socket_pair() -> (Arc<Socket>, Arc<Socket>) {
    let (a, b) = UnixStream::pair().expect("socketpair");
    (Socket::open(OwnedFd::from(a)), Socket::open(OwnedFd::from(b)))
}

#[test]
fn framed_instructions_roundtrip_across_a_socket_pair() {
    let (writer, reader) = socket_pair();

    let writer_thread = std::thread::spawn(move || {
        let first_arg = format!("a{UTF8_4}b");
        wire::send(&writer, "test", &[first_arg.as_str(), "12345"]).expect("send test");
        wire::send(&writer, "test2", &["hellohello", "worldworldworld"]).expect("send test2");
        writer.flush().expect("flush");
        writer.close().expect("close");
    });

    let mut parser = Parser::new();

    parser.read(&reader, TIMEOUT).expect("first instruction");
    assert_eq!(parser.opcode(), Some("test"));
    assert_eq!(parser.argc(), 2);
    assert_eq!(parser.arg(0), Some(format!("a{UTF8_4}b").as_str()));
    assert_eq!(parser.arg(1), Some("12345"));

    parser.read(&reader, TIMEOUT).expect("second instruction");
    assert_eq!(parser.opcode(), Some("test2"));
    assert_eq!(parser.args().collect::<Vec<_>>(), ["hellohello", "worldworldworld"]);

    /* The stream ends cleanly after the second instruction */
    let err = parser.read(&reader, TIMEOUT).expect_err("end of stream");
    assert!(err.is_closed());

    writer_thread.join().expect("writer thread");
}

#[test]
fn nested_output_arrives_as_one_nest_instruction() {
    let (writer, reader) = socket_pair();

    let writer_thread = std::thread::spawn(move || {
        let nested = nest(Arc::clone(&writer), 0);
        let name = format!("a{UTF8_4}b{UTF8_4}c");
        wire::send(&nested, "name", &[name.as_str()]).expect("send name");
        wire::send(&nested, "sync", &["12345"]).expect("send sync");
        nested.flush().expect("flush nested");
        writer.flush().expect("flush parent");
        writer.close().expect("close");
    });

    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let count = reader.read(&mut chunk).expect("read");
        if count == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..count]);
    }

    let expected = format!("4.nest,1.0,37.4.name,11.a{UTF8_4}b{UTF8_4}c;4.sync,5.12345;;");
    assert_eq!(received, expected.into_bytes());

    writer_thread.join().expect("writer thread");
}

#[test]
fn keep_alive_pings_flow_to_the_peer() {
    let (writer, reader) = socket_pair();
    writer.require_keep_alive_every(Duration::from_millis(50));

    /* With no writes at all, the peer sees nop instructions arrive */
    let mut parser = Parser::new();
    parser.read(&reader, TIMEOUT).expect("first ping");
    assert_eq!(parser.opcode(), Some("nop"));
    assert_eq!(parser.argc(), 0);

    parser.read(&reader, TIMEOUT).expect("second ping");
    assert_eq!(parser.opcode(), Some("nop"));

    writer.close().expect("close");
}
