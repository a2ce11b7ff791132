//! TLS-terminated transport over an accepted TCP connection.
//!
//! The daemon holds one process-wide [`TlsAcceptor`] built from the
//! configured certificate chain and private key; each accepted connection
//! performs its server-side handshake during socket construction. Readiness
//! checks consult the TLS session's buffered plaintext before falling back
//! to polling the descriptor, so records already decrypted are never missed.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rustls::pki_types::PrivateKeyDer;
use rustls::{ServerConfig, ServerConnection, StreamOwned};

use common::{Error, Result, Status};

use crate::socket::SocketOps;
use crate::socket::fd::OutputBuffer;
use crate::wait::wait_readable;

/// Process-wide TLS context handed to every accepted connection.
#[derive(Clone)]
pub struct TlsAcceptor {
    config: Arc<ServerConfig>,
}

impl TlsAcceptor {
    /// Wraps a prepared server configuration.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Performs the server-side handshake on an accepted TCP connection.
    pub(crate) fn accept(&self, stream: TcpStream) -> Result<TlsOps> {
        TlsOps::accept(Arc::clone(&self.config), stream)
    }
}

/// Loads a certificate chain and private key into a TLS server
/// configuration.
pub fn load_server_config(cert_file: &Path, key_file: &Path) -> Result<Arc<ServerConfig>> {
    let mut reader = BufReader::new(File::open(cert_file)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|_| Error::new(Status::InvalidArgument, "Unable to load certificate"))?;
    if certs.is_empty() {
        return Err(Error::new(
            Status::InvalidArgument,
            "Certificate file contains no certificates",
        ));
    }

    let mut reader = BufReader::new(File::open(key_file)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(|_| Error::new(Status::InvalidArgument, "Unable to load keyfile"))?
        .ok_or_else(|| Error::new(Status::InvalidArgument, "Keyfile contains no private key"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::new(Status::InvalidArgument, err.to_string()))?;

    Ok(Arc::new(config))
}

/// Transport encrypting all traffic through a server-side TLS session.
pub struct TlsOps {
    stream: Mutex<StreamOwned<ServerConnection, TcpStream>>,
    /// Duplicate of the TCP descriptor, polled for readiness without
    /// holding the session lock.
    poll_fd: OwnedFd,
    out: Mutex<OutputBuffer>,
    instruction: Mutex<()>,
}

impl TlsOps {
    fn accept(config: Arc<ServerConfig>, mut tcp: TcpStream) -> Result<Self> {
        let poll_fd = OwnedFd::from(tcp.try_clone()?);

        let mut conn = ServerConnection::new(config)
            .map_err(|err| Error::new(Status::InternalError, err.to_string()))?;

        /* Drive the handshake to completion before any protocol traffic */
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(|err| {
                Error::new(Status::ProtocolError, format!("TLS handshake failed: {err}"))
            })?;
        }

        Ok(Self {
            stream: Mutex::new(StreamOwned::new(conn, tcp)),
            poll_fd,
            out: Mutex::new(OutputBuffer::new()),
            instruction: Mutex::new(()),
        })
    }

    fn flush_locked(&self, out: &mut OutputBuffer) -> Result<()> {
        if out.pending().is_empty() {
            return Ok(());
        }

        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(out.pending())?;
        stream.flush()?;
        out.clear();
        Ok(())
    }
}

impl SocketOps for TlsOps {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(stream.read(buf)?)
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);

        let mut remaining = buf;
        while !remaining.is_empty() {
            if out.is_full() {
                self.flush_locked(&mut out)?;
            }
            let taken = out.append(remaining);
            remaining = &remaining[taken..];
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush_locked(&mut out)
    }

    fn select(&self, timeout: Option<Duration>) -> Result<bool> {
        /* Plaintext already decrypted by the session is ready immediately */
        {
            let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
            let state = stream
                .conn
                .process_new_packets()
                .map_err(|err| Error::new(Status::ProtocolError, err.to_string()))?;
            if state.plaintext_bytes_to_read() > 0 {
                return Ok(true);
            }
        }

        wait_readable(self.poll_fd.as_fd(), timeout)
    }

    fn instruction_mutex(&self) -> Option<&Mutex<()>> {
        Some(&self.instruction)
    }

    fn shutdown(&self) -> Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.conn.send_close_notify();
        let _ = stream.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.pem");
        let err = load_server_config(&missing, &missing).expect_err("missing file");
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn garbage_certificate_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::File::create(&cert)
            .and_then(|mut f| f.write_all(b"not a certificate"))
            .expect("write cert");
        std::fs::File::create(&key)
            .and_then(|mut f| f.write_all(b"not a key"))
            .expect("write key");

        let err = load_server_config(&cert, &key).expect_err("garbage input");
        assert_eq!(err.status(), Status::InvalidArgument);
    }
}
