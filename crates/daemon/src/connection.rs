//! Per-connection routing.
//!
//! Every accepted connection is handled by one router invocation: wrap the
//! descriptor in a transport (TLS when configured), read the `select`
//! handshake, and either spawn a worker for a new session or join an
//! existing one by connection identifier. In both cases the client's bytes
//! are spliced to the worker through a socket pair whose far end is passed
//! into the worker over the descriptor channel.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use common::{Error, Result, Status, id};
use protocol::{Parser, ProtocolStatus, wire};
use transport::{Socket, TlsAcceptor};

use crate::proc::{Spawner, Worker};
use crate::proc_map::ProcMap;

/// Time allowed for each handshake instruction before the connection is
/// dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Size of the splice buffers between client transport and worker socket.
const IO_BUFFER_SIZE: usize = 8192;

/// Shared routing state: the worker registry, the spawn factory, and the
/// optional TLS context.
pub struct Router {
    map: Arc<ProcMap>,
    spawner: Arc<dyn Spawner>,
    tls: Option<TlsAcceptor>,
}

impl Router {
    pub fn new(map: Arc<ProcMap>, spawner: Arc<dyn Spawner>, tls: Option<TlsAcceptor>) -> Self {
        Self { map, spawner, tls }
    }

    /// The worker registry this router operates on.
    pub fn map(&self) -> &Arc<ProcMap> {
        &self.map
    }

    /// Handles one accepted TCP connection from wrap-up to teardown.
    pub fn handle_connection(&self, stream: TcpStream) {
        let socket = match &self.tls {
            Some(acceptor) => match Socket::open_secure(acceptor, stream) {
                Ok(socket) => socket,
                Err(err) => {
                    error!("Unable to set up TLS: {err}");
                    return;
                }
            },
            None => Socket::open(OwnedFd::from(stream)),
        };

        if let Err(err) = self.route(socket) {
            debug!("Connection did not succeed: {err}");
        }
    }

    /// Routes a wrapped connection, spawning or joining a worker as the
    /// handshake dictates. On the new-session path this blocks until the
    /// worker terminates.
    pub fn route(&self, socket: Arc<Socket>) -> Result<()> {
        let mut parser = Parser::new();

        if let Err(err) = parser.expect(&socket, Some(HANDSHAKE_TIMEOUT), "select") {
            log_handshake_failure(&err);
            return Err(err);
        }

        if parser.argc() != 1 {
            error!("Bad number of arguments to \"select\" ({})", parser.argc());
            return Err(Error::new(
                Status::ProtocolError,
                "Bad number of arguments to \"select\"",
            ));
        }

        let identifier = parser
            .arg(0)
            .ok_or_else(|| Error::new(Status::InternalError, "Handshake argument missing"))?
            .to_owned();

        /* Connection identifiers join an existing worker */
        if identifier.starts_with(id::WORKER_PREFIX) {
            let Some(worker) = self.map.retrieve(&identifier) else {
                info!("Connection \"{identifier}\" does not exist");
                let _ = wire::send_error(
                    &socket,
                    "No such connection.",
                    ProtocolStatus::ResourceNotFound,
                );
                let _ = socket.flush();
                return Err(Error::new(Status::NotFound, "No such connection"));
            };

            info!("Joining existing connection \"{identifier}\"");
            return add_user(&worker, parser, socket);
        }

        /* Anything else names the protocol of a new session */
        info!("Creating new client for protocol \"{identifier}\"");
        let worker = match self.spawner.spawn(&identifier) {
            Ok(worker) => Arc::new(worker),
            Err(err) => {
                let _ = wire::send_error(
                    &socket,
                    "Connection did not succeed.",
                    ProtocolStatus::ServerError,
                );
                let _ = socket.flush();
                return Err(err);
            }
        };

        if let Err(err) = add_user(&worker, parser, socket) {
            worker.stop();
            return Err(err);
        }

        info!("Connection ID is \"{}\"", worker.connection_id());

        if let Err(err) = self.map.add(Arc::clone(&worker)) {
            /* Identifier collisions are cryptographically improbable;
             * treat one as an internal failure and abort the session */
            error!(
                "Internal failure registering connection \"{}\": {err}",
                worker.connection_id()
            );
            worker.stop();
            return Err(Error::new(
                Status::InternalError,
                "Unable to register connection",
            ));
        }

        /* Supervise the worker for the lifetime of the session */
        let wait_result = worker.wait();

        let connection_id = worker.connection_id().to_owned();
        if self.map.remove(&connection_id).is_none() {
            error!(
                "Internal failure removing connection \"{connection_id}\". \
                 Connection record will never be freed."
            );
        } else {
            info!("Connection \"{connection_id}\" removed.");
        }

        worker.stop();
        wait_result
    }
}

/// Connects a user's transport to a worker: passes one end of a fresh
/// socket pair into the worker, then splices bytes in both directions on
/// background threads. The parser's residual bytes are delivered to the
/// worker before anything further is read from the transport.
fn add_user(worker: &Worker, parser: Parser, socket: Arc<Socket>) -> Result<()> {
    let (user_end, worker_end) = UnixStream::pair().map_err(|err| {
        error!("Unable to allocate file descriptors for I/O transfer: {err}");
        Error::from(err)
    })?;

    if let Err(err) = worker.send_user_fd(worker_end.as_fd()) {
        error!("Unable to add user: {err}");
        return Err(err);
    }
    drop(worker_end);

    spawn_io_threads(socket, user_end, parser);
    Ok(())
}

/// Starts the two splice threads for one user connection. The returned
/// threads are detached; the transport is freed once both directions have
/// ended.
fn spawn_io_threads(socket: Arc<Socket>, user_end: UnixStream, parser: Parser) {
    let result = std::thread::Builder::new()
        .name("guac-conn-io".into())
        .spawn(move || connection_io_thread(&socket, &user_end, parser));
    if let Err(err) = result {
        error!("Unable to start connection I/O thread: {err}");
    }
}

/// Worker-to-client direction. Spawns the client-to-worker thread, then
/// copies everything the worker emits onto the client transport, flushing
/// after each chunk. Once the worker side ends, waits for the companion
/// thread and frees the transport.
fn connection_io_thread(socket: &Arc<Socket>, user_end: &UnixStream, parser: Parser) {
    let write_thread = {
        let socket = Arc::clone(socket);
        let mut user_end = match user_end.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                error!("Unable to clone I/O descriptor: {err}");
                let _ = socket.close();
                return;
            }
        };
        std::thread::Builder::new()
            .name("guac-conn-write".into())
            .spawn(move || connection_write_thread(&socket, &mut user_end, parser))
    };

    let mut stream = user_end;
    let mut buffer = [0u8; IO_BUFFER_SIZE];
    loop {
        let count = match stream.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(count) => count,
        };
        if socket.write(&buffer[..count]).is_err() {
            break;
        }
        if socket.flush().is_err() {
            break;
        }
    }

    if let Ok(handle) = write_thread {
        let _ = handle.join();
    }

    let _ = socket.close();
}

/// Client-to-worker direction: drains bytes the parser read past the
/// handshake, then copies everything the client sends into the worker's
/// socket.
fn connection_write_thread(socket: &Socket, user_end: &mut UnixStream, mut parser: Parser) {
    let mut buffer = [0u8; IO_BUFFER_SIZE];

    /* Residual handshake bytes go first */
    loop {
        let count = parser.shift(&mut buffer);
        if count == 0 {
            break;
        }
        if user_end.write_all(&buffer[..count]).is_err() {
            return;
        }
    }
    drop(parser);

    loop {
        let count = match socket.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(count) => count,
        };
        if user_end.write_all(&buffer[..count]).is_err() {
            break;
        }
    }

    let _ = user_end.shutdown(std::net::Shutdown::Write);
}

/// Logs a handshake failure at the severity its cause deserves.
fn log_handshake_failure(err: &Error) {
    match err.status() {
        Status::Closed => debug!("Connection closed during handshake"),
        Status::ProtocolError => error!(
            "Protocol violation during handshake. Perhaps the client is \
             incompatible with this version of the daemon?"
        ),
        _ => warn!("Handshake failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::move_fd;
    use crate::proc::ClientSkeleton;
    use nix::unistd::Pid;
    use std::process::Command;

    fn worker_with_channel() -> (Arc<Worker>, UnixStream, String) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        let connection_id = id::generate(id::WORKER_PREFIX);
        let worker = Arc::new(Worker::new(
            Pid::from_raw(0),
            ours,
            ClientSkeleton {
                connection_id: connection_id.clone(),
                protocol: "test".into(),
            },
        ));
        (worker, theirs, connection_id)
    }

    fn client_socket_pair() -> (Arc<Socket>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        (Socket::open(OwnedFd::from(ours)), theirs)
    }

    fn router(map: Arc<ProcMap>) -> Router {
        struct NoSpawn;
        impl Spawner for NoSpawn {
            fn spawn(&self, _protocol: &str) -> Result<Worker> {
                Err(Error::new(Status::NotAvailable, "spawning disabled"))
            }
        }
        Router::new(map, Arc::new(NoSpawn), None)
    }

    #[test]
    fn join_of_unknown_connection_reports_resource_not_found() {
        let map = Arc::new(ProcMap::new());
        let router = router(Arc::clone(&map));

        let (socket, mut client) = client_socket_pair();
        let missing = id::generate(id::WORKER_PREFIX);
        client
            .write_all(format!("6.select,37.{missing};").as_bytes())
            .expect("handshake write");

        let err = router.route(socket).expect_err("unknown connection");
        assert_eq!(err.status(), Status::NotFound);

        let mut response = Vec::new();
        client.read_to_end(&mut response).expect("read response");
        assert_eq!(
            response,
            b"5.error,19.No such connection.,3.516;".to_vec()
        );
    }

    #[test]
    fn select_requires_exactly_one_argument() {
        let map = Arc::new(ProcMap::new());
        let router = router(map);

        let (socket, mut client) = client_socket_pair();
        client
            .write_all(b"6.select,3.vnc,5.extra;")
            .expect("handshake write");

        let err = router.route(socket).expect_err("bad argument count");
        assert_eq!(err.status(), Status::ProtocolError);
    }

    #[test]
    fn wrong_handshake_opcode_is_a_protocol_error() {
        let map = Arc::new(ProcMap::new());
        let router = router(map);

        let (socket, mut client) = client_socket_pair();
        client.write_all(b"4.sync,5.12345;").expect("write");

        let err = router.route(socket).expect_err("wrong opcode");
        assert_eq!(err.status(), Status::ProtocolError);
    }

    #[test]
    fn spawn_failure_surfaces_a_server_error_instruction() {
        let map = Arc::new(ProcMap::new());
        let router = router(map);

        let (socket, mut client) = client_socket_pair();
        client.write_all(b"6.select,3.vnc;").expect("write");

        let err = router.route(socket).expect_err("spawn failure");
        assert_eq!(err.status(), Status::NotAvailable);

        let mut response = Vec::new();
        client.read_to_end(&mut response).expect("read response");
        assert_eq!(
            response,
            b"5.error,27.Connection did not succeed.,3.512;".to_vec()
        );
    }

    #[test]
    fn join_splices_bytes_and_residual_handshake_data() {
        let map = Arc::new(ProcMap::new());
        let (worker, plugin_channel, connection_id) = worker_with_channel();
        map.add(worker).expect("register worker");
        let router = router(Arc::clone(&map));

        let (socket, mut client) = client_socket_pair();

        /* Handshake plus one full instruction beyond it, in one write, so
         * the parser buffers residue the splice must deliver */
        client
            .write_all(format!("6.select,37.{connection_id};4.sync,5.12345;").as_bytes())
            .expect("handshake write");

        router.route(socket).expect("join route");

        /* The worker-side plugin receives the passed descriptor */
        let passed = move_fd::recv_fd(&plugin_channel).expect("receive user fd");
        let mut worker_io = UnixStream::from(passed);

        /* Residual bytes arrive first */
        let mut residue = [0u8; 15];
        worker_io.read_exact(&mut residue).expect("read residue");
        assert_eq!(&residue, b"4.sync,5.12345;");

        /* Client-to-worker data flows */
        client.write_all(b"4.nop_;").expect("client write");
        let mut forwarded = [0u8; 7];
        worker_io.read_exact(&mut forwarded).expect("read forwarded");
        assert_eq!(&forwarded, b"4.nop_;");

        /* Worker-to-client data flows, flushed per chunk */
        worker_io.write_all(b"5.ready,37.x;").expect("worker write");
        let mut delivered = [0u8; 13];
        client.read_exact(&mut delivered).expect("read delivered");
        assert_eq!(&delivered, b"5.ready,37.x;");

        /* Worker close tears the connection down once the client-side
         * splice observes it */
        drop(worker_io);
        client.write_all(b"x").expect("wake splice");
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).expect("drain");
        assert!(rest.is_empty());
    }

    #[test]
    fn new_session_registers_waits_and_removes() {
        struct ThreadWorkerSpawner;
        impl Spawner for ThreadWorkerSpawner {
            fn spawn(&self, protocol: &str) -> Result<Worker> {
                let (ours, theirs) = UnixStream::pair()?;

                /* A real short-lived child stands in for the plugin
                 * process so that wait() has something to reap */
                let child = Command::new("sleep").arg("0.2").spawn()?;

                /* The plugin's descriptor handling runs on a thread */
                std::thread::spawn(move || {
                    if let Ok(fd) = move_fd::recv_fd(&theirs) {
                        let mut io = UnixStream::from(fd);
                        let mut buffer = [0u8; 256];
                        while let Ok(count) = io.read(&mut buffer) {
                            if count == 0 {
                                break;
                            }
                            if io.write_all(&buffer[..count]).is_err() {
                                break;
                            }
                        }
                    }
                });

                Ok(Worker::new(
                    Pid::from_raw(child.id() as i32),
                    ours,
                    ClientSkeleton {
                        connection_id: id::generate(id::WORKER_PREFIX),
                        protocol: protocol.to_owned(),
                    },
                ))
            }
        }

        let map = Arc::new(ProcMap::new());
        let router = Router::new(Arc::clone(&map), Arc::new(ThreadWorkerSpawner), None);

        let (socket, mut client) = client_socket_pair();
        client.write_all(b"6.select,3.vnc;").expect("handshake");

        let route_thread = std::thread::spawn(move || router.route(socket));

        /* The echo worker reflects client traffic while the session is
         * registered */
        client.write_all(b"4.sync,5.12345;").expect("write");
        let mut echoed = [0u8; 15];
        client.read_exact(&mut echoed).expect("echo");
        assert_eq!(&echoed, b"4.sync,5.12345;");

        /* route() returns once the stand-in process exits, and the
         * registry entry is gone afterwards */
        route_thread.join().expect("join").expect("route");
        assert!(map.is_empty());
    }
}
