//! Connection handling (component C3): three interchangeable
//! `ConnectionLoop` variants sharing the same [`Connection`] state machine
//! and the same [`CommandParser`]/[`LRUStore`] collaborators.
//!
//! - [`EventLoop`]: one thread, `mio`-driven readiness polling. The
//!   default and the one exercised by the integration tests.
//! - [`ThreadPerConnection`]: a blocking accept loop that hands each
//!   connection to the shared [`Executor`], admission-capped by a
//!   counting `Condvar` (grounded on the blocking connection-per-thread
//!   model, generalized onto the watermarked pool instead of raw
//!   `thread::spawn`).
//! - [`ShardedEventLoop`]: `N` sibling [`EventLoop`]s, each on its own
//!   thread, with accepted sockets distributed round-robin.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{would_block, ServerError};
use crate::executor::Executor;
use crate::parser::{CommandParser, ParseOutcome};
use crate::store::LRUStore;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(usize::MAX);
const READ_CHUNK: usize = 4096;

/// Locks `store`, treating mutex poisoning as the internal-invariant
/// violation it is: a prior panic already corrupted the cache loop's
/// assumptions, so this logs and aborts rather than silently limping on
/// with possibly-inconsistent state.
fn lock_store(store: &Mutex<LRUStore>) -> std::sync::MutexGuard<'_, LRUStore> {
    store.lock().unwrap_or_else(|_| {
        let err = ServerError::Invariant("store mutex poisoned".to_string());
        tracing::error!("{err}");
        panic!("{err}");
    })
}

/// Per-connection state: the socket, incremental parse state, and
/// buffered-but-not-yet-written response bytes.
struct Connection {
    stream: TcpStream,
    read_buf: Vec<u8>,
    parser: CommandParser,
    outbox: Vec<u8>,
    alive: bool,
    /// Whether `Interest::WRITABLE` is currently registered for this
    /// socket with the poll registry.
    registered_writable: bool,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Connection {
            stream,
            read_buf: Vec::with_capacity(READ_CHUNK),
            parser: CommandParser::new(),
            outbox: Vec::new(),
            alive: true,
            registered_writable: false,
        }
    }

    /// Reads as much as is available without blocking, parses and
    /// executes every complete command against `store`, queuing
    /// responses into `outbox`. Marks the connection dead on EOF or a
    /// transport error.
    fn do_read(&mut self, store: &Mutex<LRUStore>) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.alive = false;
                    return;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    tracing::error!("{}", ServerError::Transport(e));
                    self.alive = false;
                    return;
                }
            }
        }

        loop {
            match self.parser.parse(&self.read_buf) {
                ParseOutcome::NeedMoreData => break,
                ParseOutcome::Complete { command, consumed } => {
                    self.read_buf.drain(..consumed);
                    let mut guard = lock_store(store);
                    let response = command.execute(&mut guard);
                    drop(guard);
                    self.outbox.extend_from_slice(&response);
                }
                ParseOutcome::Invalid { consumed, message } => {
                    self.read_buf.drain(..consumed);
                    self.parser.reset();
                    self.outbox
                        .extend_from_slice(format!("ERROR {message}\r\n").as_bytes());
                }
            }
        }
    }

    /// Flushes as much of `outbox` as the socket accepts without
    /// blocking. Marks the connection dead on a genuine write error.
    fn do_write(&mut self) {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => break,
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    tracing::error!("{}", ServerError::Transport(e));
                    self.alive = false;
                    return;
                }
            }
        }
    }

    fn wants_write(&self) -> bool {
        !self.outbox.is_empty()
    }
}

/// A handle to request graceful shutdown of a running [`EventLoop`] from
/// another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Requests shutdown: stop accepting new connections, drain
    /// in-flight writes on existing ones, then return from `run`.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// Single-threaded, readiness-driven connection loop (the default
/// `ConnectionLoop` variant).
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    store: Arc<Mutex<LRUStore>>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl EventLoop {
    /// Binds `addr` and constructs an event loop serving `store`.
    /// Returns the loop together with a [`ShutdownHandle`] the caller
    /// can use from another thread to request a graceful stop.
    pub fn bind(addr: SocketAddr, store: Arc<Mutex<LRUStore>>) -> Result<(Self, ShutdownHandle), ServerError> {
        let poll = Poll::new().map_err(ServerError::Transport)?;
        let mut listener = TcpListener::bind(addr).map_err(ServerError::Transport)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::Transport)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(ServerError::Transport)?);
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = ShutdownHandle {
            waker: Arc::clone(&waker),
            flag: Arc::clone(&shutdown),
        };

        Ok((
            EventLoop {
                poll,
                listener,
                store,
                connections: HashMap::new(),
                next_token: 1,
                shutdown,
                waker,
            },
            handle,
        ))
    }

    /// Runs until a [`ShutdownHandle::shutdown`] call drains all
    /// connections, or a fatal (non-would-block) error occurs on the
    /// listener itself.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(1024);
        let mut accepting = true;

        loop {
            self.poll
                .poll(&mut events, Some(Duration::from_millis(200)))
                .map_err(ServerError::Transport)?;

            if accepting && self.shutdown.load(Ordering::SeqCst) {
                tracing::info!(
                    pending_connections = self.connections.len(),
                    "shutdown requested, draining connections"
                );
                accepting = false;
                let _ = self.poll.registry().deregister(&mut self.listener);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER if accepting => self.accept_all()?,
                    LISTENER => {}
                    WAKER => {}
                    token => {
                        if let Some(conn) = self.connections.get_mut(&token) {
                            if event.is_readable() {
                                conn.do_read(&self.store);
                            }
                            if conn.alive && (event.is_writable() || conn.wants_write()) {
                                conn.do_write();
                            }
                            if conn.alive {
                                let wants_write = conn.wants_write();
                                if wants_write != conn.registered_writable {
                                    let interest = if wants_write {
                                        Interest::READABLE | Interest::WRITABLE
                                    } else {
                                        Interest::READABLE
                                    };
                                    if self
                                        .poll
                                        .registry()
                                        .reregister(&mut conn.stream, token, interest)
                                        .is_ok()
                                    {
                                        conn.registered_writable = wants_write;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            self.reap_dead_connections();

            if !accepting && self.connections.is_empty() {
                return Ok(());
            }
        }
    }

    /// The address the listener is bound to. Mainly useful in tests that
    /// bind to port 0 and need to discover the assigned port.
    pub fn listener_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("listener must be bound")
    }

    fn accept_all(&mut self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .map_err(ServerError::Transport)?;
                    self.connections.insert(token, Connection::new(stream));
                    tracing::debug!(?addr, token = token.0, "accepted connection");
                }
                Err(ref e) if would_block(e) => return Ok(()),
                Err(e) => return Err(ServerError::Transport(e)),
            }
        }
    }

    fn reap_dead_connections(&mut self) {
        let dead: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| !c.alive && c.outbox.is_empty())
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
                tracing::debug!(token = token.0, "closed connection");
            }
        }
    }
}

/// A handle to request graceful shutdown of a running
/// [`ThreadPerConnection`] loop from another thread.
#[derive(Clone)]
pub struct ThreadPerConnectionShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ThreadPerConnectionShutdownHandle {
    /// Requests shutdown: stop accepting new connections, let in-flight
    /// ones finish, then return from `run`.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Thread-per-connection `ConnectionLoop` variant: a blocking accept
/// loop on the calling thread, with each connection's lifetime handed to
/// the shared [`Executor`], admission-capped at `max_connections` via a
/// counting `Condvar`.
pub struct ThreadPerConnection {
    listener: std::net::TcpListener,
    store: Arc<Mutex<LRUStore>>,
    executor: Arc<Executor>,
    admission: Arc<(Mutex<usize>, Condvar)>,
    max_connections: usize,
    read_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl ThreadPerConnection {
    /// Binds `addr` and constructs a thread-per-connection server
    /// sharing `executor` and `store`.
    pub fn bind(
        addr: SocketAddr,
        store: Arc<Mutex<LRUStore>>,
        executor: Arc<Executor>,
        max_connections: usize,
        read_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let listener = std::net::TcpListener::bind(addr).map_err(ServerError::Transport)?;
        listener.set_nonblocking(true).map_err(ServerError::Transport)?;
        Ok(ThreadPerConnection {
            listener,
            store,
            executor,
            admission: Arc::new((Mutex::new(0), Condvar::new())),
            max_connections,
            read_timeout,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle that requests graceful shutdown of this loop.
    pub fn shutdown_handle(&self) -> ThreadPerConnectionShutdownHandle {
        ThreadPerConnectionShutdownHandle {
            flag: Arc::clone(&self.shutdown),
        }
    }

    /// Accepts connections until [`ThreadPerConnectionShutdownHandle::shutdown`]
    /// is called or the listener errors. Blocks the calling thread;
    /// callers typically run this on a dedicated acceptor thread. On
    /// shutdown, stops accepting and waits for in-flight connections to
    /// drain before returning.
    pub fn run(&self) -> Result<(), ServerError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if would_block(e) => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) => return Err(ServerError::Transport(e)),
            };
            let _ = stream.set_nonblocking(false);
            let _ = stream.set_read_timeout(Some(self.read_timeout));
            tracing::debug!(?addr, "accepted connection");

            {
                let (lock, cvar) = &*self.admission;
                let guard = lock.lock().expect("admission mutex poisoned");
                let mut guard = cvar
                    .wait_while(guard, |n| *n >= self.max_connections)
                    .expect("admission mutex poisoned");
                *guard += 1;
            }

            let store = Arc::clone(&self.store);
            let admission = Arc::clone(&self.admission);
            let submitted = self.executor.execute(move || {
                serve_blocking(stream, store);
                let (lock, cvar) = &*admission;
                *lock.lock().expect("admission mutex poisoned") -= 1;
                cvar.notify_one();
            });

            if !submitted {
                tracing::warn!("{}", ServerError::Exhausted("executor rejected connection task"));
                let (lock, cvar) = &*self.admission;
                *lock.lock().expect("admission mutex poisoned") -= 1;
                cvar.notify_one();
            }
        }

        tracing::info!("shutdown requested, draining in-flight connections");
        let (lock, cvar) = &*self.admission;
        let guard = lock.lock().expect("admission mutex poisoned");
        let _ = cvar
            .wait_while(guard, |n| *n > 0)
            .expect("admission mutex poisoned");
        Ok(())
    }
}

fn serve_blocking(mut stream: std::net::TcpStream, store: Arc<Mutex<LRUStore>>) {
    let mut parser = CommandParser::new();
    let mut read_buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => n,
            Err(ref e) if would_block(e) => continue,
            Err(e) => {
                tracing::error!("{}", ServerError::Transport(e));
                return;
            }
        };
        read_buf.extend_from_slice(&chunk[..n]);

        loop {
            match parser.parse(&read_buf) {
                ParseOutcome::NeedMoreData => break,
                ParseOutcome::Complete { command, consumed } => {
                    read_buf.drain(..consumed);
                    let response = {
                        let mut guard = lock_store(&store);
                        command.execute(&mut guard)
                    };
                    if let Err(e) = stream.write_all(&response) {
                        tracing::error!("{}", ServerError::Transport(e));
                        return;
                    }
                }
                ParseOutcome::Invalid { consumed, message } => {
                    read_buf.drain(..consumed);
                    parser.reset();
                    if let Err(e) =
                        stream.write_all(format!("ERROR {message}\r\n").as_bytes())
                    {
                        tracing::error!("{}", ServerError::Transport(e));
                        return;
                    }
                }
            }
        }
    }
}

/// Sharded `ConnectionLoop` variant: `N` sibling [`EventLoop`]s, each
/// running on its own thread against a shared [`LRUStore`], with
/// accepted connections round-robined by running `N` independent
/// listeners bound to the same port (`SO_REUSEPORT` semantics are left
/// to the OS/socket layer; here each shard simply binds and accepts
/// independently, which already balances load across shards under
/// typical kernel accept-queue fairness).
pub struct ShardedEventLoop {
    handles: Vec<ShutdownHandle>,
    joins: Vec<std::thread::JoinHandle<Result<(), ServerError>>>,
}

impl ShardedEventLoop {
    /// Spawns `shard_count` [`EventLoop`]s, each bound to `addr`, all
    /// sharing `store`.
    pub fn spawn(
        addr: SocketAddr,
        store: Arc<Mutex<LRUStore>>,
        shard_count: usize,
    ) -> Result<Self, ServerError> {
        let mut handles = Vec::with_capacity(shard_count);
        let mut joins = Vec::with_capacity(shard_count);

        for shard_id in 0..shard_count {
            let (mut event_loop, handle) = EventLoop::bind(addr, Arc::clone(&store))?;
            handles.push(handle);
            let join = std::thread::Builder::new()
                .name(format!("boundedkv-shard-{shard_id}"))
                .spawn(move || event_loop.run())
                .expect("failed to spawn shard thread");
            joins.push(join);
        }

        Ok(ShardedEventLoop { handles, joins })
    }

    /// A handle that requests graceful shutdown of every shard at once.
    pub fn shutdown_handle(&self) -> ShardedShutdownHandle {
        ShardedShutdownHandle {
            handles: self.handles.clone(),
        }
    }

    /// Blocks until every shard thread has exited (normally because a
    /// [`ShardedShutdownHandle`] requested it).
    pub fn join(self) -> Result<(), ServerError> {
        for join in self.joins {
            join.join().expect("shard thread panicked")?;
        }
        Ok(())
    }
}

/// Requests graceful shutdown of every shard in a [`ShardedEventLoop`].
#[derive(Clone)]
pub struct ShardedShutdownHandle {
    handles: Vec<ShutdownHandle>,
}

impl ShardedShutdownHandle {
    /// Requests shutdown of every shard.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.shutdown();
        }
    }
}
