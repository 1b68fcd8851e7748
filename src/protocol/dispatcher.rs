//! Request/response multiplexing over a single connection.
//!
//! A [`Dispatcher`] owns both halves of a byte stream. Outgoing requests are stamped with
//! an id from a per-connection counter and written under a lock so frames never
//! interleave. A single background reader thread decodes every incoming
//! [`ResponseEnvelope`] and hands it to whichever handler is registered for its id in the
//! pending-call table.
//!
//! Two call shapes are supported:
//!
//! - [`Dispatcher::call`] blocks the caller until the reply arrives or the timeout expires.
//! - [`Dispatcher::stream`] registers a [`ResponseSink`] that receives every message for
//!   the id, up to and including the one marked `last`, on the reader thread.
//!
//! Once the reader sees the stream fail the connection is closed for good. The failure is
//! kept and returned to the next caller instead of letting it wait on a dead socket.
use std::{
    io::{Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError, SyncSender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use dashmap::DashMap;
use log::{debug, info, trace, warn};

use crate::error::DriverError;

use super::{Request, RequestEnvelope, Response, ResponseEnvelope, transport::ProtocolTransport};

pub type ShutdownHook = Box<dyn FnOnce() + Send>;

type Reply = Result<Response, DriverError>;

/// Receives the messages of a streaming call.
///
/// Called on the dispatcher's reader thread: implementations must hand the message off
/// and return quickly.
pub trait ResponseSink: Send {
    fn on_message(&mut self, response: Response, last: bool);

    /// Terminal failure. No further messages follow.
    fn on_error(&mut self, error: DriverError);
}

#[derive(Clone)]
enum Handler {
    Unary(SyncSender<Reply>),
    Stream(Arc<Mutex<Box<dyn ResponseSink>>>),
}

impl Handler {
    fn deliver(&self, id: u64, response: Response, last: bool) {
        match self {
            Handler::Unary(tx) => {
                let reply = match response {
                    Response::Err(detail) => Err(detail.into()),
                    response => Ok(response),
                };
                if tx.try_send(reply).is_err() {
                    debug!("caller for request {id} is no longer waiting");
                }
            }
            Handler::Stream(sink) => {
                let mut sink = lock(sink);
                match response {
                    Response::Err(detail) => sink.on_error(detail.into()),
                    response => sink.on_message(response, last),
                }
            }
        }
    }

    fn fail(&self, error: DriverError) {
        match self {
            Handler::Unary(tx) => {
                let _ = tx.try_send(Err(error));
            }
            Handler::Stream(sink) => lock(sink).on_error(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Open,
    /// Holds the failure that closed the connection, if it was not closed locally.
    Closed(Option<DriverError>),
}

struct Shared {
    pending: DashMap<u64, Handler>,
    state: Mutex<ConnectionState>,
    closing: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn closed_error(state: &ConnectionState) -> Option<DriverError> {
        match state {
            ConnectionState::Open => None,
            ConnectionState::Closed(cause) => {
                Some(cause.clone().unwrap_or(DriverError::ConnectionClosed))
            }
        }
    }

    fn dispatch(&self, envelope: ResponseEnvelope) {
        let ResponseEnvelope { id, last, response } = envelope;

        let handler = match self.pending.get(&id) {
            Some(entry) => entry.value().clone(),
            None => {
                warn!("dropping response for unknown request {id}");
                return;
            }
        };

        let terminal =
            last || matches!(handler, Handler::Unary(_)) || matches!(response, Response::Err(_));
        if terminal {
            self.pending.remove(&id);
        }

        trace!("delivering response for request {id} (last: {last})");
        handler.deliver(id, response, last);
    }

    /// Moves the connection to closed and fails every outstanding call.
    fn close(&self, cause: Option<DriverError>) {
        let cause = if self.closing.load(Ordering::SeqCst) {
            None
        } else {
            cause
        };

        {
            let mut state = lock(&self.state);
            if let ConnectionState::Closed(_) = *state {
                return;
            }
            if let Some(ref cause) = cause {
                warn!("connection failed: {cause}");
            }
            *state = ConnectionState::Closed(cause.clone());
        }

        let error = cause.unwrap_or(DriverError::ConnectionClosed);
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, handler)) = self.pending.remove(&id) {
                handler.fail(error.clone());
            }
        }
    }
}

pub struct Dispatcher {
    next_id: AtomicU64,
    shared: Arc<Shared>,
    writer: Mutex<ProtocolTransport<Box<dyn Write + Send>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: Mutex<Option<ShutdownHook>>,
}

impl Dispatcher {
    /// Starts a dispatcher over a TCP connection.
    pub fn connect(stream: TcpStream) -> Result<Self, DriverError> {
        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::Transport(e.to_string()))?;
        let reader = stream
            .try_clone()
            .map_err(|e| DriverError::Transport(e.to_string()))?;
        let closer = stream
            .try_clone()
            .map_err(|e| DriverError::Transport(e.to_string()))?;

        Self::new(
            reader,
            stream,
            Some(Box::new(move || {
                if let Err(e) = closer.shutdown(Shutdown::Both) {
                    debug!("socket shutdown: {e}");
                }
            })),
        )
    }

    /// Starts a dispatcher over an arbitrary pair of stream halves.
    ///
    /// `shutdown` must unblock a read pending on `reader`. Without it, [`Dispatcher::close`]
    /// cannot wait for the reader thread and leaves it to exit when the peer hangs up.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        shutdown: Option<ShutdownHook>,
    ) -> Result<Self, DriverError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            state: Mutex::new(ConnectionState::Open),
            closing: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("floe-reader".into())
            .spawn(move || read_loop(ProtocolTransport::new(reader), reader_shared))
            .map_err(|e| DriverError::Transport(format!("failed to spawn reader: {e}")))?;

        let writer: Box<dyn Write + Send> = Box::new(writer);
        Ok(Self {
            next_id: AtomicU64::new(1),
            shared,
            writer: Mutex::new(ProtocolTransport::new(writer)),
            reader: Mutex::new(Some(handle)),
            shutdown: Mutex::new(shutdown),
        })
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.shared.state) == ConnectionState::Open
    }

    /// Number of calls still waiting for a response.
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sends `request` and blocks until its reply arrives.
    ///
    /// A zero `timeout` waits indefinitely. On timeout the call is forgotten locally; a
    /// reply that shows up later is dropped by the reader.
    pub fn call(&self, request: Request, timeout: Duration) -> Result<Response, DriverError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let id = self.submit(request, Handler::Unary(tx))?;

        let reply = if timeout.is_zero() {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(timeout)
        };

        match reply {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                self.shared.pending.remove(&id);
                debug!("request {id} timed out after {timeout:?}");
                Err(DriverError::Timeout { id, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(Shared::closed_error(
                &lock(&self.shared.state),
            )
            .unwrap_or(DriverError::ConnectionClosed)),
        }
    }

    /// Sends `request` and returns its id immediately. Every message for the id is
    /// delivered to `sink` until one is marked `last`.
    pub fn stream(
        &self,
        request: Request,
        sink: Box<dyn ResponseSink>,
    ) -> Result<u64, DriverError> {
        self.submit(request, Handler::Stream(Arc::new(Mutex::new(sink))))
    }

    /// Stops delivering messages for a streaming call. Returns whether the call was still
    /// registered.
    pub fn cancel(&self, id: u64) -> bool {
        match self.shared.pending.remove(&id) {
            Some((_, handler)) => {
                handler.fail(DriverError::Interrupted(format!("request {id} cancelled")));
                true
            }
            None => false,
        }
    }

    fn submit(&self, request: Request, handler: Handler) -> Result<u64, DriverError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = request.name();

        {
            let state = lock(&self.shared.state);
            if let Some(error) = Shared::closed_error(&state) {
                return Err(error);
            }
            self.shared.pending.insert(id, handler);
        }

        let envelope = RequestEnvelope { id, request };
        let sent = lock(&self.writer).write_request(&envelope);
        if let Err(e) = sent {
            self.shared.pending.remove(&id);
            let error = DriverError::from(e);
            self.shared.close(Some(error.clone()));
            return Err(error);
        }

        trace!("sent {name} request {id}");
        Ok(id)
    }

    /// Closes the connection. Outstanding calls fail with
    /// [`DriverError::ConnectionClosed`]. Calling it again does nothing.
    pub fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing connection");

        let hook = lock(&self.shutdown).take();
        let reader = lock(&self.reader).take();
        match hook {
            Some(hook) => {
                hook();
                if let Some(handle) = reader {
                    if handle.join().is_err() {
                        warn!("reader thread panicked");
                    }
                }
            }
            None => debug!("no shutdown hook; leaving reader thread to exit on its own"),
        }

        self.shared.close(None);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop<R: Read>(mut transport: ProtocolTransport<R>, shared: Arc<Shared>) {
    loop {
        match transport.read_response() {
            Ok(Some(envelope)) => shared.dispatch(envelope),
            Ok(None) => {
                debug!("server closed the connection");
                shared.close(Some(DriverError::Transport(
                    "server closed the connection".into(),
                )));
                break;
            }
            Err(e) => {
                if !shared.closing.load(Ordering::SeqCst) {
                    warn!("reader stopped: {e}");
                }
                shared.close(Some(e.into()));
                break;
            }
        }
    }
}

/// [`ResponseSink`] that forwards messages into an unbounded channel, so the reader
/// thread never waits on the consumer.
pub struct ChannelSink {
    tx: mpsc::Sender<Result<(Response, bool), DriverError>>,
}

impl ResponseSink for ChannelSink {
    fn on_message(&mut self, response: Response, last: bool) {
        let _ = self.tx.send(Ok((response, last)));
    }

    fn on_error(&mut self, error: DriverError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Receiving end of a [`ChannelSink`].
///
/// Iterates over the messages of one streaming call and stops after the message marked
/// `last` or after the first error.
pub struct StreamReceiver {
    rx: mpsc::Receiver<Result<(Response, bool), DriverError>>,
    done: bool,
}

impl StreamReceiver {
    /// Waits at most `timeout` for the next message. `Ok(None)` means the stream is
    /// finished.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Response>, DriverError> {
        if self.done {
            return Ok(None);
        }

        match self.rx.recv_timeout(timeout) {
            Ok(Ok((response, last))) => {
                self.done = last;
                Ok(Some(response))
            }
            Ok(Err(e)) => {
                self.done = true;
                Err(e)
            }
            // The receiver does not know its request id; 0 is never allocated.
            Err(RecvTimeoutError::Timeout) => Err(DriverError::Timeout { id: 0, timeout }),
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Err(DriverError::ConnectionClosed)
            }
        }
    }
}

impl Iterator for StreamReceiver {
    type Item = Result<Response, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.rx.recv() {
            Ok(Ok((response, last))) => {
                self.done = last;
                Some(Ok(response))
            }
            Ok(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Err(_) => {
                self.done = true;
                Some(Err(DriverError::ConnectionClosed))
            }
        }
    }
}

/// Creates a channel-backed sink and its receiver.
pub fn channel() -> (ChannelSink, StreamReceiver) {
    let (tx, rx) = mpsc::channel();
    (ChannelSink { tx }, StreamReceiver { rx, done: false })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        net::{TcpListener, TcpStream},
        time::Instant,
    };

    use super::*;
    use crate::{
        protocol::ErrorDetail,
        row::WireFrame,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Spawns a scripted peer and connects a dispatcher to it.
    fn peer<F>(script: F) -> (Dispatcher, JoinHandle<()>)
    where
        F: FnOnce(ProtocolTransport<TcpStream>) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(ProtocolTransport::new(stream));
        });

        let dispatcher = Dispatcher::connect(TcpStream::connect(address).unwrap()).unwrap();
        (dispatcher, handle)
    }

    fn reply(transport: &mut ProtocolTransport<TcpStream>, id: u64, last: bool, response: Response) {
        transport
            .write_response(&ResponseEnvelope { id, last, response })
            .unwrap();
    }

    fn frame(offset: u64, is_last: bool) -> Response {
        Response::Frame(WireFrame {
            offset,
            is_last,
            rows: vec![],
        })
    }

    #[test]
    fn unary_call() {
        let (dispatcher, peer) = peer(|mut t| {
            let req = t.read_request().unwrap().unwrap();
            assert_eq!(req.request, Request::Ping);
            reply(&mut t, req.id, true, Response::Pong);
        });

        assert_eq!(dispatcher.call(Request::Ping, TIMEOUT).unwrap(), Response::Pong);
        assert_eq!(dispatcher.pending(), 0);
        peer.join().unwrap();
    }

    #[test]
    fn concurrent_calls_get_their_own_reply() {
        const CALLS: u64 = 8;

        let (dispatcher, peer) = peer(|mut t| {
            let mut requests = Vec::new();
            for _ in 0..CALLS {
                requests.push(t.read_request().unwrap().unwrap());
            }

            let ids: HashSet<u64> = requests.iter().map(|r| r.id).collect();
            assert_eq!(ids.len(), CALLS as usize);

            // Answer out of order.
            for req in requests.into_iter().rev() {
                let Request::Fetch { statement_id, .. } = req.request else {
                    panic!("unexpected request {req:?}");
                };
                reply(&mut t, req.id, true, frame(statement_id, false));
            }
        });

        let dispatcher = Arc::new(dispatcher);
        let callers: Vec<_> = (0..CALLS)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    let request = Request::Fetch {
                        statement_id: i,
                        offset: 0,
                        fetch_size: 1,
                    };
                    assert_eq!(dispatcher.call(request, TIMEOUT).unwrap(), frame(i, false));
                })
            })
            .collect();

        for caller in callers {
            caller.join().unwrap();
        }
        peer.join().unwrap();
    }

    #[test]
    fn timeout_leaves_connection_usable() {
        let (dispatcher, peer) = peer(|mut t| {
            let ignored = t.read_request().unwrap().unwrap();
            let next = t.read_request().unwrap().unwrap();
            // Late reply for the timed out call is dropped by the reader.
            reply(&mut t, ignored.id, true, Response::Ok);
            reply(&mut t, next.id, true, Response::Pong);
        });

        let start = Instant::now();
        let err = dispatcher
            .call(Request::Commit, Duration::from_millis(50))
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout(), "{err:?}");
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
        assert_eq!(dispatcher.pending(), 0);

        assert_eq!(dispatcher.call(Request::Ping, TIMEOUT).unwrap(), Response::Pong);
        assert!(dispatcher.is_open());
        peer.join().unwrap();
    }

    #[test]
    fn service_error_is_scoped_to_one_call() {
        let (dispatcher, peer) = peer(|mut t| {
            let first = t.read_request().unwrap().unwrap();
            reply(
                &mut t,
                first.id,
                true,
                Response::Err(ErrorDetail::new(7, "bad statement").with_sql_state("42000")),
            );
            let second = t.read_request().unwrap().unwrap();
            reply(&mut t, second.id, true, Response::Pong);
        });

        let err = dispatcher
            .call(Request::Prepare { sql: "?".into() }, TIMEOUT)
            .unwrap_err();
        assert_eq!(
            err,
            DriverError::Service {
                code: 7,
                message: "bad statement".into(),
                sql_state: Some("42000".into()),
            }
        );
        assert_eq!(dispatcher.call(Request::Ping, TIMEOUT).unwrap(), Response::Pong);
        peer.join().unwrap();
    }

    #[test]
    fn stream_delivers_every_message_in_order() {
        let (dispatcher, peer) = peer(|mut t| {
            let req = t.read_request().unwrap().unwrap();
            for offset in 0..3 {
                reply(&mut t, req.id, offset == 2, frame(offset, offset == 2));
            }
        });

        let (sink, receiver) = channel();
        dispatcher
            .stream(
                Request::ExecuteStream {
                    sql: "select".into(),
                    fetch_size: 1,
                },
                Box::new(sink),
            )
            .unwrap();

        let messages: Vec<Response> = receiver.map(Result::unwrap).collect();
        assert_eq!(
            messages,
            vec![frame(0, false), frame(1, false), frame(2, true)]
        );
        assert_eq!(dispatcher.pending(), 0);
        peer.join().unwrap();
    }

    #[test]
    fn peer_hangup_fails_pending_and_next_calls() {
        let (dispatcher, peer) = peer(|mut t| {
            t.read_request().unwrap().unwrap();
        });

        let err = dispatcher.call(Request::Ping, TIMEOUT).unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        peer.join().unwrap();

        assert!(!dispatcher.is_open());
        let err = dispatcher.call(Request::Ping, TIMEOUT).unwrap_err();
        assert_eq!(
            err,
            DriverError::Transport("server closed the connection".into())
        );
    }

    #[test]
    fn calls_after_close_are_refused() {
        let (dispatcher, peer) = peer(|mut t| while let Ok(Some(_)) = t.read_request() {});

        dispatcher.close();
        dispatcher.close();

        assert_eq!(
            dispatcher.call(Request::Ping, TIMEOUT).unwrap_err(),
            DriverError::ConnectionClosed
        );
        peer.join().unwrap();
    }

    #[test]
    fn cancelled_stream_reports_interruption() {
        let (dispatcher, peer) = peer(|mut t| while let Ok(Some(_)) = t.read_request() {});

        let (sink, mut receiver) = channel();
        let id = dispatcher
            .stream(
                Request::ExecuteStream {
                    sql: "select".into(),
                    fetch_size: 1,
                },
                Box::new(sink),
            )
            .unwrap();

        assert!(dispatcher.cancel(id));
        assert!(!dispatcher.cancel(id));
        assert!(receiver.recv_timeout(TIMEOUT).unwrap_err().is_interrupted());
        drop(dispatcher);
        peer.join().unwrap();
    }
}
