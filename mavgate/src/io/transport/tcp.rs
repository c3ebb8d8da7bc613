//! TCP transport.
//!
//! Both roles parse the stream with a receive timeout so shutdown is polled
//! between reads:
//!
//! * the server accepts any number of clients and replicates outgoing frames
//!   to all of them;
//! * the client keeps a single stream and reconnects in a loop when the
//!   server goes away, so traffic resumes without caller intervention.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mavio::error::{Error as MavioError, IoErrorKind};
use mavio::io::StdIoReader;
use mavio::protocol::{Versionless, V2};
use mavio::Frame;

use crate::consts::{RECV_TIMEOUT, TCP_RECONNECT_DELAY};
use crate::io::{frame_to_bytes, FrameProducer};
use crate::utils::{Closable, Closer};

use crate::prelude::*;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// TCP connection, either a listening server or a reconnecting client.
#[derive(Debug)]
pub struct TcpConnection {
    streams: Arc<Mutex<HashMap<SocketAddr, TcpStream>>>,
    readers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    closer: Closer,
    main_thread: Option<thread::JoinHandle<()>>,
}

impl TcpConnection {
    /// Starts a server listening on `bind_addr`.
    pub fn listen(bind_addr: SocketAddr, producer: FrameProducer) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        listener.set_nonblocking(true)?;

        let streams: Arc<Mutex<HashMap<SocketAddr, TcpStream>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let readers: Arc<Mutex<Vec<thread::JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let closer = Closer::new();

        let main_thread = {
            let streams = streams.clone();
            let readers = readers.clone();
            let state = closer.to_closable();
            thread::spawn(move || Self::accept_loop(listener, streams, readers, producer, state))
        };

        log::debug!("[tcp] listening on {bind_addr}");

        Ok(Self {
            streams,
            readers,
            closer,
            main_thread: Some(main_thread),
        })
    }

    /// Starts a client connecting to `remote_addr`.
    ///
    /// The returned connection is usable immediately; frames sent before the
    /// stream is established fail with [`Error::NoRemotes`].
    pub fn connect(remote_addr: SocketAddr, producer: FrameProducer) -> Result<Self> {
        let streams: Arc<Mutex<HashMap<SocketAddr, TcpStream>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let closer = Closer::new();

        let main_thread = {
            let streams = streams.clone();
            let state = closer.to_closable();
            thread::spawn(move || Self::client_loop(remote_addr, streams, producer, state))
        };

        Ok(Self {
            streams,
            readers: Arc::new(Mutex::new(Vec::new())),
            closer,
            main_thread: Some(main_thread),
        })
    }

    fn accept_loop(
        listener: TcpListener,
        streams: Arc<Mutex<HashMap<SocketAddr, TcpStream>>>,
        readers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
        producer: FrameProducer,
        state: Closable,
    ) {
        while !state.is_closed() {
            let (stream, peer_addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(err) => {
                    log::warn!("[tcp] accept failed: {err:?}");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
            };

            log::debug!("[tcp] client connected: {peer_addr}");

            let reader = match Self::prepare_stream(&stream) {
                Ok(reader) => reader,
                Err(err) => {
                    log::warn!("[tcp] failed to set up client stream {peer_addr}: {err:?}");
                    continue;
                }
            };
            streams.lock().unwrap().insert(peer_addr, stream);

            let handle = {
                let streams = streams.clone();
                let producer = producer.clone();
                let state = state.clone();
                thread::spawn(move || {
                    Self::read_stream(reader, &producer, &state);
                    streams.lock().unwrap().remove(&peer_addr);
                    log::debug!("[tcp] client disconnected: {peer_addr}");
                })
            };
            let mut readers = readers.lock().unwrap();
            readers.retain(|reader| !reader.is_finished());
            readers.push(handle);
        }
    }

    fn client_loop(
        remote_addr: SocketAddr,
        streams: Arc<Mutex<HashMap<SocketAddr, TcpStream>>>,
        producer: FrameProducer,
        state: Closable,
    ) {
        while !state.is_closed() {
            let stream = match TcpStream::connect(remote_addr) {
                Ok(stream) => stream,
                Err(err) => {
                    log::trace!("[tcp] connect to {remote_addr} failed: {err:?}");
                    thread::sleep(TCP_RECONNECT_DELAY);
                    continue;
                }
            };

            log::debug!("[tcp] connected to {remote_addr}");

            let reader = match Self::prepare_stream(&stream) {
                Ok(reader) => reader,
                Err(err) => {
                    log::warn!("[tcp] failed to set up stream to {remote_addr}: {err:?}");
                    thread::sleep(TCP_RECONNECT_DELAY);
                    continue;
                }
            };
            streams.lock().unwrap().insert(remote_addr, stream);

            // Blocks until the stream dies, then falls through to reconnect.
            Self::read_stream(reader, &producer, &state);
            streams.lock().unwrap().remove(&remote_addr);

            if !state.is_closed() {
                log::debug!("[tcp] connection to {remote_addr} lost, reconnecting");
                thread::sleep(TCP_RECONNECT_DELAY);
            }
        }
    }

    fn prepare_stream(stream: &TcpStream) -> Result<TcpStream> {
        stream.set_read_timeout(Some(RECV_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(stream.try_clone()?)
    }

    /// Reads frames until the stream fails or the connection is closed.
    fn read_stream(stream: TcpStream, producer: &FrameProducer, state: &Closable) {
        let mut reader: mavio::Receiver<_, _, Versionless> =
            mavio::Receiver::new(StdIoReader::new(stream));

        loop {
            if state.is_closed() {
                return;
            }

            let frame = match reader.recv() {
                Ok(frame) => frame,
                Err(MavioError::Io(err))
                    if matches!(
                        err.kind(),
                        IoErrorKind::Std(
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        )
                    ) =>
                {
                    continue;
                }
                Err(MavioError::Io(err)) => {
                    log::trace!("[tcp] stream read failed: {err:?}");
                    return;
                }
                // Framing errors: resynchronization is handled by the reader.
                Err(_) => continue,
            };

            if producer.send(frame).is_err() {
                log::trace!("[tcp] frame consumer is gone, stopping read loop");
                return;
            }
        }
    }

    /// Sends a frame to every live stream.
    ///
    /// Streams that fail to accept the frame are dropped; a client stream will
    /// be re-established by the reconnect loop.
    pub fn send_frame(&self, frame: &Frame<V2>) -> Result<()> {
        if self.closer.is_closed() {
            return Err(Error::ConnectionStopped);
        }

        let bytes = frame_to_bytes(frame)?;

        let mut streams = self.streams.lock().unwrap();
        if streams.is_empty() {
            return Err(Error::NoRemotes);
        }

        let mut dead = Vec::new();
        for (addr, stream) in streams.iter_mut() {
            if let Err(err) = stream.write_all(&bytes) {
                log::warn!("[tcp] send to {addr} failed: {err:?}");
                dead.push(*addr);
            }
        }

        let total = streams.len();
        for addr in &dead {
            streams.remove(addr);
        }

        if dead.len() == total {
            return Err(Error::AllRemotesFailed);
        }
        Ok(())
    }

    /// Stops all threads and closes every stream.
    ///
    /// Every stream is shut down so blocked reads return immediately, and
    /// every reader thread is joined. No frame is delivered after this
    /// method returns.
    pub fn stop(&mut self) {
        self.closer.close();
        {
            let mut streams = self.streams.lock().unwrap();
            for stream in streams.values() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            streams.clear();
        }
        if let Some(handle) = self.main_thread.take() {
            if handle.join().is_err() {
                log::error!("[tcp] main thread panicked");
            }
        }
        let readers = std::mem::take(&mut *self.readers.lock().unwrap());
        for handle in readers {
            if handle.join().is_err() {
                log::error!("[tcp] reader thread panicked");
            }
        }
        log::debug!("[tcp] connection stopped");
    }
}
