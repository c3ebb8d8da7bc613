//! Serial transport.

use std::sync::{Arc, Mutex};
use std::thread;

use mavio::error::{Error as MavioError, IoErrorKind};
use mavio::io::StdIoReader;
use mavio::protocol::{Versionless, V2};
use mavio::Frame;
use serialport::SerialPort;

use crate::consts::RECV_TIMEOUT;
use crate::io::{frame_to_bytes, FrameProducer};
use crate::utils::{Closable, Closer};

use crate::prelude::*;

/// Serial connection.
pub struct SerialConnection {
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    closer: Closer,
    recv_thread: Option<thread::JoinHandle<()>>,
}

impl SerialConnection {
    /// Opens `path` at `baud` and starts the receive thread.
    pub fn connect(path: &str, baud: u32, producer: FrameProducer) -> Result<Self> {
        let port = serialport::new(path, baud).timeout(RECV_TIMEOUT).open()?;
        let reader = port.try_clone()?;
        let writer = Arc::new(Mutex::new(port));

        let closer = Closer::new();
        let recv_thread = {
            let state = closer.to_closable();
            thread::spawn(move || Self::recv_loop(reader, producer, state))
        };

        log::debug!("[serial] opened {path} at {baud} baud");

        Ok(Self {
            writer,
            closer,
            recv_thread: Some(recv_thread),
        })
    }

    fn recv_loop(port: Box<dyn SerialPort>, producer: FrameProducer, state: Closable) {
        let mut reader: mavio::Receiver<_, _, Versionless> =
            mavio::Receiver::new(StdIoReader::new(port));

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
                    log::warn!("[serial] read failed: {err:?}");
                    return;
                }
                // Line noise: skip to the next frame boundary.
                Err(_) => continue,
            };

            if producer.send(frame).is_err() {
                log::trace!("[serial] frame consumer is gone, stopping receive loop");
                return;
            }
        }
    }

    /// Writes a frame to the device.
    pub fn send_frame(&self, frame: &Frame<V2>) -> Result<()> {
        if self.closer.is_closed() {
            return Err(Error::ConnectionStopped);
        }

        let bytes = frame_to_bytes(frame)?;
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Stops the receive thread and releases the device.
    pub fn stop(&mut self) {
        self.closer.close();
        if let Some(handle) = self.recv_thread.take() {
            if handle.join().is_err() {
                log::error!("[serial] receive thread panicked");
            }
        }
        log::debug!("[serial] connection stopped");
    }
}
