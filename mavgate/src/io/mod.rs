//! Connection layer: transports, addressing, and the remote endpoint table.
//!
//! A [`Connection`] owns one transport and its background receive threads.
//! Incoming frames are pushed into an [`mpsc`](std::sync::mpsc) channel
//! serviced by the router; outgoing frames go through [`SendFrame`], the seam
//! between protocol clients and transports.

pub mod connection;
pub mod endpoint;
pub mod remote;
pub mod transport;

pub use connection::Connection;
pub use endpoint::ConnAddr;
pub use remote::{RemoteOption, RemoteTable};

use std::sync::mpsc;

use mavio::io::{StdIoReader, StdIoWriter};
use mavio::protocol::{Versionless, V2};
use mavio::Frame;

use crate::prelude::*;

/// Producer half of the incoming frame channel.
///
/// Transports push every successfully parsed frame here, regardless of MAVLink
/// version on the wire.
pub type FrameProducer = mpsc::Sender<Frame<Versionless>>;

/// Outbound frame sink.
///
/// Protocol clients hold the sink as a trait object so that tests can inject
/// an in-memory link in place of a real transport. Everything this crate
/// emits is MAVLink 2.
pub trait SendFrame: Send + Sync {
    /// Sends a single frame.
    fn send_frame(&self, frame: &Frame<V2>) -> Result<()>;
}

impl<F> SendFrame for F
where
    F: Fn(&Frame<V2>) -> Result<()> + Send + Sync,
{
    fn send_frame(&self, frame: &Frame<V2>) -> Result<()> {
        self(frame)
    }
}

/// Serializes a frame into its wire bytes.
pub(crate) fn frame_to_bytes(frame: &Frame<V2>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(280);
    {
        let mut writer = mavio::Sender::new(StdIoWriter::new(&mut buf));
        writer.send(frame)?;
    }
    Ok(buf)
}

/// Parses every frame contained in a received datagram or buffer slice.
///
/// A single UDP datagram may carry several MAVLink frames back to back.
/// Parsing stops at the first framing error or end of input; valid frames
/// before the error are still returned.
pub(crate) fn frames_from_bytes(bytes: &[u8]) -> Vec<Frame<Versionless>> {
    let mut frames = Vec::new();
    let mut reader: mavio::Receiver<_, _, Versionless> =
        mavio::Receiver::new(StdIoReader::new(bytes));
    while let Ok(frame) = reader.recv() {
        frames.push(frame);
    }
    frames
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_io {
    use super::*;
    use mavio::dialects::minimal::messages::Heartbeat;
    use mavio::protocol::{Endpoint, MavLinkId};

    #[test]
    fn datagram_with_multiple_frames_parses_fully() {
        let endpoint: Endpoint<V2> = Endpoint::new(MavLinkId::new(1, 1));

        let mut bytes = Vec::new();
        for _ in 0..3 {
            let frame = endpoint.next_frame(&Heartbeat::default()).unwrap();
            bytes.extend_from_slice(&frame_to_bytes(&frame).unwrap());
        }

        let frames = frames_from_bytes(&bytes);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].sequence() + 1, frames[1].sequence());
    }

    #[test]
    fn truncated_tail_does_not_lose_leading_frames() {
        let endpoint: Endpoint<V2> = Endpoint::new(MavLinkId::new(1, 1));

        let mut bytes = Vec::new();
        for _ in 0..2 {
            let frame = endpoint.next_frame(&Heartbeat::default()).unwrap();
            bytes.extend_from_slice(&frame_to_bytes(&frame).unwrap());
        }
        bytes.truncate(bytes.len() - 4);

        let frames = frames_from_bytes(&bytes);
        assert_eq!(frames.len(), 1);
    }
}
