//! Linux SocketCAN transport

use super::BusTransport;
use crate::types::{now_seconds, BusFrame, MirrorError, Result, MAX_STANDARD_ID};
use parking_lot::Mutex;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId};
use std::io;
use std::time::Duration;

/// A raw CAN socket bound to one interface
pub struct SocketCanTransport {
    channel: String,
    socket: CanSocket,
    send_lock: Mutex<()>,
}

impl SocketCanTransport {
    /// Bind to a SocketCAN interface such as `can0` or `vcan0`
    pub fn open(channel: &str) -> Result<Self> {
        let socket = CanSocket::open(channel).map_err(|e| {
            MirrorError::Transport(format!("Failed to open CAN interface {}: {}", channel, e))
        })?;
        Ok(Self {
            channel: channel.to_string(),
            socket,
            send_lock: Mutex::new(()),
        })
    }

    fn to_socket_frame(frame: &BusFrame) -> Result<CanFrame> {
        let id = if frame.is_extended {
            ExtendedId::new(frame.id).map(Id::Extended)
        } else if frame.id <= MAX_STANDARD_ID {
            StandardId::new(frame.id as u16).map(Id::Standard)
        } else {
            None
        }
        .ok_or_else(|| MirrorError::Transport(format!("Invalid CAN ID 0x{:X}", frame.id)))?;

        CanFrame::new(id, &frame.data).ok_or_else(|| {
            MirrorError::Transport(format!(
                "Cannot build a classic CAN frame for 0x{:X} with {} bytes",
                frame.id,
                frame.data.len()
            ))
        })
    }
}

impl BusTransport for SocketCanTransport {
    fn receive(&self, timeout: Duration) -> Result<Option<BusFrame>> {
        let frame = match self.socket.read_frame_timeout(timeout) {
            Ok(frame) => frame,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => {
                return Err(MirrorError::Transport(format!(
                    "Failed to read from {}: {}",
                    self.channel, e
                )))
            }
        };

        match frame {
            CanFrame::Data(data_frame) => {
                let id = match data_frame.id() {
                    Id::Standard(id) => u32::from(id.as_raw()),
                    Id::Extended(id) => id.as_raw(),
                };
                let frame = BusFrame::with_timestamp(id, data_frame.data(), now_seconds())?
                    .extended(data_frame.is_extended());
                Ok(Some(frame))
            }
            CanFrame::Remote(_) | CanFrame::Error(_) => {
                log::trace!("{}: skipping remote/error frame", self.channel);
                Ok(None)
            }
        }
    }

    fn send(&self, frame: &BusFrame) -> Result<()> {
        let socket_frame = Self::to_socket_frame(frame)?;
        let _guard = self.send_lock.lock();
        self.socket.write_frame(&socket_frame).map_err(|e| {
            MirrorError::Transport(format!(
                "Failed to send 0x{:X} on {}: {}",
                frame.id, self.channel, e
            ))
        })
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}
