use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FleetError, Result};

/// Frames larger than this indicate a corrupted stream, not a real message.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// One direction of a connected, ordered, lossless message pipe.
///
/// Each message is a 4-byte little-endian length followed by a bincode
/// payload, so message boundaries survive the byte stream. A channel is
/// used unidirectionally: one process keeps the sending end of a pair, the
/// peer keeps the receiving end.
pub struct Channel {
    stream: UnixStream,
    nonblocking: bool,
}

impl Channel {
    /// A connected pair of endpoints. Create before forking; afterwards each
    /// process keeps one end and drops the other.
    pub fn pair() -> Result<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Channel::from_stream(a), Channel::from_stream(b)))
    }

    fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            nonblocking: false,
        }
    }

    /// Switch the endpoint to non-blocking mode. Sends retry through a
    /// poll-for-writable loop instead of blocking in `write(2)`.
    pub fn set_nonblocking(&mut self) -> Result<()> {
        self.stream.set_nonblocking(true)?;
        self.nonblocking = true;
        Ok(())
    }

    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = bincode::serialize(value)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| FleetError::Protocol("message exceeds frame limit".into()))?;
        self.write_full(&len.to_le_bytes())?;
        self.write_full(&payload)
    }

    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len_bytes = [0u8; 4];
        self.read_full(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_FRAME_BYTES {
            return Err(FleetError::Protocol(format!(
                "oversized frame of {} bytes",
                len
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_full(&mut payload)?;
        Ok(bincode::deserialize(&payload)?)
    }

    /// Receive with an upper bound on the wait; used by the connection test.
    pub fn receive_timeout<T: DeserializeOwned>(&mut self, timeout: Duration) -> Result<Option<T>> {
        if !self.wait(PollFlags::POLLIN, Some(timeout))? {
            return Ok(None);
        }
        self.receive().map(Some)
    }

    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn write_full(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(FleetError::PeerClosed),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.wait(PollFlags::POLLOUT, None)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    return Err(FleetError::PeerClosed)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_full(&mut self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.stream.read(buf) {
                Ok(0) => return Err(FleetError::PeerClosed),
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.wait(PollFlags::POLLIN, None)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Poll this endpoint for one condition. `None` waits indefinitely.
    /// Returns whether the condition was met before the timeout.
    fn wait(&self, flags: PollFlags, timeout: Option<Duration>) -> Result<bool> {
        let timeout = timeout.map(TimeSpec::from_duration);
        loop {
            let mut fds = [PollFd::new(self.stream.as_fd(), flags)];
            match ppoll(&mut fds, timeout, None) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.as_raw_fd())
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_typed_messages_in_order() {
        let (mut tx, mut rx) = Channel::pair().unwrap();
        tx.send(&42u64).unwrap();
        tx.send(&"hello".to_string()).unwrap();
        assert_eq!(rx.receive::<u64>().unwrap(), 42);
        assert_eq!(rx.receive::<String>().unwrap(), "hello");
    }

    #[test]
    fn receive_timeout_expires_on_silence() {
        let (_tx, mut rx) = Channel::pair().unwrap();
        let got: Option<u64> = rx.receive_timeout(Duration::from_millis(20)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn closed_peer_surfaces_as_peer_closed() {
        let (tx, mut rx) = Channel::pair().unwrap();
        drop(tx);
        match rx.receive::<u64>() {
            Err(FleetError::PeerClosed) => {}
            other => panic!("expected PeerClosed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn nonblocking_send_still_delivers() {
        let (mut tx, mut rx) = Channel::pair().unwrap();
        tx.set_nonblocking().unwrap();
        for i in 0..100u32 {
            tx.send(&i).unwrap();
        }
        for i in 0..100u32 {
            assert_eq!(rx.receive::<u32>().unwrap(), i);
        }
    }
}
