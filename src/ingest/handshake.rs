// RTMP handshake
// Simple (digest-free) C0C1C2/S0S1S2 exchange

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

pub const RTMP_VERSION: u8 = 3;
pub const HANDSHAKE_SIZE: usize = 1536;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported RTMP version {0}")]
    InvalidVersion(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Initial,
    WaitingForPeerPacket,
    WaitingForPeerResponse,
    Done,
}

/// Handshake state machine, usable from either side of the connection.
/// The server side waits for C0C1, answers with S0S1S2 and expects C2.
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes the peer must deliver before `process` can advance.
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                1 + HANDSHAKE_SIZE * 2
            }
            (HandshakeState::WaitingForPeerResponse, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Client: produce C0C1. Server: arm the state machine (it speaks only
    /// after the client's C0C1).
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::WaitingForPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&generate_packet());
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Feed received bytes; returns the response to write, if any. `data`
    /// must hold at least `bytes_needed()` bytes.
    pub fn process(&mut self, data: &mut Bytes) -> Result<Option<Bytes>, HandshakeError> {
        match self.state {
            HandshakeState::WaitingForPeerPacket => self.process_peer_packet(data),
            HandshakeState::WaitingForPeerResponse => self.process_peer_response(data),
            _ => Ok(None),
        }
    }

    fn process_peer_packet(&mut self, data: &mut Bytes) -> Result<Option<Bytes>, HandshakeError> {
        match self.role {
            HandshakeRole::Server => {
                if data.remaining() < 1 + HANDSHAKE_SIZE {
                    return Ok(None);
                }

                let version = data.get_u8();
                // Lenient: some encoders send versions above 3
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version));
                }

                let mut c1 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut c1);

                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&generate_packet());
                response.put_slice(&generate_echo(&c1));

                self.state = HandshakeState::WaitingForPeerResponse;
                Ok(Some(response.freeze()))
            }
            HandshakeRole::Client => {
                if data.remaining() < 1 + HANDSHAKE_SIZE * 2 {
                    return Ok(None);
                }

                let version = data.get_u8();
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version));
                }

                let mut s1 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut s1);
                let mut s2 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut s2);
                // Lenient: S2 is not verified against C1

                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&generate_echo(&s1))))
            }
        }
    }

    fn process_peer_response(
        &mut self,
        data: &mut Bytes,
    ) -> Result<Option<Bytes>, HandshakeError> {
        if data.remaining() < HANDSHAKE_SIZE {
            return Ok(None);
        }
        let mut echo = [0u8; HANDSHAKE_SIZE];
        data.copy_to_slice(&mut echo);
        // Lenient: C2 is not verified against S1
        self.state = HandshakeState::Done;
        Ok(None)
    }
}

/// A C1/S1 packet: timestamp, zero field, then filler. The filler only needs
/// to be non-constant, not random in any stronger sense.
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());
    // Bytes 4..8 stay zero for the simple handshake

    let mut seed = u64::from(timestamp) | 1;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }

    packet
}

/// A C2/S2 packet: echo of the peer's packet with our receive timestamp.
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);
    echo[4..8].copy_from_slice(&timestamp.to_be_bytes());
    echo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_exchange() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let c0c1 = client.generate_initial().expect("client starts");
        assert!(server.generate_initial().is_none());

        let mut c0c1 = c0c1;
        let s0s1s2 = server.process(&mut c0c1).unwrap().expect("server answers");
        assert_eq!(s0s1s2.len(), 1 + HANDSHAKE_SIZE * 2);

        let mut s0s1s2 = s0s1s2;
        let c2 = client.process(&mut s0s1s2).unwrap().expect("client echoes");
        assert_eq!(c2.len(), HANDSHAKE_SIZE);
        assert!(client.is_done());

        let mut c2 = c2;
        assert!(server.process(&mut c2).unwrap().is_none());
        assert!(server.is_done());
    }

    #[test]
    fn test_incomplete_data_waits() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut partial = Bytes::from(vec![RTMP_VERSION; 100]);
        assert!(server.process(&mut partial).unwrap().is_none());
        assert!(!server.is_done());
    }

    #[test]
    fn test_low_version_rejected() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut bad = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        bad.put_u8(2);
        bad.put_slice(&[0u8; HANDSHAKE_SIZE]);
        let mut bad = bad.freeze();
        assert!(server.process(&mut bad).is_err());
    }

    #[test]
    fn test_echo_preserves_peer_bytes() {
        let original = generate_packet();
        let echo = generate_echo(&original);
        assert_eq!(&original[0..4], &echo[0..4]);
        assert_eq!(&original[8..], &echo[8..]);
    }
}
