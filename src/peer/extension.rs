//! The extension protocol (BEP 10): the bencoded extended handshake, the
//! sub-id negotiation for the extensions the engine consumes, and the
//! ut_holepunch message format.

use std::{
    collections::HashMap,
    convert::TryInto,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use bytes::{Buf, BufMut, BytesMut};
use serde_bytes::ByteBuf;

use crate::error::{Error, Result};

/// The sub-ids under which we receive the extensions we implement. The
/// peer's ids for the same extensions come from its handshake's `m` dict
/// and are echoed back when we send.
pub(crate) mod ext_id {
    /// The extended handshake itself.
    pub const HANDSHAKE: u8 = 0;
    pub const UPLOAD_ONLY: u8 = 3;
    pub const HOLEPUNCH: u8 = 4;
    pub const DONT_HAVE: u8 = 7;
    pub const SHARE_MODE: u8 = 8;
}

/// The bencoded dictionary exchanged as extended message 0.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps extension names to the sub-ids the sender receives them under.
    /// A zero id means the sender disabled the extension.
    #[serde(default)]
    pub m: HashMap<String, i64>,
    /// Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    /// The sender's listening port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<u16>,
    /// The number of outstanding requests the sender is willing to queue;
    /// overrides our outgoing pipeline cap towards this peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<i64>,
    /// The address the sender sees us under: 4 or 16 raw bytes. One vote
    /// towards our external address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yourip: Option<ByteBuf>,
    /// Whether the sender is only uploading (i.e. a seed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_only: Option<i64>,
    /// Seconds since the sender completed the torrent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_ago: Option<i64>,
}

impl ExtendedHandshake {
    /// The handshake we send: our sub-id registrations and identity.
    pub fn ours(user_agent: &str, listen_port: Option<u16>, reqq: i64) -> Self {
        let mut m = HashMap::new();
        m.insert("upload_only".to_string(), i64::from(ext_id::UPLOAD_ONLY));
        m.insert("ut_holepunch".to_string(), i64::from(ext_id::HOLEPUNCH));
        m.insert("lt_donthave".to_string(), i64::from(ext_id::DONT_HAVE));
        m.insert("share_mode".to_string(), i64::from(ext_id::SHARE_MODE));
        Self {
            m,
            v: Some(user_agent.to_string()),
            p: listen_port,
            reqq: Some(reqq),
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// The address the peer sees us under, if it sent a well-formed one.
    pub fn your_ip(&self) -> Option<IpAddr> {
        let bytes = self.yourip.as_ref()?;
        match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes[..].try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let octets: [u8; 16] = bytes[..].try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }
}

/// The sub-ids a peer registered for the extensions we can send it. Absent
/// means the peer doesn't speak the extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PeerExtensions {
    pub upload_only: Option<u8>,
    pub holepunch: Option<u8>,
    pub dont_have: Option<u8>,
    pub share_mode: Option<u8>,
}

impl PeerExtensions {
    /// Extracts the extensions we consume, and only those, from a peer's
    /// handshake.
    pub fn from_handshake(handshake: &ExtendedHandshake) -> Self {
        let id_of = |name: &str| -> Option<u8> {
            match handshake.m.get(name) {
                // zero disables, and ids beyond a byte are nonsense
                Some(&id) if id > 0 && id <= i64::from(u8::MAX) => {
                    Some(id as u8)
                }
                _ => None,
            }
        };
        Self {
            upload_only: id_of("upload_only"),
            holepunch: id_of("ut_holepunch"),
            dont_have: id_of("lt_donthave"),
            share_mode: id_of("share_mode"),
        }
    }
}

/// ut_holepunch message types.
const HOLEPUNCH_RENDEZVOUS: u8 = 0;
const HOLEPUNCH_CONNECT: u8 = 1;
const HOLEPUNCH_FAILED: u8 = 2;

/// ut_holepunch address families.
const FAMILY_V4: u8 = 0;
const FAMILY_V6: u8 = 1;

/// A ut_holepunch message: `u8 type | u8 family | endpoint`, with a `u32`
/// error code appended to `failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Holepunch {
    /// Ask the relay to introduce us to the target peer.
    Rendezvous { addr: SocketAddr },
    /// The relay's instruction to connect to the endpoint.
    Connect { addr: SocketAddr },
    /// The rendezvous failed with the given error code.
    Failed { addr: SocketAddr, error: u32 },
}

impl Holepunch {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let (msg_type, addr, error) = match self {
            Self::Rendezvous { addr } => (HOLEPUNCH_RENDEZVOUS, addr, None),
            Self::Connect { addr } => (HOLEPUNCH_CONNECT, addr, None),
            Self::Failed { addr, error } => {
                (HOLEPUNCH_FAILED, addr, Some(*error))
            }
        };
        buf.put_u8(msg_type);
        match addr.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(FAMILY_V4);
                buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(FAMILY_V6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf.put_u16(addr.port());
        if let Some(error) = error {
            buf.put_u32(error);
        }
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(payload);
        if buf.remaining() < 2 {
            return Err(Error::disconnect(
                crate::error::DisconnectReason::InvalidMessage,
                crate::error::Operation::Receive,
            ));
        }
        let msg_type = buf.get_u8();
        let family = buf.get_u8();
        let addr_len = match family {
            FAMILY_V4 => 4,
            FAMILY_V6 => 16,
            _ => return Err(invalid()),
        };
        if buf.remaining() < addr_len + 2 {
            return Err(invalid());
        }
        let ip = if family == FAMILY_V4 {
            let mut octets = [0; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        } else {
            let mut octets = [0; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        };
        let addr = SocketAddr::new(ip, buf.get_u16());

        match msg_type {
            HOLEPUNCH_RENDEZVOUS => Ok(Self::Rendezvous { addr }),
            HOLEPUNCH_CONNECT => Ok(Self::Connect { addr }),
            HOLEPUNCH_FAILED => {
                if buf.remaining() < 4 {
                    return Err(invalid());
                }
                Ok(Self::Failed {
                    addr,
                    error: buf.get_u32(),
                })
            }
            _ => Err(invalid()),
        }
    }
}

fn invalid() -> Error {
    Error::disconnect(
        crate::error::DisconnectReason::InvalidMessage,
        crate::error::Operation::Receive,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handshake_roundtrip() {
        let ours = ExtendedHandshake::ours("riptorrent/0.1", Some(6881), 250);
        let bytes = ours.to_bytes().unwrap();
        let decoded = ExtendedHandshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.m, ours.m);
        assert_eq!(decoded.v.as_deref(), Some("riptorrent/0.1"));
        assert_eq!(decoded.p, Some(6881));
        assert_eq!(decoded.reqq, Some(250));
    }

    #[test]
    fn test_negotiation_enables_exactly_the_advertised() {
        let mut handshake = ExtendedHandshake::default();
        handshake.m.insert("upload_only".to_string(), 3);
        handshake.m.insert("ut_holepunch".to_string(), 4);
        handshake.m.insert("lt_donthave".to_string(), 7);
        // an extension we don't consume is ignored
        handshake.m.insert("ut_metadata".to_string(), 9);

        let exts = PeerExtensions::from_handshake(&handshake);
        assert_eq!(
            exts,
            PeerExtensions {
                upload_only: Some(3),
                holepunch: Some(4),
                dont_have: Some(7),
                share_mode: None,
            }
        );
    }

    #[test]
    fn test_zero_id_disables_extension() {
        let mut handshake = ExtendedHandshake::default();
        handshake.m.insert("ut_holepunch".to_string(), 0);
        let exts = PeerExtensions::from_handshake(&handshake);
        assert_eq!(exts.holepunch, None);
    }

    #[test]
    fn test_your_ip() {
        let mut handshake = ExtendedHandshake::default();
        handshake.yourip = Some(ByteBuf::from(vec![1, 2, 3, 4]));
        assert_eq!(
            handshake.your_ip(),
            Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
        );

        handshake.yourip = Some(ByteBuf::from(vec![0; 16]));
        assert_eq!(
            handshake.your_ip(),
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        );

        // a malformed length casts no vote
        handshake.yourip = Some(ByteBuf::from(vec![1, 2, 3]));
        assert_eq!(handshake.your_ip(), None);
    }

    #[test]
    fn test_holepunch_roundtrips() {
        let v4: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:51413".parse().unwrap();
        let messages = vec![
            Holepunch::Rendezvous { addr: v4 },
            Holepunch::Connect { addr: v6 },
            Holepunch::Failed {
                addr: v4,
                error: 2,
            },
        ];
        for msg in messages {
            let encoded = msg.encode();
            assert_eq!(Holepunch::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_holepunch_rejects_bad_family() {
        assert!(Holepunch::decode(&[0, 9, 1, 2, 3, 4, 0, 0]).is_err());
    }
}
