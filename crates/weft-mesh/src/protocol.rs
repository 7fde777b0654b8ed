//! Connection handshake and TCP message framing.
//!
//! A connection opens with a fixed header (`b"weft"`, minimum version,
//! maximum version). The highest version both ends support is used.
//!
//! - Version 2: an encryption flag byte (plus the 32-byte public key when
//!   set), then length-prefixed messages, starting with the feature map.
//!   Everything after the flag is sealed on encrypted connections.
//! - Version 1: the feature map goes first and is never sealed; the public
//!   key travels inside it as hex, and only a fixed set of features is
//!   honoured.
//!
//! Every later message starts with a one-byte [`ProtocolTag`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use weft_crypto::{KeyPair, MessageOpener, MessageSealer, PublicKey, SessionKey, KEY_SIZE};

use crate::error::MeshError;

/// Protocol identifier at the start of every connection.
pub const PROTOCOL_NAME: &[u8] = b"weft";

/// Oldest protocol version we speak.
pub const PROTOCOL_MIN_VERSION: u8 = 1;

/// Newest protocol version we speak.
pub const PROTOCOL_MAX_VERSION: u8 = 2;

/// Deadline for the protocol header exchange.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between TCP heartbeats. Reads time out after twice this.
pub const TCP_HEARTBEAT: Duration = Duration::from_secs(30);

/// Largest TCP message accepted.
pub const MAX_TCP_MSG_SIZE: usize = 10 * 1024 * 1024;

/// Feature carrying the peer naming scheme.
pub const FEATURE_PEER_NAME_FLAVOUR: &str = "PeerNameFlavour";
/// Feature carrying the peer name.
pub const FEATURE_NAME: &str = "Name";
/// Feature carrying the nickname.
pub const FEATURE_NICK_NAME: &str = "NickName";
/// Feature carrying the incarnation id.
pub const FEATURE_UID: &str = "UID";
/// Feature carrying the per-connection random id.
pub const FEATURE_CONN_ID: &str = "ConnID";
/// Feature telling the remote that we trust it.
pub const FEATURE_TRUSTED: &str = "Trusted";
/// Version 1 only: hex-encoded public key.
pub const FEATURE_PUBLIC_KEY: &str = "PublicKey";

const V1_FEATURES: [&str; 5] = [
    FEATURE_CONN_ID,
    FEATURE_NAME,
    FEATURE_NICK_NAME,
    FEATURE_PEER_NAME_FLAVOUR,
    FEATURE_UID,
];

/// Feature map exchanged during the handshake.
pub type Features = BTreeMap<String, String>;

/// Returns a required feature.
///
/// # Errors
///
/// Returns [`MeshError::Handshake`] if the feature is absent.
pub fn feature<'a>(features: &'a Features, key: &str) -> Result<&'a str, MeshError> {
    features
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| MeshError::Handshake(format!("field {key} is missing")))
}

/// Byte stream a handshake can run over.
pub trait IntroStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> IntroStream for T {}

/// First byte of every message after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolTag {
    /// Keep-alive, no payload.
    Heartbeat = 0,
    /// Legacy overlay control.
    ConnectionEstablished = 1,
    /// Legacy overlay control.
    FragmentationReceived = 2,
    /// Legacy overlay control.
    PmtuVerified = 3,
    /// Full-state gossip.
    Gossip = 4,
    /// Unicast gossip.
    GossipUnicast = 5,
    /// Broadcast gossip.
    GossipBroadcast = 6,
    /// Overlay control message.
    OverlayControl = 7,
}

impl TryFrom<u8> for ProtocolTag {
    type Error = MeshError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Heartbeat,
            1 => Self::ConnectionEstablished,
            2 => Self::FragmentationReceived,
            3 => Self::PmtuVerified,
            4 => Self::Gossip,
            5 => Self::GossipUnicast,
            6 => Self::GossipBroadcast,
            7 => Self::OverlayControl,
            other => return Err(MeshError::Protocol(format!("unknown message tag {other}"))),
        })
    }
}

/// A tagged message on an established connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtocolMsg {
    /// Message kind.
    pub tag: ProtocolTag,
    /// Message body.
    pub payload: Bytes,
}

impl ProtocolMsg {
    /// Creates a message.
    pub fn new(tag: ProtocolTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// A heartbeat.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(ProtocolTag::Heartbeat, Bytes::new())
    }

    /// Serializes as tag byte followed by payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.tag as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a message.
    pub fn decode(mut bytes: Bytes) -> Result<Self, MeshError> {
        if bytes.is_empty() {
            return Err(MeshError::Protocol("empty message".to_string()));
        }
        let tag = ProtocolTag::try_from(bytes[0])?;
        let payload = bytes.split_off(1);
        Ok(Self { tag, payload })
    }
}

impl fmt::Debug for ProtocolMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolMsg")
            .field("tag", &self.tag)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Returns the version to speak, given both ends' ranges.
///
/// # Errors
///
/// Returns [`MeshError::Handshake`] if the ranges do not overlap.
pub fn negotiate_version(
    our_min: u8,
    our_max: u8,
    their_min: u8,
    their_max: u8,
) -> Result<u8, MeshError> {
    let min = our_min.max(their_min);
    let max = our_max.min(their_max);
    if min > max {
        return Err(MeshError::Handshake(format!(
            "remote version range [{their_min},{their_max}] is incompatible with ours [{our_min},{our_max}]"
        )));
    }
    Ok(max)
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_TCP_MSG_SIZE)
        .new_codec()
}

/// Writing half of a connection.
pub struct TcpSender<T> {
    framed: FramedWrite<WriteHalf<T>, LengthDelimitedCodec>,
    sealer: Option<MessageSealer>,
}

impl<T: IntroStream> TcpSender<T> {
    fn new(writer: WriteHalf<T>) -> Self {
        Self {
            framed: FramedWrite::new(writer, codec()),
            sealer: None,
        }
    }

    fn enable_crypto(&mut self, key: &SessionKey, outbound: bool) {
        self.sealer = Some(MessageSealer::new(key, outbound));
    }

    /// Sends one message, sealing it on encrypted connections.
    pub async fn send(&mut self, msg: &[u8]) -> Result<(), MeshError> {
        let frame = match self.sealer.as_mut() {
            Some(sealer) => Bytes::from(sealer.seal(msg)?),
            None => Bytes::copy_from_slice(msg),
        };
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Returns true if messages are sealed.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.sealer.is_some()
    }
}

/// Reading half of a connection.
pub struct TcpReceiver<T> {
    framed: FramedRead<ReadHalf<T>, LengthDelimitedCodec>,
    opener: Option<MessageOpener>,
}

impl<T: IntroStream> TcpReceiver<T> {
    fn new(reader: ReadHalf<T>) -> Self {
        Self {
            framed: FramedRead::new(reader, codec()),
            opener: None,
        }
    }

    fn enable_crypto(&mut self, key: &SessionKey, outbound: bool) {
        self.opener = Some(MessageOpener::new(key, outbound));
    }

    /// Receives one message, opening it on encrypted connections.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Connection`] once the remote has closed.
    pub async fn receive(&mut self) -> Result<Bytes, MeshError> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| MeshError::Connection("connection closed by remote".to_string()))??;
        match self.opener.as_mut() {
            Some(opener) => Ok(Bytes::from(opener.open(&frame)?)),
            None => Ok(frame.freeze()),
        }
    }
}

/// Our side of a handshake.
#[derive(Debug, Clone)]
pub struct IntroParams {
    /// Oldest version we accept.
    pub min_version: u8,
    /// Newest version we speak.
    pub max_version: u8,
    /// Features to announce.
    pub features: Features,
    /// Shared password; `None` for unencrypted connections.
    pub password: Option<Vec<u8>>,
    /// Whether we dialled the connection.
    pub outbound: bool,
}

/// Outcome of a successful handshake.
pub struct IntroResult<T> {
    /// Negotiated version.
    pub version: u8,
    /// Features the remote announced.
    pub features: Features,
    /// Writing half.
    pub sender: TcpSender<T>,
    /// Reading half.
    pub receiver: TcpReceiver<T>,
    /// Session key, on encrypted connections.
    pub session_key: Option<SessionKey>,
}

impl<T> fmt::Debug for IntroResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntroResult")
            .field("version", &self.version)
            .field("features", &self.features)
            .field("encrypted", &self.session_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Runs the handshake over `stream`.
pub async fn do_intro<T: IntroStream>(
    stream: T,
    params: &IntroParams,
) -> Result<IntroResult<T>, MeshError> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let version = tokio::time::timeout(
        HEADER_TIMEOUT,
        exchange_header(&mut reader, &mut writer, params),
    )
    .await
    .map_err(|_| MeshError::Handshake("timed out exchanging protocol header".to_string()))??;

    let keys = params.password.as_ref().map(|_| KeyPair::generate());
    let intro = async move {
        if version == 1 {
            intro_v1(reader, writer, params, keys.as_ref()).await
        } else {
            intro_v2(reader, writer, params, keys.as_ref()).await
        }
    };
    let (features, sender, receiver, session_key) = tokio::time::timeout(TCP_HEARTBEAT * 2, intro)
        .await
        .map_err(|_| MeshError::Handshake("timed out exchanging features".to_string()))??;

    Ok(IntroResult {
        version,
        features,
        sender,
        receiver,
        session_key,
    })
}

async fn exchange_header<T: IntroStream>(
    reader: &mut ReadHalf<T>,
    writer: &mut WriteHalf<T>,
    params: &IntroParams,
) -> Result<u8, MeshError> {
    let mut ours = PROTOCOL_NAME.to_vec();
    ours.extend([params.min_version, params.max_version]);
    let mut theirs = [0u8; PROTOCOL_NAME.len() + 2];

    tokio::try_join!(
        async {
            writer.write_all(&ours).await?;
            writer.flush().await
        },
        reader.read_exact(&mut theirs),
    )
    .map_err(|e| MeshError::Handshake(format!("failed to exchange protocol header: {e}")))?;

    let (name, range) = theirs.split_at(PROTOCOL_NAME.len());
    if name != PROTOCOL_NAME {
        return Err(MeshError::Handshake(format!(
            "remote protocol header not recognised: {name:?}"
        )));
    }
    negotiate_version(params.min_version, params.max_version, range[0], range[1])
}

type Established<T> = (Features, TcpSender<T>, TcpReceiver<T>, Option<SessionKey>);

async fn exchange_features<T: IntroStream>(
    sender: &mut TcpSender<T>,
    receiver: &mut TcpReceiver<T>,
    features: &Features,
) -> Result<Features, MeshError> {
    let ours = serde_json::to_vec(features)?;
    let (_, theirs) = tokio::try_join!(sender.send(&ours), receiver.receive())?;
    Ok(serde_json::from_slice(&theirs)?)
}

async fn intro_v1<T: IntroStream>(
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    params: &IntroParams,
    keys: Option<&KeyPair>,
) -> Result<Established<T>, MeshError> {
    let mut features = filter_v1_features(&params.features);
    if let Some(keys) = keys {
        features.insert(FEATURE_PUBLIC_KEY.to_string(), keys.public_key().to_hex());
    }

    let mut sender = TcpSender::new(writer);
    let mut receiver = TcpReceiver::new(reader);
    let theirs = exchange_features(&mut sender, &mut receiver, &features).await?;

    let session_key = match (keys, theirs.get(FEATURE_PUBLIC_KEY)) {
        (None, None) => None,
        (None, Some(_)) => return Err(MeshError::ExpectedNoCrypto),
        (Some(_), None) => return Err(MeshError::ExpectedCrypto),
        (Some(keys), Some(hex)) => {
            let remote = PublicKey::from_hex(hex)?;
            let key = keys.session_key(&remote, params.password.as_deref().unwrap_or_default())?;
            sender.enable_crypto(&key, params.outbound);
            receiver.enable_crypto(&key, params.outbound);
            Some(key)
        }
    };

    Ok((filter_v1_features(&theirs), sender, receiver, session_key))
}

async fn intro_v2<T: IntroStream>(
    mut reader: ReadHalf<T>,
    mut writer: WriteHalf<T>,
    params: &IntroParams,
    keys: Option<&KeyPair>,
) -> Result<Established<T>, MeshError> {
    let mut ours = vec![u8::from(keys.is_some())];
    if let Some(keys) = keys {
        ours.extend_from_slice(keys.public_key().as_bytes());
    }
    let mut flag = [0u8; 1];
    tokio::try_join!(
        async {
            writer.write_all(&ours).await?;
            writer.flush().await
        },
        reader.read_exact(&mut flag),
    )?;

    let session_key = match (flag[0], keys) {
        (0, None) => None,
        (0, Some(_)) => return Err(MeshError::ExpectedCrypto),
        (1, None) => return Err(MeshError::ExpectedNoCrypto),
        (1, Some(keys)) => {
            let mut remote = [0u8; KEY_SIZE];
            reader.read_exact(&mut remote).await?;
            let remote = PublicKey::from_bytes_array(remote);
            Some(keys.session_key(&remote, params.password.as_deref().unwrap_or_default())?)
        }
        (other, _) => {
            return Err(MeshError::Handshake(format!("bad encryption flag {other}")));
        }
    };

    let mut sender = TcpSender::new(writer);
    let mut receiver = TcpReceiver::new(reader);
    if let Some(key) = &session_key {
        sender.enable_crypto(key, params.outbound);
        receiver.enable_crypto(key, params.outbound);
    }
    let theirs = exchange_features(&mut sender, &mut receiver, &params.features).await?;
    Ok((theirs, sender, receiver, session_key))
}

fn filter_v1_features(features: &Features) -> Features {
    features
        .iter()
        .filter(|(k, _)| V1_FEATURES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
