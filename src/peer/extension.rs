use super::error::PeerError;
use crate::bencode::{decode, encode, Value};
use crate::constants::{CLIENT_VERSION, UT_METADATA_ID, UT_PEX_ID};
use bytes::Bytes;
use std::collections::BTreeMap;

/// The extended handshake payload (BEP-10, sub-id 0).
///
/// Carries the `m` map of extension names to the sender's message ids plus
/// optional client info. Both directions use the same shape.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    /// Extension name to the sender's chosen sub-id.
    pub extensions: BTreeMap<String, u8>,
    /// Client name and version (`v`).
    pub client: Option<String>,
    /// Listen port (`p`).
    pub port: Option<u16>,
    /// How the sender sees our IP (`yourip`), compact form.
    pub yourip: Option<Vec<u8>>,
    /// Request queue depth the sender tolerates (`reqq`).
    pub reqq: Option<i64>,
    /// Size of the info dictionary, when the sender can serve it (BEP-9).
    pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
    /// The handshake we send: ut_metadata and ut_pex under our local ids.
    pub fn ours(port: u16, metadata_size: Option<usize>) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert("ut_metadata".to_string(), UT_METADATA_ID);
        extensions.insert("ut_pex".to_string(), UT_PEX_ID);
        Self {
            extensions,
            client: Some(CLIENT_VERSION.to_string()),
            port: Some(port),
            yourip: None,
            reqq: Some(250),
            metadata_size: metadata_size.map(|s| s as i64),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut dict = BTreeMap::new();

        let m: BTreeMap<Bytes, Value> = self
            .extensions
            .iter()
            .map(|(name, id)| {
                (
                    Bytes::copy_from_slice(name.as_bytes()),
                    Value::Int(i64::from(*id)),
                )
            })
            .collect();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::str(client));
        }
        if let Some(port) = self.port {
            dict.insert(Bytes::from_static(b"p"), Value::Int(i64::from(port)));
        }
        if let Some(ref ip) = self.yourip {
            dict.insert(Bytes::from_static(b"yourip"), Value::from(ip.as_slice()));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Int(reqq));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(Bytes::from_static(b"metadata_size"), Value::Int(size));
        }

        Bytes::from(encode(&Value::Dict(dict)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        if value.as_dict().is_none() {
            return Err(PeerError::Extension("handshake is not a dict".into()));
        }

        let mut handshake = Self::default();
        if let Some(m) = value.get(b"m").and_then(|v| v.as_dict()) {
            for (name, id) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_int()) {
                    if (1..=255).contains(&id) {
                        handshake.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }
        handshake.client = value.get_str(b"v").map(String::from);
        handshake.port = value.get_int(b"p").and_then(|p| u16::try_from(p).ok());
        handshake.yourip = value
            .get(b"yourip")
            .and_then(|v| v.as_bytes())
            .map(|b| b.to_vec());
        handshake.reqq = value.get_int(b"reqq");
        handshake.metadata_size = value.get_int(b"metadata_size");
        Ok(handshake)
    }

    /// Sub-id the remote assigned to `name`, if it speaks it.
    pub fn remote_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }
}

/// A dispatched incoming extended message.
#[derive(Debug, Clone)]
pub enum ExtensionMessage {
    Handshake(ExtensionHandshake),
    /// Sub-id from our `m` map with the raw payload.
    Known { id: u8, payload: Bytes },
}

impl ExtensionMessage {
    pub fn decode(id: u8, payload: Bytes) -> Result<Self, PeerError> {
        if id == 0 {
            Ok(ExtensionMessage::Handshake(ExtensionHandshake::decode(
                &payload,
            )?))
        } else {
            Ok(ExtensionMessage::Known { id, payload })
        }
    }
}
