use super::error::MetainfoError;
use super::info_hash::InfoHash;

/// A parsed magnet link (BEP-9).
///
/// Carries the info hash plus optional display name, trackers, and direct
/// peer addresses; everything else about the torrent comes from the
/// metadata exchange.
///
/// # Examples
///
/// ```
/// use riptide::metainfo::MagnetLink;
///
/// let magnet = MagnetLink::parse(
///     "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=Example",
/// ).unwrap();
/// assert_eq!(magnet.display_name.as_deref(), Some("Example"));
/// ```
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// The torrent's info hash (required).
    pub info_hash: InfoHash,
    /// Suggested display name.
    pub display_name: Option<String>,
    /// Tracker URLs from `tr` parameters.
    pub trackers: Vec<String>,
    /// Direct peer addresses from `x.pe` parameters.
    pub peer_addresses: Vec<String>,
}

impl MagnetLink {
    /// Parses a `magnet:?` URI.
    ///
    /// Recognized parameters: `xt=urn:btih:<hex|base32>` (required), `dn`,
    /// `tr` (repeatable), `x.pe` (repeatable). Unknown parameters are
    /// ignored.
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| MetainfoError::InvalidMagnetLink("missing magnet:? prefix".into()))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peer_addresses = Vec::new();

        for part in query.split('&') {
            let Some((key, raw)) = part.split_once('=') else {
                continue;
            };
            match key {
                "xt" => {
                    let topic = raw
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| {
                            MetainfoError::InvalidMagnetLink("unsupported xt format".into())
                        })?;
                    info_hash = Some(match topic.len() {
                        40 => InfoHash::from_hex(topic)?,
                        32 => InfoHash::from_base32(topic)?,
                        _ => {
                            return Err(MetainfoError::InvalidMagnetLink(
                                "invalid info hash length".into(),
                            ))
                        }
                    });
                }
                "dn" => display_name = Some(url_decode(raw)),
                "tr" => trackers.push(url_decode(raw)),
                "x.pe" => peer_addresses.push(url_decode(raw)),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or_else(|| {
                MetainfoError::InvalidMagnetLink("missing xt parameter".into())
            })?,
            display_name,
            trackers,
            peer_addresses,
        })
    }
}

fn url_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) if hex.len() == 2 => out.push(byte as char),
                    _ => {
                        out.push('%');
                        out.push_str(&hex);
                    }
                }
            }
            '+' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}
