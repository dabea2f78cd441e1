//! Parsing of the links the metadata service hands out.

use std::fmt;

use url::Url;

use super::SwarmError;

/// SHA-1 hash identifying a torrent's info dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Decodes the `btih` value of a magnet link: 40 hex or 32 base32 characters.
    ///
    /// # Errors
    ///
    /// - `SwarmError::MagnetParse` - If the value is neither encoding
    pub fn from_btih(value: &str) -> Result<Self, SwarmError> {
        let bytes = match value.len() {
            40 => hex::decode(value).map_err(|e| SwarmError::MagnetParse {
                reason: format!("invalid hex info hash: {e}"),
            })?,
            32 => decode_base32(value).ok_or_else(|| SwarmError::MagnetParse {
                reason: "invalid base32 info hash".to_string(),
            })?,
            len => {
                return Err(SwarmError::MagnetParse {
                    reason: format!("info hash has {len} characters, expected 40 or 32"),
                });
            }
        };

        let hash: [u8; 20] = bytes.try_into().map_err(|_| SwarmError::MagnetParse {
            reason: "info hash is not 20 bytes".to_string(),
        })?;
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// RFC 4648 base32 without padding.
fn decode_base32(value: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(value.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0;
    for c in value.bytes() {
        let digit = match c.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | u64::from(digit);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Some(out)
}

/// Parsed magnet URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    raw: String,
}

impl MagnetLink {
    /// Parses a magnet URI carrying an `xt=urn:btih:` topic.
    ///
    /// # Errors
    ///
    /// - `SwarmError::MagnetParse` - If the URI is malformed or has no btih topic
    pub fn parse(link: &str) -> Result<Self, SwarmError> {
        magnet_url::Magnet::new(link).map_err(|e| SwarmError::MagnetParse {
            reason: e.to_string(),
        })?;
        let url = Url::parse(link).map_err(|e| SwarmError::MagnetParse {
            reason: e.to_string(),
        })?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(btih) = strip_prefix_ignore_case(&value, "urn:btih:") {
                        info_hash = Some(InfoHash::from_btih(btih)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| SwarmError::MagnetParse {
            reason: "missing xt=urn:btih: topic".to_string(),
        })?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
            raw: link.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Where a torrent comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    Magnet(MagnetLink),
    /// `http(s)` URL of a `.torrent` file
    TorrentUrl(Url),
}

impl TorrentSource {
    /// Parses a link after stripping whitespace and zero-width characters.
    ///
    /// # Errors
    ///
    /// - `SwarmError::MagnetParse` - If the link is neither a valid magnet
    ///   URI nor an `http(s)` URL
    pub fn parse(link: &str) -> Result<Self, SwarmError> {
        let link = sanitize_link(link);
        if link.is_empty() {
            return Err(SwarmError::MagnetParse {
                reason: "empty link".to_string(),
            });
        }

        if strip_prefix_ignore_case(&link, "magnet:").is_some() {
            return MagnetLink::parse(&link).map(Self::Magnet);
        }

        match Url::parse(&link) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Self::TorrentUrl(url)),
            Ok(url) => Err(SwarmError::MagnetParse {
                reason: format!("unsupported scheme '{}'", url.scheme()),
            }),
            Err(e) => Err(SwarmError::MagnetParse {
                reason: e.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Magnet(magnet) => magnet.as_str(),
            Self::TorrentUrl(url) => url.as_str(),
        }
    }

    /// Info hash when it is known without fetching anything.
    pub fn info_hash(&self) -> Option<InfoHash> {
        match self {
            Self::Magnet(magnet) => Some(magnet.info_hash),
            Self::TorrentUrl(_) => None,
        }
    }
}

impl fmt::Display for TorrentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Magnet(magnet) => match &magnet.display_name {
                Some(name) => write!(f, "magnet {} ({name})", magnet.info_hash),
                None => write!(f, "magnet {}", magnet.info_hash),
            },
            Self::TorrentUrl(url) => write!(f, "{url}"),
        }
    }
}

/// Removes whitespace and zero-width characters scrapers tend to leave in links.
pub fn sanitize_link(link: &str) -> String {
    link.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '\u{200B}'..='\u{200D}' | '\u{FEFF}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_parse_hex_magnet() {
        let link = format!("magnet:?xt=urn:btih:{HEX_HASH}&dn=Sample+Movie&tr=udp%3A%2F%2Ftracker.example%3A80");
        let source = TorrentSource::parse(&link).unwrap();
        let TorrentSource::Magnet(magnet) = &source else {
            panic!("expected magnet source");
        };
        assert_eq!(magnet.info_hash.to_string(), HEX_HASH);
        assert_eq!(magnet.display_name.as_deref(), Some("Sample Movie"));
        assert_eq!(magnet.trackers, vec!["udp://tracker.example:80".to_string()]);
        assert_eq!(source.info_hash(), Some(magnet.info_hash));
    }

    #[test]
    fn test_parse_base32_magnet() {
        // base32 of 20 zero bytes
        let link = "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let source = TorrentSource::parse(link).unwrap();
        assert_eq!(source.info_hash(), Some(InfoHash::new([0u8; 20])));
    }

    #[test]
    fn test_zero_width_and_whitespace_are_stripped() {
        let link = format!(" magnet:?xt=urn:btih:{HEX_HASH}\u{200B}\n");
        let source = TorrentSource::parse(&link).unwrap();
        assert!(source.as_str().ends_with(HEX_HASH));
    }

    #[test]
    fn test_torrent_url_is_accepted() {
        let source = TorrentSource::parse("https://example.org/files/sample.torrent").unwrap();
        assert!(matches!(source, TorrentSource::TorrentUrl(_)));
        assert!(source.info_hash().is_none());
    }

    #[test]
    fn test_invalid_links_are_rejected() {
        for link in [
            "",
            "not a link",
            "magnet:?dn=no-topic",
            "magnet:?xt=urn:btih:1234",
            "ftp://example.org/sample.torrent",
        ] {
            assert!(
                matches!(TorrentSource::parse(link), Err(SwarmError::MagnetParse { .. })),
                "{link:?} should be rejected"
            );
        }
    }
}
