//! Torrent source normalization
//!
//! Turns a magnet URI or a local `.torrent` path into a bridge-ready argument
//! plus a stable, lower-case content hash. Synchronous, never spawns anything.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::SessionError;

const MAGNET_PREFIX: &str = "magnet:?";
const BTIH_URN: &str = "urn:btih:";

/// Kind of source the user handed over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Magnet,
    TorrentFile(PathBuf),
}

/// A validated source, ready for the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSource {
    /// Argument passed verbatim to the bridge
    pub bridge_arg: String,
    /// Lower-case info-hash, the watch-history key
    pub content_hash: String,
    pub kind: SourceKind,
}

/// Validate and canonicalize a magnet URI or torrent file path
pub fn normalize(source: &str) -> Result<NormalizedSource, SessionError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(SessionError::SourceInvalid("empty source".to_string()));
    }

    if trimmed
        .get(..MAGNET_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(MAGNET_PREFIX))
    {
        return normalize_magnet(trimmed);
    }

    normalize_torrent_file(Path::new(trimmed))
}

/// Rewrite a magnet into `magnet:?xt=urn:btih:<lower hash>[&rest]`
fn normalize_magnet(magnet: &str) -> Result<NormalizedSource, SessionError> {
    // Pasted magnets often carry wrapped lines
    let cleaned: String = magnet.chars().filter(|c| !c.is_whitespace()).collect();
    let query = &cleaned[MAGNET_PREFIX.len()..];

    let mut hash = None;
    let mut rest = Vec::new();
    for param in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        let is_btih = key.eq_ignore_ascii_case("xt")
            && value
                .get(..BTIH_URN.len())
                .is_some_and(|p| p.eq_ignore_ascii_case(BTIH_URN));
        if is_btih && hash.is_none() {
            hash = Some(value[BTIH_URN.len()..].to_string());
        } else {
            rest.push(param);
        }
    }

    let hash = hash.ok_or_else(|| {
        SessionError::SourceInvalid("magnet link has no xt=urn:btih: topic".to_string())
    })?;
    if !is_valid_info_hash(&hash) {
        return Err(SessionError::SourceInvalid(format!(
            "'{}' is not a 40-char hex or 32-char base32 info-hash",
            hash
        )));
    }
    let hash = hash.to_ascii_lowercase();

    let mut bridge_arg = format!("{}xt={}{}", MAGNET_PREFIX, BTIH_URN, hash);
    for param in rest {
        bridge_arg.push('&');
        bridge_arg.push_str(param);
    }

    Ok(NormalizedSource {
        bridge_arg,
        content_hash: hash,
        kind: SourceKind::Magnet,
    })
}

fn is_valid_info_hash(hash: &str) -> bool {
    match hash.len() {
        40 => hash.chars().all(|c| c.is_ascii_hexdigit()),
        32 => hash
            .chars()
            .all(|c| c.is_ascii_alphabetic() || ('2'..='7').contains(&c)),
        _ => false,
    }
}

fn normalize_torrent_file(path: &Path) -> Result<NormalizedSource, SessionError> {
    if !path.is_file() {
        return Err(SessionError::SourceInvalid(format!(
            "'{}' is neither a magnet link nor an existing torrent file",
            path.display()
        )));
    }

    let data = std::fs::read(path)?;
    let content_hash = info_hash(&data).ok_or_else(|| {
        SessionError::SourceInvalid(format!(
            "'{}' is not a bencoded torrent with an info dictionary",
            path.display()
        ))
    })?;

    let absolute = std::fs::canonicalize(path)?;
    Ok(NormalizedSource {
        bridge_arg: absolute.to_string_lossy().to_string(),
        content_hash,
        kind: SourceKind::TorrentFile(absolute),
    })
}

/// SHA-1 of the raw `info` dictionary, lower-case hex
pub fn info_hash(torrent: &[u8]) -> Option<String> {
    if torrent.first() != Some(&b'd') {
        return None;
    }

    let mut pos = 1;
    while *torrent.get(pos)? != b'e' {
        let key_start = pos;
        pos = bencode_end(torrent, pos)?;
        let key = string_payload(&torrent[key_start..pos])?;
        let value_start = pos;
        pos = bencode_end(torrent, pos)?;
        if key == b"info" {
            let mut hasher = Sha1::new();
            hasher.update(&torrent[value_start..pos]);
            return Some(hex::encode(hasher.finalize()));
        }
    }
    None
}

/// Index one past the bencoded value starting at `start`
fn bencode_end(data: &[u8], start: usize) -> Option<usize> {
    match *data.get(start)? {
        b'i' => {
            let end = data[start..].iter().position(|&b| b == b'e')?;
            Some(start + end + 1)
        }
        b'l' | b'd' => {
            let mut pos = start + 1;
            while *data.get(pos)? != b'e' {
                pos = bencode_end(data, pos)?;
            }
            Some(pos + 1)
        }
        b'0'..=b'9' => {
            let colon = start + data[start..].iter().position(|&b| b == b':')?;
            let len: usize = std::str::from_utf8(&data[start..colon]).ok()?.parse().ok()?;
            let end = colon.checked_add(1)?.checked_add(len)?;
            (end <= data.len()).then_some(end)
        }
        _ => None,
    }
}

fn string_payload(encoded: &[u8]) -> Option<&[u8]> {
    let colon = encoded.iter().position(|&b| b == b':')?;
    Some(&encoded[colon + 1..])
}
