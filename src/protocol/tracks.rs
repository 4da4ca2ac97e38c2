use std::io::{Cursor, Read};

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::{common::Severity, rest::RestClient, rest::RestError};

/// Header flag: a version byte follows the header.
const TRACK_INFO_VERSIONED: u32 = 1;
/// Newest layout this codec understands.
pub const MAX_TRACK_VERSION: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("track data is truncated")]
    Truncated,
    #[error("unsupported track version {0}")]
    UnsupportedVersion(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("string field exceeds 65535 bytes")]
    StringTooLong,
}

impl From<std::io::Error> for CodecError {
    fn from(_: std::io::Error) -> Self {
        // Reads only ever fail on a short buffer.
        Self::Truncated
    }
}

/// A single audio track with encoded data and metadata.
///
/// `encoded` is what gets sent to a node; `info` is a decoded cache of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    encoded: String,
    pub info: TrackInfo,
    /// Plugin-specific info, free JSON object whose shape is defined by the plugin.
    #[serde(default = "default_json_object")]
    pub plugin_info: serde_json::Value,
    /// User-provided data attached to the track.
    #[serde(default = "default_json_object")]
    pub user_data: serde_json::Value,
    /// Who asked for this track. Local only, never sent to a node.
    #[serde(skip)]
    pub requester: Option<serde_json::Value>,
}

fn default_json_object() -> serde_json::Value {
    serde_json::json!({})
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Track {
    /// Build a track from metadata, encoding it with the smallest fitting version.
    pub fn new(info: TrackInfo) -> Result<Self, CodecError> {
        let encoded = info.encode()?;
        Ok(Self {
            encoded,
            info,
            plugin_info: default_json_object(),
            user_data: default_json_object(),
            requester: None,
        })
    }

    /// Decode a track from its base64 wire form.
    pub fn decode(encoded: &str) -> Result<Self, CodecError> {
        let info = TrackInfo::decode(encoded)?;
        Ok(Self {
            encoded: encoded.to_string(),
            info,
            plugin_info: default_json_object(),
            user_data: default_json_object(),
            requester: None,
        })
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn with_requester(mut self, requester: serde_json::Value) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Ask a node to decode this track again and return the fresh object.
    ///
    /// The requester annotation carries over; everything else is replaced.
    pub async fn refresh(&self, rest: &RestClient) -> Result<Self, RestError> {
        let mut fresh = rest.decode_track(&self.encoded).await?;
        fresh.requester = self.requester.clone();
        Ok(fresh)
    }
}

/// Metadata for an audio track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. 0 for live streams.
    pub length: u64,
    pub is_stream: bool,
    /// Playback position cursor in milliseconds.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

impl TrackInfo {
    /// Lowest layout version able to carry the populated optional fields.
    pub fn required_version(&self) -> u8 {
        if self.artwork_url.is_some() || self.isrc.is_some() {
            3
        } else if self.uri.is_some() {
            2
        } else {
            1
        }
    }

    /// Encode into the base64 wire form.
    ///
    /// Binary format (big-endian):
    ///   [u32 header: payload_size | (flags << 30)]
    ///   [u8  version]
    ///   [utf title] [utf author] [u64 length ms] [utf identifier] [u8 is_stream]
    ///   [opt_utf uri]                     -- v2+
    ///   [opt_utf artwork_url] [opt_utf isrc] -- v3
    ///   [utf source_name] [u64 position ms]
    pub fn encode(&self) -> Result<String, CodecError> {
        let version = self.required_version();

        let mut msg_buf = Vec::with_capacity(128);
        msg_buf.push(version);
        write_utf(&mut msg_buf, &self.title)?;
        write_utf(&mut msg_buf, &self.author)?;
        msg_buf.extend_from_slice(&self.length.to_be_bytes());
        write_utf(&mut msg_buf, &self.identifier)?;
        msg_buf.push(u8::from(self.is_stream));

        if version >= 2 {
            write_opt_utf(&mut msg_buf, self.uri.as_deref())?;
        }
        if version >= 3 {
            write_opt_utf(&mut msg_buf, self.artwork_url.as_deref())?;
            write_opt_utf(&mut msg_buf, self.isrc.as_deref())?;
        }

        write_utf(&mut msg_buf, &self.source_name)?;
        msg_buf.extend_from_slice(&self.position.to_be_bytes());

        let header = (msg_buf.len() as u32 & 0x3FFF_FFFF) | (TRACK_INFO_VERSIONED << 30);
        let mut final_buf = Vec::with_capacity(msg_buf.len() + 4);
        final_buf.extend_from_slice(&header.to_be_bytes());
        final_buf.extend_from_slice(&msg_buf);

        Ok(BASE64_STANDARD.encode(&final_buf))
    }

    /// Decode the base64 wire form. Supports versions 1, 2 and 3.
    pub fn decode(encoded: &str) -> Result<Self, CodecError> {
        let data = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| CodecError::Base64(e.to_string()))?;

        let mut cursor = Cursor::new(data.as_slice());
        let header = cursor.read_u32::<BigEndian>()?;
        let flags = (header >> 30) & 0x03;
        let size = (header & 0x3FFF_FFFF) as usize;
        if data.len() - 4 < size {
            return Err(CodecError::Truncated);
        }

        let version = if flags & TRACK_INFO_VERSIONED != 0 {
            cursor.read_u8()?
        } else {
            1
        };
        if version == 0 || version > MAX_TRACK_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let title = read_utf(&mut cursor)?;
        let author = read_utf(&mut cursor)?;
        let length = cursor.read_u64::<BigEndian>()?;
        let identifier = read_utf(&mut cursor)?;
        let is_stream = cursor.read_u8()? != 0;

        let uri = if version >= 2 {
            read_opt_utf(&mut cursor)?
        } else {
            None
        };

        let (artwork_url, isrc) = if version >= 3 {
            (read_opt_utf(&mut cursor)?, read_opt_utf(&mut cursor)?)
        } else {
            (None, None)
        };

        let source_name = read_utf(&mut cursor)?;
        let position = cursor.read_u64::<BigEndian>()?;

        Ok(Self {
            identifier,
            is_seekable: !is_stream,
            author,
            length,
            is_stream,
            position,
            title,
            uri,
            artwork_url,
            isrc,
            source_name,
        })
    }
}

fn write_utf(w: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::StringTooLong)?;
    w.extend_from_slice(&len.to_be_bytes());
    w.extend_from_slice(bytes);
    Ok(())
}

fn write_opt_utf(w: &mut Vec<u8>, s: Option<&str>) -> Result<(), CodecError> {
    match s {
        Some(s) => {
            w.push(1);
            write_utf(w, s)
        }
        None => {
            w.push(0);
            Ok(())
        }
    }
}

fn read_utf<R: Read>(r: &mut R) -> Result<String, CodecError> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| CodecError::InvalidUtf8)
}

fn read_opt_utf<R: Read>(r: &mut R) -> Result<Option<String>, CodecError> {
    let present = r.read_u8()? != 0;
    if present { read_utf(r).map(Some) } else { Ok(None) }
}

/// Result of a track load operation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    /// A single track was loaded.
    Track(Track),
    /// A playlist was loaded.
    Playlist(PlaylistData),
    /// A search returned results.
    Search(Vec<Track>),
    /// No matches found.
    Empty {},
    /// An error occurred during loading.
    Error(LoadError),
}

impl LoadResult {
    /// All tracks carried by this result, in order.
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            Self::Track(track) => vec![track],
            Self::Playlist(playlist) => playlist.tracks,
            Self::Search(tracks) => tracks,
            Self::Empty {} | Self::Error(_) => Vec::new(),
        }
    }
}

/// Playlist data returned from a load operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default = "default_json_object")]
    pub plugin_info: serde_json::Value,
    pub tracks: Vec<Track>,
}

/// Playlist metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track, or -1 if none.
    pub selected_track: i32,
}

/// Error from a failed track load.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadError {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_stack_trace: Option<String>,
}
