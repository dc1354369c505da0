//! Save-state file format.
//!
//! ```text
//! Offset  Size  Field
//! 0x00    8     Magic (SAVE_MAGIC)
//! 0x08    1     Format version (SAVE_VERSION)
//! 0x09    1     Flags (FLAG_MSB_FIRST, FLAG_COMPRESSED)
//! 0x0A    18    Game identifier, NUL-padded/truncated
//! 0x1C    4     Structural signature, little-endian CRC-32
//! 0x20    ...   Body: every entry's elements in name order
//! ```
//!
//! The body is written in the byte order chosen by the registry's
//! [`StateConfig`](crate::config::StateConfig) (native by default) and may be
//! zlib-compressed; the header never is. Loading validates the header and
//! reads the whole body before touching any live state, so a failed load
//! leaves the machine exactly as it was.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::{info, warn};

use crate::codec::{Endian, ReadLeExt};
use crate::registry::{HookKind, StateRegistry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic bytes opening every save file.
pub const SAVE_MAGIC: [u8; 8] = *b"ARCSSAVE";

/// Current format version.
pub const SAVE_VERSION: u8 = 2;

/// Flag: multi-byte body elements are most-significant-byte first.
pub const FLAG_MSB_FIRST: u8 = 0x02;

/// Flag: the body is zlib-compressed.
pub const FLAG_COMPRESSED: u8 = 0x04;

/// Width of the game identifier field.
pub const GAME_ID_LEN: usize = 18;

/// Total header size.
pub const HEADER_SIZE: usize = 0x20;

const GAME_ID_OFFSET: usize = 0x0A;
const SIGNATURE_OFFSET: usize = 0x1C;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A header that does not describe a loadable save for this machine.
///
/// The `Display` text is meant to be shown to users as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("file is not a valid save state")]
    BadMagic,
    #[error("wrong save state version (file has {found}, expected {expected})")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("save state is for '{found}', not '{expected}'")]
    GameMismatch { expected: String, found: String },
    #[error(
        "save state is incompatible with this machine configuration (signature {found:08x}, expected {expected:08x})"
    )]
    SignatureMismatch { expected: u32, found: u32 },
}

/// Errors from registering, saving, or loading state.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("{count} illegal state registration(s); refusing to save or load")]
    IllegalRegistrations { count: usize },
    #[error("read error: {0}")]
    Read(#[source] io::Error),
    #[error("write error: {0}")]
    Write(#[source] io::Error),
    #[error("invalid save header: {0}")]
    InvalidHeader(#[from] HeaderError),
    #[error("state registration after the machine started: {name}")]
    RegistrationClosed { name: String },
    #[error("duplicate state entry: {name}")]
    DuplicateEntry { name: String },
    #[error("duplicate {kind} hook")]
    DuplicateHook { kind: HookKind },
    #[error("state entry {name} was dropped by its owner")]
    EntryDropped { name: String },
    #[error("state entry {name} is borrowed elsewhere")]
    EntryBorrowed { name: String },
    #[error("state entry {name} changed length (registered {expected}, now {found})")]
    EntryResized {
        name: String,
        expected: usize,
        found: usize,
    },
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Decoded save-file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveHeader {
    pub version: u8,
    pub flags: u8,
    pub game_id: String,
    pub signature: u32,
}

impl SaveHeader {
    /// Header for the current format version.
    pub fn new(game_id: &str, signature: u32, endian: Endian, compressed: bool) -> Self {
        let mut flags = 0;
        if endian == Endian::Big {
            flags |= FLAG_MSB_FIRST;
        }
        if compressed {
            flags |= FLAG_COMPRESSED;
        }
        Self {
            version: SAVE_VERSION,
            flags,
            game_id: truncate_game_id(game_id).to_owned(),
            signature,
        }
    }

    /// Byte order of the body that follows.
    pub fn endian(&self) -> Endian {
        if self.flags & FLAG_MSB_FIRST != 0 {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&SAVE_MAGIC);
        out[8] = self.version;
        out[9] = self.flags;
        let id = self.game_id.as_bytes();
        let len = id.len().min(GAME_ID_LEN);
        out[GAME_ID_OFFSET..GAME_ID_OFFSET + len].copy_from_slice(&id[..len]);
        out[SIGNATURE_OFFSET..].copy_from_slice(&self.signature.to_le_bytes());
        out
    }

    /// Decode a header, checking only the magic bytes.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, HeaderError> {
        if bytes[..8] != SAVE_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        let id = &bytes[GAME_ID_OFFSET..GAME_ID_OFFSET + GAME_ID_LEN];
        let id_len = id.iter().position(|&b| b == 0).unwrap_or(GAME_ID_LEN);
        let mut signature = [0u8; 4];
        signature.copy_from_slice(&bytes[SIGNATURE_OFFSET..]);
        Ok(Self {
            version: bytes[8],
            flags: bytes[9],
            game_id: String::from_utf8_lossy(&id[..id_len]).into_owned(),
            signature: u32::from_le_bytes(signature),
        })
    }
}

/// Clip a game identifier to the header field without splitting a UTF-8
/// sequence.
fn truncate_game_id(game_id: &str) -> &str {
    let mut end = game_id.len().min(GAME_ID_LEN);
    while !game_id.is_char_boundary(end) {
        end -= 1;
    }
    &game_id[..end]
}

/// Validate a raw header.
///
/// Checks magic and version, then the game identifier and signature when
/// expected values are given. On failure the error text, prefixed with
/// `prefix`, is passed to `report` before the error is returned. The same
/// routine backs both [`check_file`] and the full load path.
pub fn validate_header(
    bytes: &[u8; HEADER_SIZE],
    game_id: Option<&str>,
    signature: Option<u32>,
    report: &mut dyn FnMut(&str),
    prefix: &str,
) -> Result<SaveHeader, HeaderError> {
    let result = SaveHeader::parse(bytes).and_then(|header| {
        if header.version != SAVE_VERSION {
            return Err(HeaderError::VersionMismatch {
                expected: SAVE_VERSION,
                found: header.version,
            });
        }
        if let Some(expected) = game_id {
            let expected = truncate_game_id(expected);
            if header.game_id != expected {
                return Err(HeaderError::GameMismatch {
                    expected: expected.to_owned(),
                    found: header.game_id,
                });
            }
        }
        if let Some(expected) = signature {
            if header.signature != expected {
                return Err(HeaderError::SignatureMismatch {
                    expected,
                    found: header.signature,
                });
            }
        }
        Ok(header)
    });
    if let Err(err) = &result {
        report(&format!("{prefix}{err}"));
    }
    result
}

/// Lightweight check that `reader` holds a save for `game_id`.
///
/// Reads only the header. The structural signature is not checked since no
/// machine configuration is involved.
pub fn check_file<R: Read>(
    reader: &mut R,
    game_id: &str,
    report: &mut dyn FnMut(&str),
) -> Result<SaveHeader, SaveError> {
    let bytes: [u8; HEADER_SIZE] = reader.read_array().map_err(SaveError::Read)?;
    Ok(validate_header(&bytes, Some(game_id), None, report, "Error: ")?)
}

// ---------------------------------------------------------------------------
// Registry save/load
// ---------------------------------------------------------------------------

impl StateRegistry {
    /// Total body size in bytes for the current registrations.
    pub fn body_len(&self) -> usize {
        self.entries().iter().map(|e| e.byte_len()).sum()
    }

    fn ensure_legal(&self) -> Result<(), SaveError> {
        match self.illegal_count() {
            0 => Ok(()),
            count => Err(SaveError::IllegalRegistrations { count }),
        }
    }

    /// Write a complete save file to `writer`.
    ///
    /// Presave hooks run first, then every entry is captured into memory, and
    /// only then is anything written, so a dropped or busy entry or hook
    /// context fails the save before the stream is touched.
    pub fn write<W: Write>(&mut self, writer: &mut W) -> Result<(), SaveError> {
        self.ensure_legal()?;
        self.check_hooks(HookKind::Presave)?;
        self.run_hooks(HookKind::Presave)?;

        let endian = self.config().byte_order.endian();
        let compressed = self.config().compress;
        let mut body = Vec::with_capacity(self.body_len());
        for entry in self.entries() {
            entry.encode(endian, &mut body)?;
        }

        let signature = self.compute_signature();
        let header = SaveHeader::new(&self.config().game_id, signature, endian, compressed);
        writer.write_all(&header.to_bytes()).map_err(SaveError::Write)?;
        if compressed {
            let mut encoder = ZlibEncoder::new(&mut *writer, Compression::default());
            encoder.write_all(&body).map_err(SaveError::Write)?;
            encoder.finish().map_err(SaveError::Write)?;
        } else {
            writer.write_all(&body).map_err(SaveError::Write)?;
        }
        writer.flush().map_err(SaveError::Write)?;

        info!(
            entries = self.entry_count(),
            bytes = body.len(),
            signature = %format!("{signature:08x}"),
            compressed,
            "state saved"
        );
        Ok(())
    }

    /// Load a save file from `reader` into every registered entry.
    ///
    /// Validation happens before any live entry is modified: the header is
    /// checked against this registry's game identifier (when configured) and
    /// signature, the full body is read, every entry is confirmed to be alive
    /// and unchanged in length, and every postload hook context is confirmed
    /// free. Postload hooks run last.
    pub fn read<R: Read>(&mut self, reader: &mut R) -> Result<(), SaveError> {
        self.ensure_legal()?;

        let bytes: [u8; HEADER_SIZE] = reader.read_array().map_err(SaveError::Read)?;
        let game_id = Some(self.config().game_id.as_str()).filter(|id| !id.is_empty());
        let header = validate_header(
            &bytes,
            game_id,
            Some(self.compute_signature()),
            &mut |msg| warn!("{msg}"),
            "",
        )?;

        let mut body = vec![0u8; self.body_len()];
        if header.is_compressed() {
            ZlibDecoder::new(&mut *reader)
                .read_exact(&mut body)
                .map_err(SaveError::Read)?;
        } else {
            reader.read_exact(&mut body).map_err(SaveError::Read)?;
        }

        for entry in self.entries() {
            entry.check()?;
        }
        self.check_hooks(HookKind::Postload)?;
        let endian = header.endian();
        let mut offset = 0;
        for entry in self.entries() {
            let len = entry.byte_len();
            entry.decode(&body[offset..offset + len], endian)?;
            offset += len;
        }

        self.run_hooks(HookKind::Postload)?;
        info!(
            entries = self.entry_count(),
            bytes = body.len(),
            swapped = !endian.is_native(),
            "state loaded"
        );
        Ok(())
    }
}
