//! File handle encoding and decoding.
//!
//! Words carry host values; the byte form used on the wire writes each word
//! big-endian.

use crate::error::{Result, TesseraError};
use crate::types::{FormalId, ObjectIdentity};
use serde::{Deserialize, Serialize};

/// Returned by [`encode_fh`] when the buffer cannot hold even a minimal handle.
pub const FH_TYPE_TOO_SMALL: u8 = 255;

/// Longest handle, in words.
pub const FH_MAX_WORDS: usize = 6;

/// Layout of a handle, fixed by its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenShape {
    /// The object only.
    Minimal,
    /// The object and its parent's formal id.
    WithParent,
    /// The object and its parent's full identity.
    WithParentGen,
}

impl TokenShape {
    pub fn from_len(len: usize) -> Result<Self> {
        match len {
            3 => Ok(TokenShape::Minimal),
            5 => Ok(TokenShape::WithParent),
            6 => Ok(TokenShape::WithParentGen),
            other => Err(TesseraError::InvalidArgument(format!(
                "file handle of {} words",
                other
            ))),
        }
    }

    pub fn words(&self) -> usize {
        match self {
            TokenShape::Minimal => 3,
            TokenShape::WithParent => 5,
            TokenShape::WithParentGen => 6,
        }
    }
}

/// What a handle says about one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportCookie {
    pub formal_id: FormalId,
    /// Expected generation; `None` accepts any incarnation.
    pub generation: Option<u32>,
}

impl ExportCookie {
    pub fn exact(identity: ObjectIdentity) -> Self {
        Self {
            formal_id: identity.formal_id,
            generation: Some(identity.generation),
        }
    }

    pub fn any_generation(formal_id: FormalId) -> Self {
        Self {
            formal_id,
            generation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHandle {
    pub shape: TokenShape,
    pub this: ExportCookie,
    pub parent: Option<ExportCookie>,
}

/// Encode `object` into `buf`, adding `parent` when `connectable` and the
/// buffer has room.
///
/// Returns the number of words used, or [`FH_TYPE_TOO_SMALL`].
pub fn encode_fh(
    object: ObjectIdentity,
    parent: Option<ObjectIdentity>,
    buf: &mut [u32],
    connectable: bool,
) -> u8 {
    if buf.len() < 3 {
        return FH_TYPE_TOO_SMALL;
    }
    buf[0] = object.formal_hi();
    buf[1] = object.formal_lo();
    buf[2] = object.generation;

    let parent = match parent {
        Some(p) if connectable && buf.len() >= 5 => p,
        _ => return 3,
    };
    buf[3] = parent.formal_hi();
    buf[4] = parent.formal_lo();
    if buf.len() < 6 {
        return 5;
    }
    buf[5] = parent.generation;
    6
}

/// Decode a handle. `fh_type` must equal the word count.
pub fn decode_fh(words: &[u32], fh_type: u8) -> Result<DecodedHandle> {
    if fh_type as usize != words.len() {
        return Err(TesseraError::InvalidArgument(format!(
            "handle type {} does not match its {} words",
            fh_type,
            words.len()
        )));
    }
    let shape = TokenShape::from_len(words.len())?;
    let this = ExportCookie {
        formal_id: ObjectIdentity::join_formal(words[0], words[1]),
        generation: Some(words[2]),
    };
    let parent = match shape {
        TokenShape::Minimal => None,
        TokenShape::WithParent => Some(ExportCookie::any_generation(ObjectIdentity::join_formal(
            words[3], words[4],
        ))),
        TokenShape::WithParentGen => Some(ExportCookie {
            formal_id: ObjectIdentity::join_formal(words[3], words[4]),
            generation: Some(words[5]),
        }),
    };
    Ok(DecodedHandle {
        shape,
        this,
        parent,
    })
}

/// An owned handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle {
    words: Vec<u32>,
}

impl FileHandle {
    /// Build the longest handle that fits `max_words`.
    pub fn new(
        object: ObjectIdentity,
        parent: Option<ObjectIdentity>,
        connectable: bool,
        max_words: usize,
    ) -> Result<Self> {
        let mut buf = [0u32; FH_MAX_WORDS];
        let limit = max_words.min(FH_MAX_WORDS);
        match encode_fh(object, parent, &mut buf[..limit], connectable) {
            FH_TYPE_TOO_SMALL => Err(TesseraError::OutOfSpace(format!(
                "{} words cannot hold a file handle",
                max_words
            ))),
            used => Ok(Self {
                words: buf[..used as usize].to_vec(),
            }),
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn fh_type(&self) -> u8 {
        self.words.len() as u8
    }

    pub fn decode(&self) -> Result<DecodedHandle> {
        decode_fh(&self.words, self.fh_type())
    }

    /// Wire form: big-endian words.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        for w in &self.words {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        bytes
    }

    /// Parse the wire form. The length must be 12, 20 or 24 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(TesseraError::InvalidArgument(format!(
                "file handle of {} bytes",
                bytes.len()
            )));
        }
        TokenShape::from_len(bytes.len() / 4)?;
        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { words })
    }
}
