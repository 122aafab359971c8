// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Messages and colors
//!
//! The application payload carried by a commit, and the conflict partition
//! it belongs to.
//!
//! A [`Color`] is the hash of a payload's conflict key: two commits conflict
//! exactly when their colors are equal. The queue never inspects payload
//! bytes; colors are the only conflict information it sees, and the total
//! order it produces is per color.

use smallvec::SmallVec;

/// A conflict partition key, typically a short hash.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Color(SmallVec<[u8; 8]>);

impl Color {
    pub fn new(hash: impl AsRef<[u8]>) -> Self {
        Self(SmallVec::from_slice(hash.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Color {
    fn from(hash: &[u8]) -> Self {
        Self::new(hash)
    }
}

impl From<&str> for Color {
    fn from(hash: &str) -> Self {
        Self::new(hash.as_bytes())
    }
}

impl std::fmt::Debug for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Color({s:?})"),
            Err(_) => write!(f, "Color(0x{})", Hex(&self.0)),
        }
    }
}

struct Hex<'a>(&'a [u8]);

impl std::fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// An application payload: opaque data tagged with the colors it conflicts
/// on.
///
/// A well-formed commit carries exactly one color; the multi-color encoding
/// exists on the wire and is rejected at queue insertion. See
/// [`CommittedBox::new`](crate::queue::CommittedBox::new).
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Message {
    colors: SmallVec<[Color; 1]>,
    data: Vec<u8>,
}

impl Message {
    pub fn new(color: Color, data: Vec<u8>) -> Self {
        Self {
            colors: SmallVec::from_buf([color]),
            data,
        }
    }

    /// A message claiming an arbitrary number of colors, as decoded off the
    /// wire.
    pub fn with_colors(colors: impl IntoIterator<Item = Color>, data: Vec<u8>) -> Self {
        Self {
            colors: colors.into_iter().collect(),
            data,
        }
    }

    pub fn colors(&self) -> &[Color] {
        &self.colors
    }

    /// The message's color, if it has exactly one.
    pub fn color(&self) -> Option<&Color> {
        match self.colors.as_slice() {
            [color] => Some(color),
            _ => None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("colors", &self.colors)
            .field("data", &format_args!("{} bytes", self.data.len()))
            .finish()
    }
}
