// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application Identifiers and AID groups.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Minimum AID length in bytes, as per ISO 7816-4.
pub const MIN_AID_LENGTH: usize = 5;
/// Maximum AID length in bytes, as per ISO 7816-4.
pub const MAX_AID_LENGTH: usize = 16;

const PREFIX_MARKER: char = '*';
const SUBSET_MARKER: char = '#';

/// Matching rule attached to a registered AID. The kind is a function of
/// the suffix marker only.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AidKind {
    /// Plain AID, matched exactly.
    Exact,
    /// `*` suffix: matches any AID starting with the registered bytes.
    Prefix,
    /// `#` suffix: matches any AID whose bytes are an initial run of the
    /// registered bytes.
    Subset,
}

/// An Application Identifier with its matching rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Aid {
    bytes: Vec<u8>,
    kind: AidKind,
}

impl Aid {
    /// Create an AID from raw bytes, checking the ISO 7816-4 length bounds.
    pub fn new(bytes: Vec<u8>, kind: AidKind) -> Result<Self> {
        if bytes.len() < MIN_AID_LENGTH || bytes.len() > MAX_AID_LENGTH {
            return Err(Error::InvalidAid(format!(
                "{} has length {}, expected {}..={} bytes",
                hex::encode_upper(&bytes),
                bytes.len(),
                MIN_AID_LENGTH,
                MAX_AID_LENGTH
            )));
        }
        Ok(Aid { bytes, kind })
    }

    /// Create an exact AID from raw bytes.
    pub fn exact(bytes: &[u8]) -> Result<Self> {
        Aid::new(bytes.to_vec(), AidKind::Exact)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> AidKind {
        self.kind
    }

    pub fn is_exact(&self) -> bool {
        self.kind == AidKind::Exact
    }

    pub fn is_prefix(&self) -> bool {
        self.kind == AidKind::Prefix
    }

    pub fn is_subset(&self) -> bool {
        self.kind == AidKind::Subset
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The same bytes matched exactly. Used when the controller cannot
    /// route prefix or subset AIDs.
    pub fn to_exact(&self) -> Aid {
        Aid { bytes: self.bytes.clone(), kind: AidKind::Exact }
    }

    /// Return true if this registered AID covers the selected bytes.
    ///
    ///  * exact - the bytes are identical
    ///  * prefix - the selected bytes start with the registered bytes
    ///  * subset - the selected bytes are an initial run of the registered
    ///    bytes, at least [`MIN_AID_LENGTH`] long
    pub fn matches(&self, selected: &[u8]) -> bool {
        match self.kind {
            AidKind::Exact => self.bytes == selected,
            AidKind::Prefix => selected.starts_with(&self.bytes),
            AidKind::Subset => {
                selected.len() >= MIN_AID_LENGTH && self.bytes.starts_with(selected)
            }
        }
    }

    /// Return true if every AID matched by `other` is also matched by
    /// `self`.
    pub fn covers(&self, other: &Aid) -> bool {
        match (self.kind, other.kind) {
            (_, AidKind::Exact) => self.matches(&other.bytes),
            (AidKind::Prefix, AidKind::Prefix) => other.bytes.starts_with(&self.bytes),
            (AidKind::Subset, AidKind::Subset) => self.bytes.starts_with(&other.bytes),
            _ => false,
        }
    }

    /// Return true if some selectable AID is matched by both registrations.
    pub fn intersects(&self, other: &Aid) -> bool {
        let (a, b) = (&self.bytes, &other.bytes);
        match (self.kind, other.kind) {
            (AidKind::Exact, _) => other.matches(a),
            (_, AidKind::Exact) => self.matches(b),
            (AidKind::Prefix, AidKind::Prefix) => a.starts_with(b) || b.starts_with(a),
            (AidKind::Subset, AidKind::Subset) => a[..MIN_AID_LENGTH] == b[..MIN_AID_LENGTH],
            (AidKind::Prefix, AidKind::Subset) => b.starts_with(a),
            (AidKind::Subset, AidKind::Prefix) => a.starts_with(b),
        }
    }

    /// Uppercase hex representation of the bytes, without suffix marker.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }
}

impl FromStr for Aid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (digits, kind) = if let Some(digits) = trimmed.strip_suffix(PREFIX_MARKER) {
            (digits, AidKind::Prefix)
        } else if let Some(digits) = trimmed.strip_suffix(SUBSET_MARKER) {
            (digits, AidKind::Subset)
        } else {
            (trimmed, AidKind::Exact)
        };
        let bytes =
            hex::decode(digits).map_err(|err| Error::InvalidAid(format!("{:?}: {}", s, err)))?;
        Aid::new(bytes, kind)
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())?;
        match self.kind {
            AidKind::Exact => Ok(()),
            AidKind::Prefix => write!(f, "{}", PREFIX_MARKER),
            AidKind::Subset => write!(f, "{}", SUBSET_MARKER),
        }
    }
}

/// Category of an AID group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Payment,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Payment => "payment",
            Category::Other => "other",
        }
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "payment" => Ok(Category::Payment),
            "other" => Ok(Category::Other),
            _ => Err(Error::InvalidArgument(format!("unknown category {:?}", s))),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category together with an ordered set of AIDs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AidGroup {
    category: Category,
    aids: Vec<Aid>,
}

impl AidGroup {
    /// Build a group, dropping duplicate AIDs while keeping the first
    /// occurrence order.
    pub fn new(category: Category, aids: impl IntoIterator<Item = Aid>) -> Self {
        let mut unique: Vec<Aid> = vec![];
        for aid in aids {
            if !unique.contains(&aid) {
                unique.push(aid);
            }
        }
        AidGroup { category, aids: unique }
    }

    /// Parse a group from AID strings. The first malformed AID rejects the
    /// whole group.
    pub fn parse<S: AsRef<str>>(category: Category, aids: &[S]) -> Result<Self> {
        let aids = aids.iter().map(|aid| aid.as_ref().parse::<Aid>()).collect::<Result<Vec<_>>>()?;
        Ok(AidGroup::new(category, aids))
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn aids(&self) -> &[Aid] {
        &self.aids
    }

    pub fn contains(&self, aid: &Aid) -> bool {
        self.aids.contains(aid)
    }
}
