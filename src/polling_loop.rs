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

//! Polling loop frames and the filters services register against them.

use crate::error::{Error, Result};
use regex::{Regex, RegexBuilder};
use std::fmt;

/// Type of a frame observed in the reader polling loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PollingFrameType {
    NfcA,
    NfcB,
    NfcF,
    FieldOn,
    FieldOff,
    Unknown,
}

impl From<u8> for PollingFrameType {
    fn from(value: u8) -> Self {
        match value {
            b'A' => PollingFrameType::NfcA,
            b'B' => PollingFrameType::NfcB,
            b'F' => PollingFrameType::NfcF,
            b'O' => PollingFrameType::FieldOn,
            b'X' => PollingFrameType::FieldOff,
            _ => PollingFrameType::Unknown,
        }
    }
}

impl From<PollingFrameType> for u8 {
    fn from(value: PollingFrameType) -> Self {
        match value {
            PollingFrameType::NfcA => b'A',
            PollingFrameType::NfcB => b'B',
            PollingFrameType::NfcF => b'F',
            PollingFrameType::FieldOn => b'O',
            PollingFrameType::FieldOff => b'X',
            PollingFrameType::Unknown => b'U',
        }
    }
}

/// A single frame of the reader polling loop, as reported by the
/// controller in observe mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollingFrame {
    pub frame_type: PollingFrameType,
    pub data: Vec<u8>,
    pub gain: i8,
    pub timestamp: u32,
    /// Set by the engine when the frame matched an auto-transact filter.
    pub triggered_auto_transact: bool,
}

impl PollingFrame {
    pub fn new(frame_type: PollingFrameType, data: Vec<u8>) -> Self {
        PollingFrame { frame_type, data, gain: -1, timestamp: 0, triggered_auto_transact: false }
    }

    /// Parse a frame from its wire representation:
    /// `type(1) gain(1) timestamp(4, LE) data(..)`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(Error::InvalidArgument(format!(
                "polling frame too short ({} bytes)",
                bytes.len()
            )));
        }
        Ok(PollingFrame {
            frame_type: PollingFrameType::from(bytes[0]),
            gain: bytes[1] as i8,
            timestamp: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            data: bytes[6..].to_vec(),
            triggered_auto_transact: false,
        })
    }
}

/// Exact-match polling loop filter. The frame data must equal the
/// registered bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollingLoopFilter {
    frame: Vec<u8>,
    auto_transact: bool,
}

impl PollingLoopFilter {
    /// Parse a filter from its hex representation.
    pub fn parse(filter: &str, auto_transact: bool) -> Result<Self> {
        let frame = hex::decode(filter.trim()).map_err(|err| {
            Error::InvalidArgument(format!("polling loop filter {:?}: {}", filter, err))
        })?;
        Ok(PollingLoopFilter { frame, auto_transact })
    }

    pub fn auto_transact(&self) -> bool {
        self.auto_transact
    }

    pub fn matches(&self, frame: &PollingFrame) -> bool {
        frame.data == self.frame
    }

    /// Return true if the filter denotes the same bytes as the hex string.
    pub fn is_same(&self, filter: &str) -> bool {
        hex::decode(filter.trim()).map(|frame| frame == self.frame).unwrap_or(false)
    }
}

impl fmt::Display for PollingLoopFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.frame))
    }
}

/// Regular expression polling loop filter, matched against the uppercase
/// hex encoding of the whole frame data.
#[derive(Clone, Debug)]
pub struct PollingLoopPattern {
    source: String,
    regex: Regex,
    auto_transact: bool,
}

impl PollingLoopPattern {
    pub fn parse(pattern: &str, auto_transact: bool) -> Result<Self> {
        let source = pattern.trim().to_string();
        let regex = RegexBuilder::new(&format!("^(?:{})$", source))
            .case_insensitive(true)
            .build()
            .map_err(|err| {
                Error::InvalidArgument(format!("polling loop pattern {:?}: {}", pattern, err))
            })?;
        Ok(PollingLoopPattern { source, regex, auto_transact })
    }

    pub fn auto_transact(&self) -> bool {
        self.auto_transact
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, frame: &PollingFrame) -> bool {
        self.regex.is_match(&hex::encode_upper(&frame.data))
    }
}

impl PartialEq for PollingLoopPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source.eq_ignore_ascii_case(&other.source) && self.auto_transact == other.auto_transact
    }
}

impl Eq for PollingLoopPattern {}
