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

//! ISO 7816-4 command helpers used by the host emulation engine.

use crate::aid::{MAX_AID_LENGTH, MIN_AID_LENGTH};

/// `CLA INS P1 P2` of a SELECT by DF name, first or only occurrence.
pub const SELECT_APDU_HEADER: [u8; 4] = [0x00, 0xa4, 0x04, 0x00];
/// Header length including `Lc`.
pub const SELECT_APDU_HDR_LENGTH: usize = 5;

pub const SW_NO_ERROR: [u8; 2] = [0x90, 0x00];
/// File or application not found.
pub const SW_FILE_NOT_FOUND: [u8; 2] = [0x6a, 0x82];
/// No precise diagnosis.
pub const SW_UNKNOWN_ERROR: [u8; 2] = [0x6f, 0x00];

/// NDEF Tag Application, version 1.0 and 2.0.
pub const NDEF_AIDS: [[u8; 7]; 2] = [
    [0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x00],
    [0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x01],
];

/// Return the AID named by a SELECT APDU, or `None` if the buffer is not a
/// well formed SELECT by AID.
pub fn select_aid(apdu: &[u8]) -> Option<&[u8]> {
    if apdu.len() < SELECT_APDU_HDR_LENGTH || apdu[..4] != SELECT_APDU_HEADER {
        return None;
    }
    let lc = apdu[4] as usize;
    if !(MIN_AID_LENGTH..=MAX_AID_LENGTH).contains(&lc) {
        return None;
    }
    apdu.get(SELECT_APDU_HDR_LENGTH..SELECT_APDU_HDR_LENGTH + lc)
}

/// Return true if the APDU selects one of the NDEF Tag Application AIDs.
pub fn is_ndef_select(apdu: &[u8]) -> bool {
    select_aid(apdu).map_or(false, |aid| NDEF_AIDS.iter().any(|ndef| ndef[..] == *aid))
}

/// Per-session latch recording whether an APDU other than an NDEF SELECT
/// was seen. Once set it stays set until [`SkipAidLatch::reset`].
#[derive(Clone, Debug, Default)]
pub struct SkipAidLatch {
    not_skip_aid: bool,
}

impl SkipAidLatch {
    /// Feed an incoming APDU. Returns true if the APDU is to be skipped,
    /// i.e. it must not count as user activity.
    pub fn observe(&mut self, apdu: &[u8]) -> bool {
        if self.not_skip_aid {
            return false;
        }
        if is_ndef_select(apdu) {
            return true;
        }
        self.not_skip_aid = true;
        false
    }

    pub fn is_set(&self) -> bool {
        self.not_skip_aid
    }

    pub fn reset(&mut self) {
        self.not_skip_aid = false;
    }
}
