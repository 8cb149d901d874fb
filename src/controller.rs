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

//! Southbound interface to the NFC controller driver.

use crate::aid::Aid;
use crate::error::{Error, Result};
use crate::polling_loop::PollingFrame;
use crate::routing_options::Route;
use crate::routing_table::RoutingEntry;
use futures::future::BoxFuture;
use std::collections::BTreeMap;

/// Maximum listen mode routing table size of the emulated controller, in
/// bytes.
pub const MAX_ROUTING_TABLE_SIZE: usize = 512;

/// Routing features reported by the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControllerCapabilities {
    pub supports_prefix: bool,
    pub supports_subset: bool,
    /// Capacity of the listen mode routing table, in bytes.
    pub max_routing_table_size: usize,
}

impl Default for ControllerCapabilities {
    fn default() -> Self {
        ControllerCapabilities {
            supports_prefix: false,
            supports_subset: false,
            max_routing_table_size: MAX_ROUTING_TABLE_SIZE,
        }
    }
}

/// Scalar default routes submitted alongside the AID entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DefaultRoutes {
    pub default_route: Route,
    pub iso_dep: Route,
    pub off_host: Route,
    pub system_code: Route,
}

/// Technology of a host card emulation activation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Technology {
    /// ISO-DEP, APDU based.
    IsoDep,
    NfcF,
    Other(u8),
}

impl From<u8> for Technology {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Technology::IsoDep,
            0x04 => Technology::NfcF,
            other => Technology::Other(other),
        }
    }
}

impl From<Technology> for u8 {
    fn from(value: Technology) -> Self {
        match value {
            Technology::IsoDep => 0x01,
            Technology::NfcF => 0x04,
            Technology::Other(other) => other,
        }
    }
}

/// Notification received from the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A reader activated host card emulation.
    Activated(Technology),
    /// An APDU was received from the reader.
    Data(Vec<u8>),
    Deactivated,
    FieldChange(bool),
    PollingFrames(Vec<PollingFrame>),
    ObserveModeChanged(bool),
    /// The reader selected an AID routed off host.
    OffHostAidSelected,
}

/// Command sent to the controller, in its transport representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerCommand {
    Data(Vec<u8>),
    ConfigureRouting { force: bool, tlvs: Vec<u8> },
    SetDefaultRoutes(DefaultRoutes),
    CommitRouting,
    SetObserveMode(bool),
    AllowAutoTransact,
    SetNfcEnabled(bool),
}

mod opcode {
    pub const ACTIVATED: u8 = 0x01;
    pub const DATA: u8 = 0x02;
    pub const DEACTIVATED: u8 = 0x03;
    pub const FIELD_CHANGE: u8 = 0x04;
    pub const POLLING_FRAMES: u8 = 0x05;
    pub const OBSERVE_MODE_CHANGED: u8 = 0x06;
    pub const OFF_HOST_AID_SELECTED: u8 = 0x07;

    pub const SEND_DATA: u8 = 0x81;
    pub const CONFIGURE_ROUTING: u8 = 0x82;
    pub const SET_DEFAULT_ROUTES: u8 = 0x83;
    pub const COMMIT_ROUTING: u8 = 0x84;
    pub const SET_OBSERVE_MODE: u8 = 0x85;
    pub const ALLOW_AUTO_TRANSACT: u8 = 0x86;
    pub const SET_NFC_ENABLED: u8 = 0x87;
}

impl ControllerEvent {
    /// Parse an event from a transport packet: one opcode byte followed by
    /// the event payload.
    pub fn parse(packet: &[u8]) -> Result<ControllerEvent> {
        let (&op, payload) = packet
            .split_first()
            .ok_or_else(|| Error::InvalidArgument("empty controller packet".to_string()))?;
        let flag = || {
            payload.first().map(|b| *b != 0).ok_or_else(|| {
                Error::InvalidArgument(format!("missing payload for opcode {:#04x}", op))
            })
        };
        Ok(match op {
            opcode::ACTIVATED => ControllerEvent::Activated(Technology::from(
                payload.first().copied().unwrap_or(0x01),
            )),
            opcode::DATA => ControllerEvent::Data(payload.to_vec()),
            opcode::DEACTIVATED => ControllerEvent::Deactivated,
            opcode::FIELD_CHANGE => ControllerEvent::FieldChange(flag()?),
            opcode::POLLING_FRAMES => {
                let mut frames = vec![];
                let mut rest = payload;
                while let Some((&len, tail)) = rest.split_first() {
                    let len = len as usize;
                    if tail.len() < len {
                        return Err(Error::InvalidArgument(format!(
                            "truncated polling frame ({} of {} bytes)",
                            tail.len(),
                            len
                        )));
                    }
                    frames.push(PollingFrame::parse(&tail[..len])?);
                    rest = &tail[len..];
                }
                ControllerEvent::PollingFrames(frames)
            }
            opcode::OBSERVE_MODE_CHANGED => ControllerEvent::ObserveModeChanged(flag()?),
            opcode::OFF_HOST_AID_SELECTED => ControllerEvent::OffHostAidSelected,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "unexpected controller opcode {:#04x}",
                    op
                )))
            }
        })
    }
}

impl From<ControllerCommand> for Vec<u8> {
    fn from(command: ControllerCommand) -> Self {
        match command {
            ControllerCommand::Data(data) => [&[opcode::SEND_DATA][..], &data].concat(),
            ControllerCommand::ConfigureRouting { force, tlvs } => {
                [&[opcode::CONFIGURE_ROUTING, force as u8][..], &tlvs].concat()
            }
            ControllerCommand::SetDefaultRoutes(routes) => vec![
                opcode::SET_DEFAULT_ROUTES,
                routes.default_route.0,
                routes.iso_dep.0,
                routes.off_host.0,
                routes.system_code.0,
            ],
            ControllerCommand::CommitRouting => vec![opcode::COMMIT_ROUTING],
            ControllerCommand::SetObserveMode(enable) => {
                vec![opcode::SET_OBSERVE_MODE, enable as u8]
            }
            ControllerCommand::AllowAutoTransact => vec![opcode::ALLOW_AUTO_TRANSACT],
            ControllerCommand::SetNfcEnabled(enable) => vec![opcode::SET_NFC_ENABLED, enable as u8],
        }
    }
}

/// Driver of the NFC controller. Futures complete when the controller
/// acknowledged the command.
pub trait ControllerDriver: Send + Sync {
    fn capabilities(&self) -> ControllerCapabilities;

    /// Replace the AID entries of the listen mode routing table.
    fn configure_routing<'a>(
        &'a self,
        entries: &'a BTreeMap<Aid, RoutingEntry>,
        force: bool,
    ) -> BoxFuture<'a, Result<()>>;

    fn set_default_routes(&self, routes: DefaultRoutes) -> BoxFuture<'_, Result<()>>;

    /// Make the configured routing table effective.
    fn commit_routing(&self) -> BoxFuture<'_, Result<()>>;

    /// Send a response APDU to the reader.
    fn send_data(&self, response: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    fn set_observe_mode(&self, enable: bool) -> BoxFuture<'_, Result<()>>;

    /// Let the controller answer the next activation without waiting for
    /// observe mode to be disabled.
    fn allow_auto_transact(&self) -> BoxFuture<'_, Result<()>>;

    fn set_nfc_enabled(&self, enable: bool) -> BoxFuture<'_, Result<()>>;
}
