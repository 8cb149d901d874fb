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

//! Host Card Emulation control plane.
//!
//! Keeps the registry of card emulation services, resolves ISO 7816-4
//! application identifiers to services, programs the listen mode routing
//! table of the NFC controller and dispatches command APDUs to the host
//! services selected by a reader.

pub mod aid;
pub mod aid_cache;
pub mod apdu;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod host_emulation;
pub mod listeners;
pub mod manager;
pub mod polling_loop;
pub mod preferred;
pub mod registry;
pub mod routing_options;
pub mod routing_table;
pub mod service;

pub use error::{Error, Result};
