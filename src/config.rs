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

//! Static platform configuration.

use crate::routing_options::Route;
use core::time::Duration;

/// Default route of the NFC-F system code.
pub const DEFAULT_SC_ROUTE: Route = Route(0xc0);

/// Platform configuration, fixed for the lifetime of the manager.
#[derive(Clone, Debug)]
pub struct Config {
    /// Route of AIDs without an explicit entry.
    pub default_route: Route,
    pub default_iso_dep_route: Route,
    pub default_off_host_route: Route,
    pub default_sc_route: Route,
    /// Route identifiers of the embedded secure elements, `eSE1` first.
    pub ese_routes: Vec<u8>,
    /// Route identifiers of the UICC slots, `SIM1` first.
    pub uicc_routes: Vec<u8>,
    /// Default wallet role is available on the platform.
    pub wallet_role_enabled: bool,
    /// Services of other packages may share the wallet holder priority.
    pub associated_role_services: bool,
    pub observe_mode_supported: bool,
    /// Services may opt out of the other category.
    pub other_category_feature: bool,
    pub bind_timeout: Duration,
    pub apdu_timeout: Duration,
    pub nfc_state_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_route: Route::HOST,
            default_iso_dep_route: Route::HOST,
            default_off_host_route: Route::HOST,
            default_sc_route: DEFAULT_SC_ROUTE,
            ese_routes: vec![0x86],
            uicc_routes: vec![0x81],
            wallet_role_enabled: true,
            associated_role_services: false,
            observe_mode_supported: true,
            other_category_feature: true,
            bind_timeout: Duration::from_secs(3),
            apdu_timeout: Duration::from_secs(3),
            nfc_state_timeout: Duration::from_secs(2),
        }
    }
}
