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

//! Default routes of the listen mode routing table, with a transient
//! override layer.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::service::SecureElement;
use std::fmt;

/// Symbolic route name that callers must never pass as an override.
pub const RESERVED_ROUTE_NAME: &str = "default";

/// Symbolic name of the host route.
pub const HOST_ROUTE_NAME: &str = "DH";

/// Identifier of an execution environment in the controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route(pub u8);

impl Route {
    /// Device host.
    pub const HOST: Route = Route(0x00);

    pub fn is_host(self) -> bool {
        self == Route::HOST
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Which default route an override applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RouteKind {
    Aid,
    IsoDep,
    OffHost,
    SystemCode,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct Overrides {
    aid: Option<Route>,
    iso_dep: Option<Route>,
    off_host: Option<Route>,
    sc: Option<Route>,
}

/// Current default routes plus override state.
#[derive(Clone, Debug)]
pub struct RoutingOptions {
    default_route: Route,
    default_iso_dep_route: Route,
    default_off_host_route: Route,
    default_sc_route: Route,
    overrides: Overrides,
    is_overridden: bool,
    auto_change: bool,
    ese_routes: Vec<u8>,
    uicc_routes: Vec<u8>,
}

impl RoutingOptions {
    pub fn new(config: &Config) -> Self {
        RoutingOptions {
            default_route: config.default_route,
            default_iso_dep_route: config.default_iso_dep_route,
            default_off_host_route: config.default_off_host_route,
            default_sc_route: config.default_sc_route,
            overrides: Overrides::default(),
            is_overridden: false,
            auto_change: true,
            ese_routes: config.ese_routes.clone(),
            uicc_routes: config.uicc_routes.clone(),
        }
    }

    fn effective(&self, value: Option<Route>, default: Route) -> Route {
        match value {
            Some(route) if self.is_overridden => route,
            _ => default,
        }
    }

    pub fn default_route(&self) -> Route {
        self.effective(self.overrides.aid, self.default_route)
    }

    pub fn default_iso_dep_route(&self) -> Route {
        self.effective(self.overrides.iso_dep, self.default_iso_dep_route)
    }

    pub fn default_off_host_route(&self) -> Route {
        self.effective(self.overrides.off_host, self.default_off_host_route)
    }

    pub fn default_sc_route(&self) -> Route {
        self.effective(self.overrides.sc, self.default_sc_route)
    }

    /// Set the override of one default route.
    pub fn set_override(&mut self, kind: RouteKind, route: Route) {
        log::debug!("+ set_override({:?}, {})", kind, route);
        match kind {
            RouteKind::Aid => self.overrides.aid = Some(route),
            RouteKind::IsoDep => self.overrides.iso_dep = Some(route),
            RouteKind::OffHost => self.overrides.off_host = Some(route),
            RouteKind::SystemCode => self.overrides.sc = Some(route),
        }
        self.is_overridden = true;
    }

    pub fn override_aid(&mut self, route: Route) {
        self.set_override(RouteKind::Aid, route)
    }

    pub fn override_iso_dep(&mut self, route: Route) {
        self.set_override(RouteKind::IsoDep, route)
    }

    pub fn override_off_host(&mut self, route: Route) {
        self.set_override(RouteKind::OffHost, route)
    }

    pub fn override_sc(&mut self, route: Route) {
        self.set_override(RouteKind::SystemCode, route)
    }

    /// Clear every override.
    pub fn recover(&mut self) {
        log::debug!("+ recover()");
        self.overrides = Overrides::default();
        self.is_overridden = false;
    }

    /// Promote the current overrides to configured defaults, then clear
    /// them.
    pub fn overwrite(&mut self) {
        log::debug!("+ overwrite()");
        let overrides = std::mem::take(&mut self.overrides);
        if let Some(route) = overrides.aid {
            self.default_route = route;
        }
        if let Some(route) = overrides.iso_dep {
            self.default_iso_dep_route = route;
        }
        if let Some(route) = overrides.off_host {
            self.default_off_host_route = route;
        }
        if let Some(route) = overrides.sc {
            self.default_sc_route = route;
        }
        self.is_overridden = false;
    }

    pub fn is_overridden(&self) -> bool {
        self.is_overridden
    }

    pub fn set_auto_change(&mut self, enabled: bool) {
        self.auto_change = enabled;
    }

    pub fn is_auto_change_enabled(&self) -> bool {
        self.auto_change
    }

    /// Return true for symbolic names that are reserved and must be
    /// rejected by callers.
    pub fn is_reserved(name: &str) -> bool {
        name == RESERVED_ROUTE_NAME
    }

    /// Map a symbolic route name (`DH`, `eSE<n>`, `SIM<n>`) to a route
    /// identifier. Returns `None` for unknown names, for indices outside
    /// the configured tables and for the reserved `default` name.
    pub fn route_for_secure_element(&self, name: &str) -> Option<Route> {
        if name == HOST_ROUTE_NAME {
            return Some(Route::HOST);
        }
        if RoutingOptions::is_reserved(name) {
            return None;
        }
        name.parse::<SecureElement>().ok().and_then(|se| self.route_for(se))
    }

    /// Like [`RoutingOptions::route_for_secure_element`] but failing with
    /// `InvalidArgument` for reserved or unknown names.
    pub fn parse_route(&self, name: &str) -> Result<Route> {
        if RoutingOptions::is_reserved(name) {
            return Err(Error::InvalidArgument(format!(
                "{:?} is reserved and cannot be used as a route",
                name
            )));
        }
        self.route_for_secure_element(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown route {:?}", name)))
    }

    /// Route identifier of an off-host target.
    pub fn route_for(&self, secure_element: SecureElement) -> Option<Route> {
        let (table, index) = match secure_element {
            SecureElement::Ese(index) => (&self.ese_routes, index),
            SecureElement::Sim(index) => (&self.uicc_routes, index),
        };
        table.get((index as usize).checked_sub(1)?).map(|id| Route(*id))
    }

    /// Symbolic name of a route identifier; the hex value when the route
    /// is not in any table.
    pub fn secure_element_for_route(&self, route: Route) -> String {
        if route.is_host() {
            return HOST_ROUTE_NAME.to_string();
        }
        if let Some(n) = self.ese_routes.iter().position(|id| *id == route.0) {
            return SecureElement::Ese(n as u8 + 1).to_string();
        }
        if let Some(n) = self.uicc_routes.iter().position(|id| *id == route.0) {
            return SecureElement::Sim(n as u8 + 1).to_string();
        }
        route.to_string()
    }

    /// Symbolic names of the default AID, ISO-DEP and off-host routes.
    pub fn routing_status(&self) -> Vec<String> {
        [self.default_route(), self.default_iso_dep_route(), self.default_off_host_route()]
            .into_iter()
            .map(|route| self.secure_element_for_route(route))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RoutingOptions {
        RoutingOptions::new(&Config {
            ese_routes: vec![0x86, 0x87],
            uicc_routes: vec![0x81],
            ..Config::default()
        })
    }

    #[test]
    fn symbolic_routes() {
        let options = options();
        assert_eq!(options.route_for_secure_element("DH"), Some(Route::HOST));
        assert_eq!(options.route_for_secure_element("eSE"), Some(Route(0x86)));
        assert_eq!(options.route_for_secure_element("eSE2"), Some(Route(0x87)));
        assert_eq!(options.route_for_secure_element("eSE3"), None);
        assert_eq!(options.route_for_secure_element("SIM1"), Some(Route(0x81)));
        assert_eq!(options.route_for_secure_element("NFC"), None);
        assert_eq!(options.route_for_secure_element("default"), None);
        assert!(matches!(options.parse_route("default"), Err(Error::InvalidArgument(_))));
        assert!(matches!(options.parse_route("eSE9"), Err(Error::InvalidArgument(_))));
        assert_eq!(options.secure_element_for_route(Route(0x87)), "eSE2");
        assert_eq!(options.secure_element_for_route(Route(0x81)), "SIM1");
        assert_eq!(options.secure_element_for_route(Route::HOST), "DH");
    }

    #[test]
    fn override_then_recover() {
        let mut options = options();
        options.override_iso_dep(Route(0x86));
        options.override_off_host(Route(0x81));
        assert!(options.is_overridden());
        assert_eq!(options.default_iso_dep_route(), Route(0x86));
        assert_eq!(options.default_off_host_route(), Route(0x81));
        assert_eq!(options.default_route(), Route::HOST);
        assert_eq!(options.routing_status(), vec!["DH", "eSE1", "SIM1"]);

        options.recover();
        assert!(!options.is_overridden());
        assert_eq!(options.default_iso_dep_route(), Route::HOST);
        assert_eq!(options.routing_status(), vec!["DH", "DH", "DH"]);
    }

    #[test]
    fn overwrite_promotes_overrides() {
        let mut options = options();
        options.override_aid(Route(0x86));
        options.override_sc(Route(0x81));
        options.overwrite();
        assert!(!options.is_overridden());
        assert_eq!(options.default_route(), Route(0x86));
        assert_eq!(options.default_sc_route(), Route(0x81));
        options.recover();
        assert_eq!(options.default_route(), Route(0x86));
    }
}
