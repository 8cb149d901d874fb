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

//! Listen mode routing table construction.
//!
//! The builder turns the resolved AIDs into a plan that fits the controller
//! routing table. When the per-AID plan is too large it applies, in order:
//!
//!  1. prefix collapsing: AIDs of one route sharing a leading byte run are
//!     merged into a single prefix entry, longest savings first,
//!  2. default route fallback: entries served by the default route are left
//!     out, moving the default route to the largest route group if needed,
//!  3. truncation: entries that still do not fit are reported as not
//!     routed, the landings of the preferred service being kept.

use crate::aid::{Aid, AidKind, Category, MAX_AID_LENGTH, MIN_AID_LENGTH};
use crate::aid_cache::AidCache;
use crate::controller::{ControllerCapabilities, ControllerDriver, DefaultRoutes};
use crate::error::{Error, Result};
use crate::routing_options::{Route, RoutingOptions};
use bitflags::bitflags;
use std::collections::{BTreeMap, BTreeSet};

/// Size of the TLV header of a routing entry: type, length, route and
/// power state.
pub const ENTRY_HEADER_SIZE: usize = 4;
/// Size of the empty AID entry carrying the default route.
pub const DEFAULT_ENTRY_SIZE: usize = ENTRY_HEADER_SIZE;

/// NCI listen mode routing entry type for AID based routing.
pub const AID_ROUTING_TYPE: u8 = 0x02;
/// NCI qualifier of prefix AID entries.
pub const AID_ROUTE_QUAL_PREFIX: u8 = 0x10;
/// NCI qualifier of subset AID entries.
pub const AID_ROUTE_QUAL_SUBSET: u8 = 0x20;

bitflags! {
    /// Power states in which a routing entry applies.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PowerState: u8 {
        const SWITCH_ON = 0x01;
        const SWITCH_OFF = 0x02;
        const BATTERY_OFF = 0x04;
        const SCREEN_OFF_UNLOCKED = 0x08;
        const SCREEN_ON_LOCKED = 0x10;
        const SCREEN_OFF_LOCKED = 0x20;
    }
}

impl PowerState {
    /// Power states of an entry with the given policy flags. Off-host
    /// entries without screen or lock constraints also apply with the
    /// device switched off.
    pub fn for_entry(on_host: bool, requires_unlock: bool, requires_screen_on: bool) -> Self {
        let mut power = PowerState::SWITCH_ON;
        if !requires_unlock {
            power |= PowerState::SCREEN_ON_LOCKED;
        }
        if !requires_screen_on {
            power |= PowerState::SCREEN_OFF_UNLOCKED;
            if !requires_unlock {
                power |= PowerState::SCREEN_OFF_LOCKED;
            }
        }
        if !on_host && !requires_unlock && !requires_screen_on {
            power |= PowerState::SWITCH_OFF | PowerState::BATTERY_OFF;
        }
        power
    }
}

/// A single AID entry of the routing plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingEntry {
    pub aid: Aid,
    pub route: Route,
    pub on_host: bool,
    pub requires_unlock: bool,
    pub requires_screen_on: bool,
    pub auto_transact: bool,
    pub power: PowerState,
    pub category: Option<Category>,
    /// The entry lands on the preferred service.
    pub preferred: bool,
}

impl RoutingEntry {
    pub fn match_kind(&self) -> AidKind {
        self.aid.kind()
    }

    /// Size of the entry in the controller table, in bytes.
    pub fn size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.aid.len()
    }

    /// Append the listen mode routing TLV of the entry.
    pub fn encode(&self, tlvs: &mut Vec<u8>) {
        let qualifier = match self.aid.kind() {
            AidKind::Exact => 0,
            AidKind::Prefix => AID_ROUTE_QUAL_PREFIX,
            AidKind::Subset => AID_ROUTE_QUAL_SUBSET,
        };
        tlvs.push(AID_ROUTING_TYPE | qualifier);
        tlvs.push((2 + self.aid.len()) as u8);
        tlvs.push(self.route.0);
        tlvs.push(self.power.bits());
        tlvs.extend_from_slice(self.aid.as_bytes());
    }
}

/// Routing table submitted to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingPlan {
    pub entries: BTreeMap<Aid, RoutingEntry>,
    pub default_routes: DefaultRoutes,
    /// AIDs left out of the table for lack of space or of a route.
    pub not_routed: Vec<Aid>,
}

fn table_size<'a>(entries: impl IntoIterator<Item = &'a RoutingEntry>) -> usize {
    DEFAULT_ENTRY_SIZE + entries.into_iter().map(RoutingEntry::size).sum::<usize>()
}

impl RoutingPlan {
    /// Estimated size in the controller table, default entry included.
    pub fn size(&self) -> usize {
        table_size(self.entries.values())
    }

    /// Route taken by a selected AID: exact entry, else the longest prefix
    /// or subset entry, else the default route.
    pub fn route_of(&self, selected: &[u8]) -> Route {
        if let Some(entry) = Aid::exact(selected).ok().and_then(|aid| self.entries.get(&aid)) {
            return entry.route;
        }
        self.entries
            .values()
            .filter(|e| !e.aid.is_exact() && e.aid.matches(selected))
            .max_by_key(|e| e.aid.len())
            .map_or(self.default_routes.default_route, |e| e.route)
    }

    /// Encode the plan as NCI listen mode routing TLVs, the empty AID
    /// default entry last.
    pub fn encode(&self) -> Vec<u8> {
        let mut tlvs = Vec::with_capacity(self.size());
        for entry in self.entries.values() {
            entry.encode(&mut tlvs);
        }
        let default_route = self.default_routes.default_route;
        tlvs.extend_from_slice(&[
            AID_ROUTING_TYPE,
            2,
            default_route.0,
            PowerState::for_entry(default_route.is_host(), false, false).bits(),
        ]);
        tlvs
    }
}

/// Builds routing plans and keeps the last plan accepted by the
/// controller.
pub struct RoutingTableBuilder {
    capabilities: ControllerCapabilities,
    committed: Option<RoutingPlan>,
}

impl RoutingTableBuilder {
    pub fn new(capabilities: ControllerCapabilities) -> Self {
        RoutingTableBuilder { capabilities, committed: None }
    }

    pub fn set_capabilities(&mut self, capabilities: ControllerCapabilities) {
        self.capabilities = capabilities;
    }

    /// Last plan accepted by the controller.
    pub fn committed(&self) -> Option<&RoutingPlan> {
        self.committed.as_ref()
    }

    /// Compute the plan for the current resolution.
    pub fn build(&self, cache: &AidCache, options: &RoutingOptions) -> Result<RoutingPlan> {
        let capacity = self.capabilities.max_routing_table_size;
        if capacity < DEFAULT_ENTRY_SIZE {
            return Err(Error::RebuildFailed(format!(
                "routing table capacity of {} bytes cannot hold the default route",
                capacity
            )));
        }
        let default_routes = DefaultRoutes {
            default_route: options.default_route(),
            iso_dep: options.default_iso_dep_route(),
            off_host: options.default_off_host_route(),
            system_code: options.default_sc_route(),
        };
        let preferred = cache.preferred_service().component.as_ref();
        let mut entries = BTreeMap::new();
        let mut not_routed = vec![];

        for (aid, info) in cache.entries() {
            let entry = match &info.default_service {
                Some(service) => {
                    let route = if service.on_host {
                        Route::HOST
                    } else {
                        match service.secure_element() {
                            None => default_routes.off_host,
                            Some(se) => match options.route_for(se) {
                                Some(route) => route,
                                None => {
                                    log::error!("no route configured for {} ({})", se, aid);
                                    not_routed.push(aid.clone());
                                    continue;
                                }
                            },
                        }
                    };
                    RoutingEntry {
                        aid: aid.clone(),
                        route,
                        on_host: route.is_host(),
                        requires_unlock: service.requires_unlock,
                        requires_screen_on: service.requires_screen_on,
                        auto_transact: service.polling_filters.iter().any(|f| f.auto_transact())
                            || service.polling_patterns.iter().any(|p| p.auto_transact()),
                        power: PowerState::for_entry(
                            route.is_host(),
                            service.requires_unlock,
                            service.requires_screen_on,
                        ),
                        category: info.category,
                        preferred: Some(&service.component) == preferred,
                    }
                }
                None => {
                    let route = default_routes.default_route;
                    let requires_unlock = info.services.iter().any(|s| s.requires_unlock);
                    let requires_screen_on = info.services.iter().any(|s| s.requires_screen_on);
                    RoutingEntry {
                        aid: aid.clone(),
                        route,
                        on_host: route.is_host(),
                        requires_unlock,
                        requires_screen_on,
                        auto_transact: false,
                        power: PowerState::for_entry(
                            route.is_host(),
                            requires_unlock,
                            requires_screen_on,
                        ),
                        category: info.category,
                        preferred: false,
                    }
                }
            };
            entries.insert(aid.clone(), entry);
        }

        let mut plan = RoutingPlan { entries, default_routes, not_routed };
        self.fit(&mut plan, capacity);
        log::debug!(
            " > routing plan: {} entries, {} bytes, {} not routed",
            plan.entries.len(),
            plan.size(),
            plan.not_routed.len()
        );
        Ok(plan)
    }

    fn fit(&self, plan: &mut RoutingPlan, capacity: usize) {
        if plan.size() <= capacity {
            return;
        }
        log::info!("routing table of {} bytes exceeds capacity of {}", plan.size(), capacity);

        if self.capabilities.supports_prefix {
            while plan.size() > capacity {
                if !collapse_once(&mut plan.entries, plan.default_routes.off_host) {
                    break;
                }
            }
            if plan.size() <= capacity {
                return;
            }
        }

        let (default_route, entries) =
            apply_default_route(&plan.entries, plan.default_routes.default_route, capacity);
        if default_route != plan.default_routes.default_route {
            log::info!(
                "moving default route from {} to {}",
                plan.default_routes.default_route,
                default_route
            );
        }
        plan.default_routes.default_route = default_route;
        plan.entries = entries;
        if plan.size() <= capacity {
            return;
        }

        truncate(plan, capacity);
    }

    /// Submit a plan to the controller. An unchanged plan is not submitted
    /// again unless `force` is set. When the controller rejects the plan
    /// the previously accepted plan is submitted back.
    ///
    /// Returns true if the plan was submitted.
    pub async fn commit(
        &mut self,
        driver: &dyn ControllerDriver,
        plan: &RoutingPlan,
        force: bool,
    ) -> Result<bool> {
        if !force && self.committed.as_ref() == Some(plan) {
            log::debug!(" > routing plan unchanged");
            return Ok(false);
        }
        match submit(driver, plan, force).await {
            Ok(()) => {
                self.committed = Some(plan.clone());
                Ok(true)
            }
            Err(err) => {
                log::error!("routing plan rejected: {}", err);
                if let Some(previous) = &self.committed {
                    if let Err(err) = submit(driver, previous, true).await {
                        log::error!("failed to restore previous routing plan: {}", err);
                    }
                }
                Err(Error::RoutingRejected(err.to_string()))
            }
        }
    }
}

async fn submit(driver: &dyn ControllerDriver, plan: &RoutingPlan, force: bool) -> Result<()> {
    driver.configure_routing(&plan.entries, force).await?;
    driver.set_default_routes(plan.default_routes).await?;
    driver.commit_routing().await
}

struct Collapse {
    savings: usize,
    matches_off_host: bool,
    prefix: Aid,
    route: Route,
    members: Vec<Aid>,
}

impl Collapse {
    fn rank(&self) -> (usize, bool, usize) {
        (self.savings, self.matches_off_host, self.prefix.len())
    }
}

/// Merge the best group of same-route entries into one prefix entry.
/// Returns false when no group can be collapsed.
fn collapse_once(entries: &mut BTreeMap<Aid, RoutingEntry>, default_off_host: Route) -> bool {
    let routes: BTreeSet<Route> = entries.values().map(|e| e.route).collect();
    let mut best: Option<Collapse> = None;

    for route in routes {
        let members: Vec<&RoutingEntry> =
            entries.values().filter(|e| e.route == route && !e.aid.is_subset()).collect();
        for len in MIN_AID_LENGTH..=MAX_AID_LENGTH {
            let mut groups: BTreeMap<&[u8], Vec<&RoutingEntry>> = BTreeMap::new();
            for entry in members.iter().filter(|e| e.aid.len() >= len) {
                groups.entry(&entry.aid.as_bytes()[..len]).or_default().push(entry);
            }
            for (bytes, group) in groups {
                if group.len() < 2 {
                    continue;
                }
                let Ok(prefix) = Aid::new(bytes.to_vec(), AidKind::Prefix) else { continue };
                let cost: usize = group.iter().map(|e| e.size()).sum();
                let merged = ENTRY_HEADER_SIZE + len;
                if cost <= merged {
                    continue;
                }
                if entries.values().any(|o| o.route != route && o.aid.intersects(&prefix)) {
                    continue;
                }
                let candidate = Collapse {
                    savings: cost - merged,
                    matches_off_host: route == default_off_host,
                    prefix,
                    route,
                    members: group.iter().map(|e| e.aid.clone()).collect(),
                };
                if best.as_ref().map_or(true, |b| candidate.rank() > b.rank()) {
                    best = Some(candidate);
                }
            }
        }
    }

    let Some(collapse) = best else { return false };
    log::debug!(
        " > collapsing {} entries into {} on route {}",
        collapse.members.len(),
        collapse.prefix,
        collapse.route
    );
    let removed: Vec<RoutingEntry> =
        collapse.members.iter().filter_map(|aid| entries.remove(aid)).collect();
    let requires_unlock = removed.iter().any(|e| e.requires_unlock);
    let requires_screen_on = removed.iter().any(|e| e.requires_screen_on);
    let category = removed.first().and_then(|e| e.category).filter(|c| {
        removed.iter().all(|e| e.category == Some(*c))
    });
    entries.insert(
        collapse.prefix.clone(),
        RoutingEntry {
            aid: collapse.prefix,
            route: collapse.route,
            on_host: collapse.route.is_host(),
            requires_unlock,
            requires_screen_on,
            auto_transact: removed.iter().any(|e| e.auto_transact),
            power: PowerState::for_entry(collapse.route.is_host(), requires_unlock, requires_screen_on),
            category,
            preferred: removed.iter().any(|e| e.preferred),
        },
    );
    true
}

/// Entries remaining when `default_route` serves its own AIDs. An entry is
/// kept when a wider entry of another route would otherwise capture it.
fn without_default_route(
    entries: &BTreeMap<Aid, RoutingEntry>,
    default_route: Route,
) -> BTreeMap<Aid, RoutingEntry> {
    entries
        .iter()
        .filter(|(aid, entry)| {
            entry.route != default_route
                || entries.values().any(|o| {
                    o.route != default_route && &o.aid != *aid && !o.aid.is_exact() && o.aid.covers(aid)
                })
        })
        .map(|(aid, entry)| (aid.clone(), entry.clone()))
        .collect()
}

/// Pick the default route: the current one if leaving out its entries is
/// enough, else the route group whose removal fits, largest first.
/// Falls back to the smallest resulting table.
fn apply_default_route(
    entries: &BTreeMap<Aid, RoutingEntry>,
    current: Route,
    capacity: usize,
) -> (Route, BTreeMap<Aid, RoutingEntry>) {
    let mut group_sizes: BTreeMap<Route, usize> = BTreeMap::new();
    for entry in entries.values() {
        *group_sizes.entry(entry.route).or_default() += entry.size();
    }
    let mut candidates: Vec<(Route, usize)> =
        group_sizes.into_iter().filter(|(route, _)| *route != current).collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut best = (current, without_default_route(entries, current));
    if table_size(best.1.values()) <= capacity {
        return best;
    }
    for (route, _) in candidates {
        let reduced = without_default_route(entries, route);
        let size = table_size(reduced.values());
        if size <= capacity {
            return (route, reduced);
        }
        if size < table_size(best.1.values()) {
            best = (route, reduced);
        }
    }
    best
}

/// Drop entries until the plan fits. Landings of the preferred service are
/// never dropped.
fn truncate(plan: &mut RoutingPlan, capacity: usize) {
    let (preferred, others): (Vec<RoutingEntry>, Vec<RoutingEntry>) =
        std::mem::take(&mut plan.entries).into_values().partition(|e| e.preferred);
    let mut size = table_size(&preferred);
    plan.entries = preferred.into_iter().map(|e| (e.aid.clone(), e)).collect();
    for entry in others {
        if size + entry.size() <= capacity {
            size += entry.size();
            plan.entries.insert(entry.aid.clone(), entry);
        } else {
            log::warn!("AID {} does not fit in the routing table", entry.aid);
            plan.not_routed.push(entry.aid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aid::AidGroup;
    use crate::aid_cache::tests::service;
    use crate::config::Config;
    use crate::controller::tests::RecordingDriver;
    use crate::controller::ControllerCommand;
    use crate::preferred::Preferences;
    use crate::service::{ComponentName, SecureElement, ServiceInfo};
    use std::sync::Arc;

    fn capabilities(prefix: bool, size: usize) -> ControllerCapabilities {
        ControllerCapabilities {
            supports_prefix: prefix,
            supports_subset: false,
            max_routing_table_size: size,
        }
    }

    fn off_host(package: &str, se: SecureElement, aids: &[&str]) -> Arc<ServiceInfo> {
        Arc::new(
            ServiceInfo::off_host(ComponentName::new(package, format!("{}.Se", package)), 1, 0, se)
                .with_group(AidGroup::parse(Category::Other, aids).unwrap()),
        )
    }

    fn resolve(
        caps: ControllerCapabilities,
        services: Vec<Arc<ServiceInfo>>,
        prefs: &Preferences,
    ) -> AidCache {
        let mut cache = AidCache::new(caps, prefs.clone());
        cache.rebuild(0, services, prefs);
        cache
    }

    fn aid(s: &str) -> Aid {
        s.parse().unwrap()
    }

    fn bytes(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn routes_follow_default_service() {
        let caps = capabilities(false, 512);
        let services = vec![
            service("com.host", Category::Other, &["F053414950454D"]),
            off_host("com.se", SecureElement::Ese(1), &["A000000151000000"]),
            service("com.a", Category::Other, &["F00102030405"]),
            service("com.b", Category::Other, &["F00102030405"]),
        ];
        let cache = resolve(caps, services, &Preferences::new(true, false));
        let options = RoutingOptions::new(&Config::default());
        let plan = RoutingTableBuilder::new(caps).build(&cache, &options).unwrap();

        let host = &plan.entries[&aid("F053414950454D")];
        assert!(host.on_host);
        assert_eq!(host.route, Route::HOST);
        let se = &plan.entries[&aid("A000000151000000")];
        assert!(!se.on_host);
        assert_eq!(se.route, Route(0x86));
        let conflict = &plan.entries[&aid("F00102030405")];
        assert_eq!(conflict.route, options.default_route());
        for entry in plan.entries.values() {
            assert_eq!(entry.on_host, entry.route == Route::HOST);
        }
        assert_eq!(plan.size(), 4 + 11 + 12 + 10);
        assert!(plan.not_routed.is_empty());
    }

    #[test]
    fn collapses_same_route_group_when_over_capacity() {
        let caps = capabilities(true, 4 + 11 + 11);
        let services = vec![
            service("com.host", Category::Other, &["F0010203040501", "F0010203040502", "F0010203040503"]),
            off_host("com.se", SecureElement::Ese(1), &["A000000151000000"]),
        ];
        let cache = resolve(caps, services, &Preferences::new(true, false));
        let options = RoutingOptions::new(&Config::default());
        let plan = RoutingTableBuilder::new(caps).build(&cache, &options).unwrap();

        assert!(plan.size() <= caps.max_routing_table_size);
        let collapsed = &plan.entries[&aid("F001020304*")];
        assert_eq!(collapsed.route, Route::HOST);
        for selected in ["F0010203040501", "F0010203040502", "F0010203040503"] {
            assert_eq!(plan.route_of(&bytes(selected)), Route::HOST);
        }
        assert_eq!(plan.route_of(&bytes("A000000151000000")), Route(0x86));
        assert!(plan.not_routed.is_empty());
    }

    #[test]
    fn collapse_rejected_when_other_route_is_covered() {
        let caps = capabilities(true, 4 + 11 + 11 + 11);
        let services = vec![
            service("com.host", Category::Other, &["F0010203040501", "F0010203040502"]),
            off_host("com.se", SecureElement::Ese(1), &["F0010203040503"]),
        ];
        let cache = resolve(caps, services, &Preferences::new(true, false));
        let mut config = Config::default();
        config.default_route = Route(0x81);
        let options = RoutingOptions::new(&config);
        let plan = RoutingTableBuilder::new(capabilities(true, 4 + 11 + 11)).build(&cache, &options).unwrap();

        assert!(!plan.entries.keys().any(|aid| aid.is_prefix()));
        assert_eq!(plan.route_of(&bytes("F0010203040503")), Route(0x86));
        assert_eq!(plan.route_of(&bytes("F0010203040501")), Route::HOST);
    }

    #[test]
    fn equal_savings_prefer_default_off_host_route() {
        let caps = capabilities(true, 4 + 11 + 11 + 11);
        let services = vec![
            service("com.host", Category::Other, &["F0010203040501", "F0010203040502"]),
            off_host("com.se", SecureElement::Ese(1), &["A0010203040501", "A0010203040502"]),
        ];
        let cache = resolve(caps, services, &Preferences::new(true, false));
        let mut config = Config::default();
        config.default_route = Route(0x81);
        config.default_off_host_route = Route(0x86);
        let options = RoutingOptions::new(&config);
        let plan = RoutingTableBuilder::new(caps).build(&cache, &options).unwrap();

        assert!(plan.entries.contains_key(&aid("A001020304*")));
        assert!(!plan.entries.contains_key(&aid("F001020304*")));
        assert!(plan.size() <= caps.max_routing_table_size);
    }

    #[test]
    fn largest_group_moves_to_default_route() {
        let caps = capabilities(false, 4 + 11);
        let services = vec![
            service("com.host", Category::Other, &["F0010203040501", "F0010203040502", "F0010203040503"]),
            off_host("com.se", SecureElement::Ese(1), &["A0010203040501"]),
        ];
        let cache = resolve(caps, services, &Preferences::new(true, false));
        let mut config = Config::default();
        config.default_route = Route(0x86);
        let options = RoutingOptions::new(&config);
        let plan = RoutingTableBuilder::new(caps).build(&cache, &options).unwrap();

        assert_eq!(plan.default_routes.default_route, Route::HOST);
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.route_of(&bytes("F0010203040502")), Route::HOST);
        assert_eq!(plan.route_of(&bytes("A0010203040501")), Route(0x86));
    }

    #[test]
    fn truncation_keeps_preferred_landing() {
        let caps = capabilities(false, 4 + 11);
        let mut prefs = Preferences::new(true, false);
        prefs.set_wallet_holder(0, Some("com.wallet".to_string()));
        let wallet = Arc::new(
            ServiceInfo::off_host(
                ComponentName::new("com.wallet", "com.wallet.Se"),
                1,
                0,
                SecureElement::Sim(1),
            )
            .with_group(AidGroup::parse(Category::Payment, &["A0000000041010"]).unwrap()),
        );
        let services = vec![
            service("com.host", Category::Other, &["F0010203040501"]),
            off_host("com.se", SecureElement::Ese(1), &["A0010203040501"]),
            wallet,
        ];
        let cache = resolve(caps, services, &prefs);
        let options = RoutingOptions::new(&Config::default());
        let plan = RoutingTableBuilder::new(caps).build(&cache, &options).unwrap();

        assert!(plan.entries[&aid("A0000000041010")].preferred);
        assert_eq!(plan.not_routed, vec![aid("A0010203040501")]);
        assert_eq!(plan.route_of(&bytes("F0010203040501")), Route::HOST);
    }

    #[test]
    fn rejects_capacity_below_default_entry() {
        let caps = capabilities(false, 2);
        let cache = resolve(caps, vec![], &Preferences::new(true, false));
        let options = RoutingOptions::new(&Config::default());
        assert!(matches!(
            RoutingTableBuilder::new(caps).build(&cache, &options),
            Err(Error::RebuildFailed(_))
        ));
    }

    #[test]
    fn encodes_nci_tlvs() {
        let caps = capabilities(true, 512);
        let services = vec![service("com.host", Category::Other, &["F00102030405*"])];
        let cache = resolve(caps, services, &Preferences::new(true, false));
        let options = RoutingOptions::new(&Config::default());
        let plan = RoutingTableBuilder::new(caps).build(&cache, &options).unwrap();
        let power = PowerState::SWITCH_ON | PowerState::SCREEN_ON_LOCKED;
        assert_eq!(
            plan.encode(),
            vec![
                0x12, 8, 0x00, power.bits(), 0xf0, 0x01, 0x02, 0x03, 0x04, 0x05,
                0x02, 2, 0x00, 0x39
            ]
        );
    }

    #[tokio::test]
    async fn commit_skips_unchanged_and_restores_on_rejection() {
        let caps = capabilities(false, 512);
        let driver = RecordingDriver::new(caps);
        let options = RoutingOptions::new(&Config::default());
        let prefs = Preferences::new(true, false);
        let mut builder = RoutingTableBuilder::new(caps);

        let first = resolve(caps, vec![service("com.a", Category::Other, &["F0010203040501"])], &prefs);
        let plan = builder.build(&first, &options).unwrap();
        assert!(builder.commit(&driver, &plan, false).await.unwrap());
        assert!(!builder.commit(&driver, &plan, false).await.unwrap());
        assert!(builder.commit(&driver, &plan, true).await.unwrap());
        assert_eq!(driver.count(|c| *c == ControllerCommand::CommitRouting), 2);

        let second = resolve(caps, vec![service("com.b", Category::Other, &["F0010203040502"])], &prefs);
        let next = builder.build(&second, &options).unwrap();
        *driver.reject_routing.lock().unwrap() = true;
        assert!(matches!(
            builder.commit(&driver, &next, false).await,
            Err(Error::RoutingRejected(_))
        ));
        assert_eq!(builder.committed(), Some(&plan));
        let submitted = driver.routing.lock().unwrap();
        assert_eq!(submitted.last(), Some(&plan.entries));
    }
}
