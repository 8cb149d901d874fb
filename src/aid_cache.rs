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

//! AID resolver.
//!
//! For every AID declared by a visible service the cache elects a default
//! service, in order:
//!
//!  1. the foreground preferred service, if it declares the AID,
//!  2. the first wallet role service declaring the AID: services of the
//!     wallet holder package, and services sharing the role priority for
//!     AIDs the holder also declares,
//!  3. the payment default, for payment AIDs, when no wallet holder is set,
//!  4. the only candidate, if there is exactly one.
//!
//! With NFC disabled only step 1 applies. Otherwise the AID is left without
//! a default and routed through the controller default route.

use crate::aid::{Aid, Category};
use crate::controller::ControllerCapabilities;
use crate::preferred::{PreferredService, PreferredSource, Preferences};
use crate::service::{ComponentName, ServiceInfo, UserId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// How the default service of an AID was chosen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ResolveReason {
    Foreground,
    Wallet,
    PaymentDefault,
    SingleCandidate,
    Unresolved,
}

impl fmt::Display for ResolveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolveReason::Foreground => "foreground",
            ResolveReason::Wallet => "wallet",
            ResolveReason::PaymentDefault => "payment_default",
            ResolveReason::SingleCandidate => "single_candidate",
            ResolveReason::Unresolved => "unresolved",
        })
    }
}

/// Resolution of a single AID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AidResolveInfo {
    pub default_service: Option<Arc<ServiceInfo>>,
    /// Every qualifying candidate, the default included.
    pub services: Vec<Arc<ServiceInfo>>,
    pub category: Option<Category>,
    pub reason: ResolveReason,
}

impl AidResolveInfo {
    pub fn unresolved() -> Self {
        AidResolveInfo {
            default_service: None,
            services: vec![],
            category: None,
            reason: ResolveReason::Unresolved,
        }
    }

    pub fn default_component(&self) -> Option<&ComponentName> {
        self.default_service.as_ref().map(|s| &s.component)
    }

    /// Several candidates and no tiebreaker.
    pub fn is_conflict(&self) -> bool {
        self.default_service.is_none() && self.services.len() > 1
    }
}

#[derive(Clone)]
struct Candidate {
    service: Arc<ServiceInfo>,
    category: Category,
}

/// The resolver state: last service snapshot, preference inputs and the
/// resolved entries.
pub struct AidCache {
    capabilities: ControllerCapabilities,
    user_id: UserId,
    services: Vec<Arc<ServiceInfo>>,
    preferences: Preferences,
    preferred: PreferredService,
    entries: BTreeMap<Aid, AidResolveInfo>,
}

impl AidCache {
    pub fn new(capabilities: ControllerCapabilities, preferences: Preferences) -> Self {
        AidCache {
            capabilities,
            user_id: 0,
            services: vec![],
            preferences,
            preferred: PreferredService::none(0),
            entries: BTreeMap::new(),
        }
    }

    pub fn capabilities(&self) -> ControllerCapabilities {
        self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: ControllerCapabilities) {
        self.capabilities = capabilities;
    }

    pub fn supports_aid_prefix_registration(&self) -> bool {
        self.capabilities.supports_prefix
    }

    pub fn supports_aid_subset_registration(&self) -> bool {
        self.capabilities.supports_prefix && self.capabilities.supports_subset
    }

    /// The AID as the controller can route it. Prefix and subset AIDs are
    /// matched literally when the controller lacks the feature.
    pub fn effective_aid(&self, aid: &Aid) -> Aid {
        if (aid.is_prefix() && !self.supports_aid_prefix_registration())
            || (aid.is_subset() && !self.supports_aid_subset_registration())
        {
            aid.to_exact()
        } else {
            aid.clone()
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn services(&self) -> &[Arc<ServiceInfo>] {
        &self.services
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn preferred_service(&self) -> &PreferredService {
        &self.preferred
    }

    pub fn entries(&self) -> &BTreeMap<Aid, AidResolveInfo> {
        &self.entries
    }

    /// Recompute every resolution from a new snapshot. The previous
    /// entries are replaced as a whole.
    pub fn rebuild(
        &mut self,
        user_id: UserId,
        services: Vec<Arc<ServiceInfo>>,
        preferences: &Preferences,
    ) {
        log::debug!("+ rebuild({}, {} services)", user_id, services.len());
        self.user_id = user_id;
        self.preferences = preferences.clone();
        self.preferred = preferences.elect(user_id, &services);
        self.services = services;

        let this = &*self;
        let keys: BTreeSet<Aid> = this
            .services
            .iter()
            .flat_map(|s| s.aids().into_iter().map(move |(aid, _)| this.effective_aid(aid)))
            .collect();
        let mut entries = BTreeMap::new();
        for key in keys {
            let candidates = self.candidates(&key);
            if candidates.is_empty() {
                continue;
            }
            entries.insert(key, self.elect(candidates));
        }
        log::debug!(" > {} AIDs resolved, preferred {:?}", entries.len(), self.preferred);
        self.entries = entries;
    }

    /// Services with a registration intersecting `key`, in service order.
    fn candidates(&self, key: &Aid) -> Vec<Candidate> {
        self.services
            .iter()
            .filter_map(|service| {
                service
                    .aids()
                    .into_iter()
                    .filter(|(_, category)| {
                        *category == Category::Payment || service.other_category_enabled
                    })
                    .find(|(aid, _)| self.effective_aid(aid).intersects(key))
                    .map(|(_, category)| Candidate { service: service.clone(), category })
            })
            .collect()
    }

    fn is_wallet_service(&self, service: &ServiceInfo, holder_declares: bool) -> bool {
        match self.preferences.wallet_holder(self.user_id) {
            Some(holder) => {
                service.package() == holder
                    || (holder_declares
                        && self.preferences.associated_role_services
                        && service.shares_role_priority())
            }
            None => false,
        }
    }

    fn elect(&self, candidates: Vec<Candidate>) -> AidResolveInfo {
        let services: Vec<Arc<ServiceInfo>> =
            candidates.iter().map(|c| c.service.clone()).collect();
        let resolved = |candidate: &Candidate, reason| AidResolveInfo {
            default_service: Some(candidate.service.clone()),
            services: services.clone(),
            category: Some(candidate.category),
            reason,
        };
        let prefs = &self.preferences;

        if let Some(foreground) = prefs.foreground_for(self.user_id) {
            if let Some(c) = candidates.iter().find(|c| &c.service.component == foreground) {
                return resolved(c, ResolveReason::Foreground);
            }
        }
        if prefs.nfc_enabled {
            if prefs.wallet_applies(self.user_id) {
                let holder_declares = candidates.iter().any(|c| self.is_wallet_service(&c.service, false));
                if let Some(c) =
                    candidates.iter().find(|c| self.is_wallet_service(&c.service, holder_declares))
                {
                    return resolved(c, ResolveReason::Wallet);
                }
            }
            if prefs.payment_default_applies(self.user_id) {
                if let Some(default) = prefs.payment_default(self.user_id) {
                    if let Some(c) = candidates.iter().find(|c| {
                        &c.service.component == default && c.category == Category::Payment
                    }) {
                        return resolved(c, ResolveReason::PaymentDefault);
                    }
                }
            }
            if let [only] = candidates.as_slice() {
                return resolved(only, ResolveReason::SingleCandidate);
            }
        }

        let payment = candidates.iter().filter(|c| c.category == Category::Payment).count();
        let category = if payment * 2 >= candidates.len() {
            Category::Payment
        } else {
            Category::Other
        };
        AidResolveInfo {
            default_service: None,
            services,
            category: Some(category),
            reason: ResolveReason::Unresolved,
        }
    }

    /// Resolve the AID named by a SELECT command. A registered exact entry
    /// is returned as is; otherwise the election runs over the prefix and
    /// subset registrations matching the selected bytes.
    pub fn resolve(&self, selected: &[u8]) -> AidResolveInfo {
        let Ok(aid) = Aid::exact(selected) else {
            return AidResolveInfo::unresolved();
        };
        if let Some(info) = self.entries.get(&aid) {
            return info.clone();
        }
        let candidates = self.candidates(&aid);
        if candidates.is_empty() {
            return AidResolveInfo::unresolved();
        }
        self.elect(candidates)
    }

    /// Resolve a registered AID, matching rule included.
    pub fn resolve_aid(&self, aid: &Aid) -> AidResolveInfo {
        match self.entries.get(&self.effective_aid(aid)) {
            Some(info) => info.clone(),
            None if aid.is_exact() => self.resolve(aid.as_bytes()),
            None => AidResolveInfo::unresolved(),
        }
    }

    pub fn is_default_service_for_aid(&self, component: &ComponentName, aid: &Aid) -> bool {
        self.resolve_aid(aid).default_component() == Some(component)
    }

    /// Whether `component` is the default service of the payment category.
    /// There is no default for the other category.
    pub fn is_default_service_for_category(
        &self,
        component: &ComponentName,
        category: Category,
    ) -> bool {
        if category != Category::Payment {
            return false;
        }
        match self.preferences.wallet_holder(self.user_id) {
            Some(holder) => {
                component.package == holder
                    && self
                        .services
                        .iter()
                        .any(|s| &s.component == component && s.has_category(Category::Payment))
            }
            None => self.preferences.payment_default(self.user_id) == Some(component),
        }
    }

    pub fn registered_aid_category(&self, aid: &Aid) -> Option<Category> {
        self.resolve_aid(aid).category
    }

    pub fn requires_screen_on_service_exists(&self) -> bool {
        self.services.iter().any(|s| s.requires_screen_on)
    }

    pub fn is_preferred_service_package_name_for_user(&self, package: &str, user_id: UserId) -> bool {
        self.preferences.is_preferred_package(package, user_id)
    }

    pub fn package_has_preferred_service(&self, package: &str) -> bool {
        self.preferred.component.as_ref().map_or(false, |c| c.package == package)
    }

    /// Pick the service receiving a polling frame matched by several
    /// services: foreground first, then wallet role services, then the
    /// first match.
    pub fn resolve_polling_loop_conflict(
        &self,
        candidates: &[Arc<ServiceInfo>],
    ) -> Option<Arc<ServiceInfo>> {
        if let Some(foreground) = self.preferences.foreground_for(self.user_id) {
            if let Some(s) = candidates.iter().find(|s| &s.component == foreground) {
                return Some(s.clone());
            }
        }
        if self.preferences.wallet_applies(self.user_id) {
            if let Some(s) = candidates.iter().find(|s| self.is_wallet_service(s, true)) {
                return Some(s.clone());
            }
        }
        candidates.first().cloned()
    }

    /// The preferred service, when it is a host service with payment AIDs.
    /// Pre-bound by the host emulation engine.
    pub fn preferred_payment_service(&self) -> Option<Arc<ServiceInfo>> {
        if self.preferred.source == PreferredSource::None {
            return None;
        }
        let component = self.preferred.component.as_ref()?;
        self.services
            .iter()
            .find(|s| &s.component == component && s.on_host && s.has_category(Category::Payment))
            .cloned()
    }

    /// Services of the current snapshot with at least one group of the
    /// given category.
    pub fn services_for_category(&self, category: Category) -> Vec<Arc<ServiceInfo>> {
        self.services.iter().filter(|s| s.has_category(category)).cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::aid::AidGroup;
    use crate::preferred::ForegroundPreference;

    pub const PAYMENT_AID_1: &str = "A000000004101012";
    pub const NON_PAYMENT_AID_1: &str = "F053414950454D";

    pub fn service(package: &str, category: Category, aids: &[&str]) -> Arc<ServiceInfo> {
        Arc::new(
            ServiceInfo::new(ComponentName::new(package, format!("{}.Service", package)), 10000, 0)
                .with_group(AidGroup::parse(category, aids).unwrap()),
        )
    }

    fn component(package: &str) -> ComponentName {
        ComponentName::new(package, format!("{}.Service", package))
    }

    fn aid(s: &str) -> Aid {
        s.parse().unwrap()
    }

    fn cache(
        capabilities: ControllerCapabilities,
        services: Vec<Arc<ServiceInfo>>,
        prefs: &Preferences,
    ) -> AidCache {
        let mut cache = AidCache::new(capabilities, prefs.clone());
        cache.rebuild(0, services, prefs);
        cache
    }

    fn wallet_prefs() -> Preferences {
        let mut prefs = Preferences::new(true, false);
        prefs.set_wallet_holder(0, Some("com.wallet".to_string()));
        prefs
    }

    #[test]
    fn wallet_wins_over_alternate() {
        let services = vec![
            service("com.alternate", Category::Payment, &[PAYMENT_AID_1]),
            service("com.wallet", Category::Payment, &[PAYMENT_AID_1]),
        ];
        let cache = cache(Default::default(), services, &wallet_prefs());
        let info = cache.resolve_aid(&aid(PAYMENT_AID_1));
        assert_eq!(info.default_component(), Some(&component("com.wallet")));
        assert_eq!(info.services.len(), 2);
        assert_eq!(info.category, Some(Category::Payment));
        assert_eq!(info.reason, ResolveReason::Wallet);
    }

    #[test]
    fn foreground_beats_wallet_even_with_nfc_disabled() {
        let services = vec![
            service("com.foreground", Category::Payment, &[PAYMENT_AID_1]),
            service("com.wallet", Category::Payment, &[PAYMENT_AID_1]),
        ];
        let mut prefs = wallet_prefs();
        prefs.foreground = Some(ForegroundPreference {
            component: component("com.foreground"),
            uid: 10000,
            user_id: 0,
        });
        let cache_on = cache(Default::default(), services.clone(), &prefs);
        let info = cache_on.resolve_aid(&aid(PAYMENT_AID_1));
        assert_eq!(info.default_component(), Some(&component("com.foreground")));
        assert_eq!(info.reason, ResolveReason::Foreground);

        prefs.nfc_enabled = false;
        let cache_off = cache(Default::default(), services, &prefs);
        let info = cache_off.resolve_aid(&aid(PAYMENT_AID_1));
        assert_eq!(info.default_component(), Some(&component("com.foreground")));
    }

    #[test]
    fn nfc_disabled_clamps_to_foreground() {
        let services = vec![service("com.only", Category::Other, &[NON_PAYMENT_AID_1])];
        let mut prefs = wallet_prefs();
        prefs.nfc_enabled = false;
        let cache = cache(Default::default(), services, &prefs);
        let info = cache.resolve_aid(&aid(NON_PAYMENT_AID_1));
        assert!(info.default_service.is_none());
        assert_eq!(info.services.len(), 1);
        assert_eq!(info.reason, ResolveReason::Unresolved);
    }

    #[test]
    fn single_candidate_fallback() {
        let services = vec![service("com.only", Category::Other, &[NON_PAYMENT_AID_1])];
        let cache = cache(Default::default(), services, &wallet_prefs());
        let info = cache.resolve_aid(&aid(NON_PAYMENT_AID_1));
        assert_eq!(info.default_component(), Some(&component("com.only")));
        assert_eq!(info.services.len(), 1);
        assert_eq!(info.reason, ResolveReason::SingleCandidate);
        assert_eq!(info.category, Some(Category::Other));
    }

    #[test]
    fn other_category_disabled_has_no_candidates() {
        let mut disabled = ServiceInfo::new(component("com.opted.out"), 10000, 0)
            .with_group(AidGroup::parse(Category::Other, &[NON_PAYMENT_AID_1]).unwrap());
        disabled.other_category_enabled = false;
        let cache = cache(Default::default(), vec![Arc::new(disabled)], &wallet_prefs());
        let info = cache.resolve_aid(&aid(NON_PAYMENT_AID_1));
        assert!(info.services.is_empty());
        assert!(info.default_service.is_none());
        assert_eq!(info.reason, ResolveReason::Unresolved);
    }

    #[test]
    fn two_wallet_services_first_wins() {
        let first = Arc::new(
            ServiceInfo::new(ComponentName::new("com.wallet", "com.wallet.A"), 10000, 0)
                .with_group(AidGroup::parse(Category::Payment, &[PAYMENT_AID_1]).unwrap()),
        );
        let second = Arc::new(
            ServiceInfo::new(ComponentName::new("com.wallet", "com.wallet.B"), 10000, 0)
                .with_group(AidGroup::parse(Category::Payment, &[PAYMENT_AID_1]).unwrap()),
        );
        let cache = cache(Default::default(), vec![first, second], &wallet_prefs());
        let info = cache.resolve_aid(&aid(PAYMENT_AID_1));
        assert_eq!(info.default_component(), Some(&ComponentName::new("com.wallet", "com.wallet.A")));
    }

    #[test]
    fn associated_service_shares_wallet_priority() {
        let mut associated = ServiceInfo::new(component("com.associated"), 10000, 0)
            .with_group(AidGroup::parse(Category::Payment, &[PAYMENT_AID_1, "A000000003101001"]).unwrap());
        associated.share_role_priority = true;
        associated.package_allows_shared_role_priority = true;
        let services = vec![
            Arc::new(associated),
            service("com.other", Category::Payment, &["A000000003101001"]),
            service("com.wallet", Category::Payment, &[PAYMENT_AID_1]),
        ];
        let mut prefs = wallet_prefs();
        prefs.associated_role_services = true;
        let cache = cache(Default::default(), services, &prefs);

        let shared = cache.resolve_aid(&aid(PAYMENT_AID_1));
        assert_eq!(shared.default_component(), Some(&component("com.associated")));
        assert_eq!(shared.reason, ResolveReason::Wallet);
        let not_shared = cache.resolve_aid(&aid("A000000003101001"));
        assert!(not_shared.is_conflict());
    }

    #[test]
    fn payment_default_applies_without_wallet() {
        let services = vec![
            service("com.a", Category::Payment, &[PAYMENT_AID_1]),
            service("com.b", Category::Payment, &[PAYMENT_AID_1]),
            service("com.c", Category::Other, &[PAYMENT_AID_1]),
        ];
        let mut prefs = Preferences::new(false, false);
        prefs.set_payment_default(0, Some(component("com.b")));
        let cache = cache(Default::default(), services, &prefs);
        let info = cache.resolve_aid(&aid(PAYMENT_AID_1));
        assert_eq!(info.default_component(), Some(&component("com.b")));
        assert_eq!(info.reason, ResolveReason::PaymentDefault);
        assert_eq!(info.services.len(), 3);
        assert!(cache.is_default_service_for_category(&component("com.b"), Category::Payment));
        assert!(!cache.is_default_service_for_category(&component("com.b"), Category::Other));
    }

    #[test]
    fn conflict_uses_majority_category() {
        let services = vec![
            service("com.a", Category::Other, &[NON_PAYMENT_AID_1]),
            service("com.b", Category::Other, &[NON_PAYMENT_AID_1]),
            service("com.c", Category::Payment, &[NON_PAYMENT_AID_1]),
        ];
        let cache = cache(Default::default(), services, &Preferences::new(true, false));
        let info = cache.resolve_aid(&aid(NON_PAYMENT_AID_1));
        assert!(info.is_conflict());
        assert_eq!(info.category, Some(Category::Other));
        assert_eq!(cache.registered_aid_category(&aid(NON_PAYMENT_AID_1)), Some(Category::Other));
    }

    #[test]
    fn prefix_expansion_requires_controller_support() {
        let services = vec![
            service("com.prefix", Category::Other, &["F00102030405*"]),
            service("com.exact", Category::Other, &["F0010203040506"]),
        ];
        let prefs = Preferences::new(true, false);
        let with_prefix = cache(
            ControllerCapabilities { supports_prefix: true, ..Default::default() },
            services.clone(),
            &prefs,
        );
        assert!(with_prefix.resolve_aid(&aid("F0010203040506")).is_conflict());
        let selected = with_prefix.resolve(&[0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x99]);
        assert_eq!(selected.services.len(), 1);
        assert_eq!(selected.default_component(), Some(&component("com.prefix")));

        let without = cache(Default::default(), services, &prefs);
        let exact = without.resolve_aid(&aid("F0010203040506"));
        assert_eq!(exact.default_component(), Some(&component("com.exact")));
        assert!(without.resolve(&[0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x99]).services.is_empty());
        assert!(without.entries().contains_key(&aid("F00102030405")));
    }

    #[test]
    fn unknown_aid_is_unresolved() {
        let cache = cache(Default::default(), vec![], &Preferences::new(true, false));
        assert_eq!(cache.resolve(&[0xa0, 0x00]), AidResolveInfo::unresolved());
        assert!(!cache.requires_screen_on_service_exists());
    }

    #[test]
    fn polling_loop_conflict_order() {
        let services = vec![
            service("com.a", Category::Other, &[NON_PAYMENT_AID_1]),
            service("com.wallet", Category::Payment, &[PAYMENT_AID_1]),
        ];
        let cache = cache(Default::default(), services.clone(), &wallet_prefs());
        let chosen = cache.resolve_polling_loop_conflict(&services).unwrap();
        assert_eq!(chosen.component, component("com.wallet"));
        assert_eq!(
            cache.preferred_payment_service().map(|s| s.component.clone()),
            Some(component("com.wallet"))
        );
        assert!(cache.package_has_preferred_service("com.wallet"));
    }
}
