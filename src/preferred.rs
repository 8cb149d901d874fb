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

//! Preference inputs and election of the preferred service.

use crate::aid::Category;
use crate::service::{ComponentName, ServiceInfo, Uid, UserId};
use std::collections::HashMap;
use std::sync::Arc;

/// How the preferred service was chosen, strongest first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PreferredSource {
    Foreground,
    Wallet,
    PaymentDefault,
    None,
}

/// The single service preferred for card emulation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreferredService {
    pub component: Option<ComponentName>,
    pub user_id: UserId,
    pub source: PreferredSource,
}

impl PreferredService {
    pub fn none(user_id: UserId) -> Self {
        PreferredService { component: None, user_id, source: PreferredSource::None }
    }

    pub fn is(&self, component: &ComponentName) -> bool {
        self.component.as_ref() == Some(component)
    }
}

/// Service set as preferred by an application in the foreground.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForegroundPreference {
    pub component: ComponentName,
    pub uid: Uid,
    pub user_id: UserId,
}

/// Observer inputs the election is computed from.
#[derive(Clone, Debug)]
pub struct Preferences {
    pub foreground: Option<ForegroundPreference>,
    pub wallet_holders: HashMap<UserId, String>,
    pub payment_defaults: HashMap<UserId, ComponentName>,
    pub wallet_role_enabled: bool,
    pub associated_role_services: bool,
    pub nfc_enabled: bool,
}

impl Preferences {
    pub fn new(wallet_role_enabled: bool, associated_role_services: bool) -> Self {
        Preferences {
            foreground: None,
            wallet_holders: HashMap::new(),
            payment_defaults: HashMap::new(),
            wallet_role_enabled,
            associated_role_services,
            nfc_enabled: true,
        }
    }

    pub fn wallet_holder(&self, user_id: UserId) -> Option<&str> {
        if !self.wallet_role_enabled {
            return None;
        }
        self.wallet_holders.get(&user_id).map(String::as_str)
    }

    pub fn payment_default(&self, user_id: UserId) -> Option<&ComponentName> {
        self.payment_defaults.get(&user_id)
    }

    pub fn set_wallet_holder(&mut self, user_id: UserId, package: Option<String>) {
        match package {
            Some(package) => self.wallet_holders.insert(user_id, package),
            None => self.wallet_holders.remove(&user_id),
        };
    }

    pub fn set_payment_default(&mut self, user_id: UserId, component: Option<ComponentName>) {
        match component {
            Some(component) => self.payment_defaults.insert(user_id, component),
            None => self.payment_defaults.remove(&user_id),
        };
    }

    /// Foreground preference of a user, if any.
    pub fn foreground_for(&self, user_id: UserId) -> Option<&ComponentName> {
        self.foreground.as_ref().filter(|f| f.user_id == user_id).map(|f| &f.component)
    }

    /// Remove the foreground preference installed by `uid`. Returns true if
    /// one was removed.
    pub fn clear_foreground(&mut self, uid: Uid) -> bool {
        match &self.foreground {
            Some(foreground) if foreground.uid == uid => {
                self.foreground = None;
                true
            }
            _ => false,
        }
    }

    /// Whether the wallet holder priority applies to a user.
    pub fn wallet_applies(&self, user_id: UserId) -> bool {
        self.nfc_enabled && self.wallet_holder(user_id).is_some()
    }

    /// Whether the payment default applies to a user.
    pub fn payment_default_applies(&self, user_id: UserId) -> bool {
        self.nfc_enabled && self.wallet_holder(user_id).is_none()
    }

    /// Elect the preferred service among the visible services. Foreground
    /// beats wallet beats payment default; with NFC disabled only the
    /// foreground preference qualifies.
    pub fn elect(&self, user_id: UserId, services: &[Arc<ServiceInfo>]) -> PreferredService {
        let exists = |component: &ComponentName| services.iter().any(|s| &s.component == component);

        if let Some(component) = self.foreground_for(user_id).filter(|c| exists(*c)) {
            return PreferredService {
                component: Some(component.clone()),
                user_id,
                source: PreferredSource::Foreground,
            };
        }
        if !self.nfc_enabled {
            return PreferredService::none(user_id);
        }
        if let Some(holder) = self.wallet_holder(user_id) {
            let in_holder = move || services.iter().filter(move |s| s.package() == holder);
            let component = in_holder()
                .find(|s| s.has_category(Category::Payment))
                .or_else(|| in_holder().next())
                .map(|s| s.component.clone());
            return PreferredService { component, user_id, source: PreferredSource::Wallet };
        }
        if let Some(component) = self.payment_default(user_id).filter(|c| exists(*c)) {
            return PreferredService {
                component: Some(component.clone()),
                user_id,
                source: PreferredSource::PaymentDefault,
            };
        }
        PreferredService::none(user_id)
    }

    /// Return true if `package` holds any preference for the user.
    pub fn is_preferred_package(&self, package: &str, user_id: UserId) -> bool {
        self.foreground_for(user_id).map_or(false, |c| c.package == package)
            || self.wallet_holder(user_id) == Some(package)
            || (self.wallet_holder(user_id).is_none()
                && self.payment_default(user_id).map_or(false, |c| c.package == package))
    }
}
