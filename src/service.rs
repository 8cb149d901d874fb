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

//! Card emulation service descriptors.

use crate::aid::{Aid, AidGroup, Category};
use crate::error::{Error, Result};
use crate::polling_loop::{PollingFrame, PollingLoopFilter, PollingLoopPattern};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a device user or profile.
pub type UserId = i32;
/// Identifier of the application owning a service.
pub type Uid = u32;

/// Identity of a service inside its package.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        ComponentName { package: package.into(), class: class.into() }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

impl FromStr for ComponentName {
    type Err = Error;

    /// Parse `package/class`. A class starting with `.` is relative to the
    /// package.
    fn from_str(s: &str) -> Result<Self> {
        let (package, class) = s
            .split_once('/')
            .filter(|(package, class)| !package.is_empty() && !class.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("invalid component name {:?}", s)))?;
        let class = match class.strip_prefix('.') {
            Some(_) => format!("{}{}", package, class),
            None => class.to_string(),
        };
        Ok(ComponentName::new(package, class))
    }
}

/// Off-host execution environment, numbered from 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SecureElement {
    Ese(u8),
    Sim(u8),
}

impl fmt::Display for SecureElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecureElement::Ese(index) => write!(f, "eSE{}", index),
            SecureElement::Sim(index) => write!(f, "SIM{}", index),
        }
    }
}

impl FromStr for SecureElement {
    type Err = Error;

    /// Parse `eSE` or `SIM`, optionally followed by one or two decimal
    /// digits. A bare name denotes index 1.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("unknown secure element {:?}", s));
        let (digits, build): (&str, fn(u8) -> SecureElement) =
            if let Some(digits) = s.strip_prefix("eSE") {
                (digits, SecureElement::Ese)
            } else if let Some(digits) = s.strip_prefix("SIM") {
                (digits, SecureElement::Sim)
            } else {
                return Err(invalid());
            };
        let index = match digits.len() {
            0 => 1,
            1 | 2 if digits.bytes().all(|b| b.is_ascii_digit()) => {
                digits.parse::<u8>().map_err(|_| invalid())?
            }
            _ => return Err(invalid()),
        };
        if index == 0 {
            return Err(invalid());
        }
        Ok(build(index))
    }
}

/// Declared card emulation service.
///
/// Static fields come from the package manifest. The dynamic fields
/// (`dynamic_groups`, `off_host`, polling loop filters and the observe
/// mode and other-category flags) are edited at runtime by the owning
/// application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub component: ComponentName,
    pub uid: Uid,
    pub user_id: UserId,
    pub on_host: bool,
    pub description: String,
    /// Off-host target declared in the manifest.
    pub static_off_host: Option<SecureElement>,
    /// Off-host target set at runtime, overriding the manifest one.
    pub off_host: Option<SecureElement>,
    pub requires_unlock: bool,
    pub requires_screen_on: bool,
    pub static_groups: Vec<AidGroup>,
    pub dynamic_groups: BTreeMap<Category, AidGroup>,
    pub polling_filters: Vec<PollingLoopFilter>,
    pub polling_patterns: Vec<PollingLoopPattern>,
    pub other_category_enabled: bool,
    pub share_role_priority: bool,
    /// Package level `AllowSharedRolePriority` property.
    pub package_allows_shared_role_priority: bool,
    pub should_default_to_observe_mode: bool,
    /// Pre-installed with the system image.
    pub is_system: bool,
}

impl ServiceInfo {
    /// New on-host service without AID groups.
    pub fn new(component: ComponentName, uid: Uid, user_id: UserId) -> Self {
        ServiceInfo {
            component,
            uid,
            user_id,
            on_host: true,
            description: String::new(),
            static_off_host: None,
            off_host: None,
            requires_unlock: false,
            requires_screen_on: true,
            static_groups: vec![],
            dynamic_groups: BTreeMap::new(),
            polling_filters: vec![],
            polling_patterns: vec![],
            other_category_enabled: true,
            share_role_priority: false,
            package_allows_shared_role_priority: false,
            should_default_to_observe_mode: false,
            is_system: false,
        }
    }

    /// New off-host service routed to `secure_element`.
    pub fn off_host(
        component: ComponentName,
        uid: Uid,
        user_id: UserId,
        secure_element: SecureElement,
    ) -> Self {
        ServiceInfo {
            on_host: false,
            static_off_host: Some(secure_element),
            ..ServiceInfo::new(component, uid, user_id)
        }
    }

    pub fn with_group(mut self, group: AidGroup) -> Self {
        self.static_groups.retain(|g| g.category() != group.category());
        self.static_groups.push(group);
        self
    }

    pub fn package(&self) -> &str {
        &self.component.package
    }

    /// Effective off-host target: runtime value, else manifest value.
    pub fn secure_element(&self) -> Option<SecureElement> {
        if self.on_host {
            None
        } else {
            self.off_host.or(self.static_off_host)
        }
    }

    /// Effective AID groups. A dynamic group replaces the static group of
    /// the same category.
    pub fn aid_groups(&self) -> Vec<&AidGroup> {
        let mut groups: Vec<&AidGroup> = self
            .static_groups
            .iter()
            .filter(|g| !self.dynamic_groups.contains_key(&g.category()))
            .collect();
        groups.extend(self.dynamic_groups.values());
        groups
    }

    /// Every effective AID with the category of its group.
    pub fn aids(&self) -> Vec<(&Aid, Category)> {
        self.aid_groups()
            .into_iter()
            .flat_map(|g| g.aids().iter().map(move |aid| (aid, g.category())))
            .collect()
    }

    pub fn category_for_aid(&self, aid: &Aid) -> Option<Category> {
        self.aid_groups().into_iter().find(|g| g.contains(aid)).map(|g| g.category())
    }

    pub fn has_category(&self, category: Category) -> bool {
        self.aid_groups().iter().any(|g| g.category() == category)
    }

    /// Return true if the AID, with its matching rule, is registered by
    /// this service.
    pub fn declares(&self, aid: &Aid) -> bool {
        self.aids().iter().any(|(registered, _)| *registered == aid)
    }

    /// Match a polling frame against the registered filters, returning the
    /// auto-transact flag of the first matching filter.
    pub fn polling_loop_match(&self, frame: &PollingFrame) -> Option<bool> {
        self.polling_filters
            .iter()
            .find(|f| f.matches(frame))
            .map(|f| f.auto_transact())
            .or_else(|| {
                self.polling_patterns.iter().find(|p| p.matches(frame)).map(|p| p.auto_transact())
            })
    }

    /// Whether this service inherits the wallet holder priority.
    pub fn shares_role_priority(&self) -> bool {
        self.share_role_priority && self.package_allows_shared_role_priority
    }

    /// Drop the runtime edits, keeping only manifest state.
    pub fn reset_dynamic_settings(&mut self) {
        self.dynamic_groups.clear();
        self.off_host = None;
        self.polling_filters.clear();
        self.polling_patterns.clear();
        self.should_default_to_observe_mode = false;
        self.other_category_enabled = true;
    }

    /// Copy the runtime edits of `previous` onto this freshly loaded
    /// descriptor.
    pub fn inherit_dynamic_settings(&mut self, previous: &ServiceInfo) {
        self.dynamic_groups = previous.dynamic_groups.clone();
        self.off_host = previous.off_host;
        self.polling_filters = previous.polling_filters.clone();
        self.polling_patterns = previous.polling_patterns.clone();
        self.should_default_to_observe_mode = previous.should_default_to_observe_mode;
        self.other_category_enabled = previous.other_category_enabled;
    }
}
