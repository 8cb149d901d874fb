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

//! Per-user registry of the declared card emulation services.

use crate::aid::{AidGroup, Category};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::polling_loop::{PollingLoopFilter, PollingLoopPattern};
use crate::service::{ComponentName, SecureElement, ServiceInfo, Uid, UserId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Package environment the registry reads declared services from.
pub trait PackageSource: Send + Sync {
    /// Services declared by the packages installed for a user, with their
    /// manifest state only.
    fn installed_services(&self, user_id: UserId) -> Vec<ServiceInfo>;

    /// Enabled profiles attached to a user, the user itself excluded.
    fn enabled_profiles(&self, user_id: UserId) -> Vec<UserId> {
        let _ = user_id;
        vec![]
    }
}

type UserServices = BTreeMap<ComponentName, Arc<ServiceInfo>>;

#[derive(Default)]
struct Context {
    current_user: UserId,
    users: HashMap<UserId, UserServices>,
}

/// Authoritative collection of the card emulation services of every user.
///
/// Mutations may come from any thread; they are serialized by the context
/// mutex and each successful one posts a `ServicesUpdated` event to the
/// manager loop. The event is sent while the lock is held so that
/// notifications for a user are observed in commit order.
pub struct ServiceRegistry {
    source: Arc<dyn PackageSource>,
    events: mpsc::UnboundedSender<Event>,
    other_category_feature: bool,
    context: Mutex<Context>,
}

impl ServiceRegistry {
    pub fn new(
        source: Arc<dyn PackageSource>,
        events: mpsc::UnboundedSender<Event>,
        other_category_feature: bool,
    ) -> Self {
        ServiceRegistry { source, events, other_category_feature, context: Default::default() }
    }

    fn lock(&self) -> MutexGuard<'_, Context> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, user_id: UserId) {
        if self.events.send(Event::ServicesUpdated { user_id }).is_err() {
            log::warn!("services updated for user {} with no event loop attached", user_id);
        }
    }

    pub fn current_user(&self) -> UserId {
        self.lock().current_user
    }

    /// Services visible to a user, including its enabled profiles, in
    /// component order. Filtered by category when one is given.
    pub fn list(&self, user_id: UserId, category: Option<Category>) -> Vec<Arc<ServiceInfo>> {
        let profiles = self.source.enabled_profiles(user_id);
        let context = self.lock();
        std::iter::once(user_id)
            .chain(profiles)
            .filter_map(|user| context.users.get(&user))
            .flat_map(|services| services.values())
            .filter(|service| category.map_or(true, |c| service.has_category(c)))
            .cloned()
            .collect()
    }

    /// Enabled profiles attached to a user.
    pub fn enabled_profiles(&self, user_id: UserId) -> Vec<UserId> {
        self.source.enabled_profiles(user_id)
    }

    /// Services of one user, profiles excluded.
    pub fn list_for_user(&self, user_id: UserId) -> Vec<Arc<ServiceInfo>> {
        self.lock()
            .users
            .get(&user_id)
            .map(|services| services.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, user_id: UserId, component: &ComponentName) -> bool {
        self.get(user_id, component).is_some()
    }

    pub fn get(&self, user_id: UserId, component: &ComponentName) -> Option<Arc<ServiceInfo>> {
        self.lock().users.get(&user_id).and_then(|services| services.get(component)).cloned()
    }

    /// Apply an owner edit to a service. The closure must validate its
    /// input before mutating the descriptor.
    fn modify<T>(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        edit: impl FnOnce(&mut ServiceInfo) -> Result<T>,
    ) -> Result<T> {
        let mut context = self.lock();
        let service = context
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?
            .get_mut(component)
            .ok_or_else(|| Error::NotFound(format!("service {}", component)))?;
        if service.uid != uid {
            log::error!("uid {} does not own {} (owner uid {})", uid, component, service.uid);
            return Err(Error::PermissionDenied(format!("uid {} does not own {}", uid, component)));
        }
        let result = edit(Arc::make_mut(service))?;
        self.notify(user_id);
        Ok(result)
    }

    /// Register a dynamic AID group, replacing the previous group of the
    /// same category.
    pub fn register_aid_group(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        group: AidGroup,
    ) -> Result<()> {
        log::debug!("+ register_aid_group({}, {}, {})", user_id, component, group.category());
        self.modify(user_id, uid, component, |service| {
            let conflict = service
                .aid_groups()
                .into_iter()
                .filter(|g| g.category() != group.category())
                .flat_map(|g| g.aids())
                .find(|aid| group.contains(aid))
                .cloned();
            if let Some(aid) = conflict {
                return Err(Error::InvalidArgument(format!(
                    "{} is already registered by {} in another category",
                    aid, service.component
                )));
            }
            service.dynamic_groups.insert(group.category(), group);
            Ok(())
        })
    }

    pub fn remove_aid_group(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        category: Category,
    ) -> Result<()> {
        log::debug!("+ remove_aid_group({}, {}, {})", user_id, component, category);
        self.modify(user_id, uid, component, |service| {
            service
                .dynamic_groups
                .remove(&category)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("no {} group registered", category)))
        })
    }

    /// Dynamic AID group registered for a category.
    pub fn aid_group_for_service(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        category: Category,
    ) -> Result<Option<AidGroup>> {
        let service = self
            .get(user_id, component)
            .ok_or_else(|| Error::NotFound(format!("service {}", component)))?;
        if service.uid != uid {
            return Err(Error::PermissionDenied(format!("uid {} does not own {}", uid, component)));
        }
        Ok(service.dynamic_groups.get(&category).cloned())
    }

    /// Set the off-host target of an off-host service.
    pub fn set_off_host_secure_element(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        secure_element: &str,
    ) -> Result<()> {
        log::debug!("+ set_off_host_secure_element({}, {}, {})", user_id, component, secure_element);
        let secure_element = secure_element.parse::<SecureElement>()?;
        self.modify(user_id, uid, component, |service| {
            if service.on_host {
                return Err(Error::InvalidArgument(format!(
                    "{} is an on-host service",
                    service.component
                )));
            }
            service.off_host = Some(secure_element);
            Ok(())
        })
    }

    /// Restore the manifest off-host target.
    pub fn reset_off_host_secure_element(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
    ) -> Result<()> {
        log::debug!("+ reset_off_host_secure_element({}, {})", user_id, component);
        self.modify(user_id, uid, component, |service| {
            if service.on_host || service.off_host.is_none() {
                return Err(Error::InvalidArgument(format!(
                    "{} has no off-host target override",
                    service.component
                )));
            }
            service.off_host = None;
            Ok(())
        })
    }

    pub fn register_polling_loop_filter(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        filter: &str,
        auto_transact: bool,
    ) -> Result<()> {
        log::debug!("+ register_polling_loop_filter({}, {}, {})", user_id, component, filter);
        let filter = PollingLoopFilter::parse(filter, auto_transact)?;
        self.modify(user_id, uid, component, |service| {
            service.polling_filters.retain(|f| f.to_string() != filter.to_string());
            service.polling_filters.push(filter);
            Ok(())
        })
    }

    pub fn remove_polling_loop_filter(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        filter: &str,
    ) -> Result<()> {
        log::debug!("+ remove_polling_loop_filter({}, {}, {})", user_id, component, filter);
        self.modify(user_id, uid, component, |service| {
            let before = service.polling_filters.len();
            service.polling_filters.retain(|f| !f.is_same(filter));
            if service.polling_filters.len() == before {
                return Err(Error::NotFound(format!("polling loop filter {}", filter)));
            }
            Ok(())
        })
    }

    pub fn register_polling_loop_pattern(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        pattern: &str,
        auto_transact: bool,
    ) -> Result<()> {
        log::debug!("+ register_polling_loop_pattern({}, {}, {})", user_id, component, pattern);
        let pattern = PollingLoopPattern::parse(pattern, auto_transact)?;
        self.modify(user_id, uid, component, |service| {
            service.polling_patterns.retain(|p| !p.as_str().eq_ignore_ascii_case(pattern.as_str()));
            service.polling_patterns.push(pattern);
            Ok(())
        })
    }

    pub fn remove_polling_loop_pattern(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        pattern: &str,
    ) -> Result<()> {
        log::debug!("+ remove_polling_loop_pattern({}, {}, {})", user_id, component, pattern);
        self.modify(user_id, uid, component, |service| {
            let before = service.polling_patterns.len();
            service.polling_patterns.retain(|p| !p.as_str().eq_ignore_ascii_case(pattern.trim()));
            if service.polling_patterns.len() == before {
                return Err(Error::NotFound(format!("polling loop pattern {}", pattern)));
            }
            Ok(())
        })
    }

    pub fn set_should_default_to_observe_mode(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        enable: bool,
    ) -> Result<()> {
        log::debug!("+ set_should_default_to_observe_mode({}, {}, {})", user_id, component, enable);
        self.modify(user_id, uid, component, |service| {
            service.should_default_to_observe_mode = enable;
            Ok(())
        })
    }

    pub fn does_service_default_to_observe_mode(
        &self,
        user_id: UserId,
        component: &ComponentName,
    ) -> bool {
        self.get(user_id, component).map_or(false, |s| s.should_default_to_observe_mode)
    }

    /// Opt a service in or out of the other category. Only available when
    /// the platform feature is on.
    pub fn set_other_category_enabled(
        &self,
        user_id: UserId,
        uid: Uid,
        component: &ComponentName,
        enabled: bool,
    ) -> Result<()> {
        log::debug!("+ set_other_category_enabled({}, {}, {})", user_id, component, enabled);
        if !self.other_category_feature {
            return Err(Error::InvalidArgument(
                "other category opt-out is not supported".to_string(),
            ));
        }
        self.modify(user_id, uid, component, |service| {
            service.other_category_enabled = enabled;
            Ok(())
        })
    }

    /// Merge freshly read descriptors into the cached ones. Runtime edits
    /// survive when the owning uid is unchanged.
    fn merge(previous: Option<&Arc<ServiceInfo>>, mut fresh: ServiceInfo) -> Arc<ServiceInfo> {
        match previous {
            Some(previous) if previous.uid == fresh.uid => {
                fresh.inherit_dynamic_settings(previous);
            }
            Some(previous) => {
                log::info!(
                    "{} reinstalled with uid {} (was {}), dropping dynamic settings",
                    fresh.component,
                    fresh.uid,
                    previous.uid
                );
            }
            None => (),
        }
        Arc::new(fresh)
    }

    /// Re-read the installed services of a user and post a full
    /// `ServicesUpdated`. Without `force_reload` a user that is already
    /// loaded keeps its cached services.
    pub fn invalidate(&self, user_id: UserId, force_reload: bool) {
        log::debug!("+ invalidate({}, {})", user_id, force_reload);
        let mut context = self.lock();
        if force_reload || !context.users.contains_key(&user_id) {
            let fresh = self.source.installed_services(user_id);
            let previous = context.users.remove(&user_id).unwrap_or_default();
            let services = fresh
                .into_iter()
                .filter(|service| service.user_id == user_id)
                .map(|service| {
                    let merged = Self::merge(previous.get(&service.component), service);
                    (merged.component.clone(), merged)
                })
                .collect();
            context.users.insert(user_id, services);
        }
        self.notify(user_id);
    }

    /// Reload the services of a single package after it was installed,
    /// updated or removed.
    pub fn on_package_changed(&self, user_id: UserId, package: &str) {
        log::debug!("+ on_package_changed({}, {})", user_id, package);
        let fresh: Vec<ServiceInfo> = self
            .source
            .installed_services(user_id)
            .into_iter()
            .filter(|service| service.package() == package && service.user_id == user_id)
            .collect();
        let mut context = self.lock();
        let services = context.users.entry(user_id).or_default();
        let previous: UserServices = services
            .iter()
            .filter(|(component, _)| component.package == package)
            .map(|(component, service)| (component.clone(), service.clone()))
            .collect();
        services.retain(|component, _| component.package != package);
        for service in fresh {
            let merged = Self::merge(previous.get(&service.component), service);
            services.insert(merged.component.clone(), merged);
        }
        self.notify(user_id);
    }

    pub fn on_user_switched(&self, user_id: UserId) {
        log::info!("+ on_user_switched({})", user_id);
        self.lock().current_user = user_id;
        self.invalidate(user_id, true);
    }

    /// A managed profile was added, removed or toggled: refresh the
    /// current user.
    pub fn on_managed_profile_changed(&self) {
        log::debug!("+ on_managed_profile_changed()");
        let user_id = self.current_user();
        for profile in self.source.enabled_profiles(user_id) {
            self.invalidate(profile, false);
        }
        self.invalidate(user_id, true);
    }
}
