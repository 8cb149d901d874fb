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

//! Card emulation manager.
//!
//! Owns the event loop. Registry notifications, controller events and
//! engine completions are drained in batches; the resolver is rebuilt as
//! soon as a `ServicesUpdated` is seen and the routing plan is pushed once
//! per batch, so a newer rebuild supersedes any older one.

use crate::aid::{Aid, Category};
use crate::aid_cache::{AidCache, AidResolveInfo};
use crate::config::Config;
use crate::controller::{ControllerDriver, ControllerEvent};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::host_emulation::{HostEmulationEngine, HostState, ServiceBinder};
use crate::listeners::ListenerRegistry;
use crate::preferred::{ForegroundPreference, PreferredService, Preferences};
use crate::registry::{PackageSource, ServiceRegistry};
use crate::routing_options::RoutingOptions;
use crate::routing_table::{RoutingPlan, RoutingTableBuilder};
use crate::service::{ComponentName, Uid, UserId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, Mutex};

/// Process environment queried by the manager.
pub trait Environment: Send + Sync {
    fn is_in_foreground(&self, uid: Uid) -> bool;

    /// Report user activity, keeping the screen awake.
    fn user_activity(&self) {}
}

/// Persisted preference storage.
pub trait SettingsStore: Send + Sync {
    fn payment_default(&self, user_id: UserId) -> Option<ComponentName>;
    fn set_payment_default(&self, user_id: UserId, component: Option<ComponentName>);
}

/// In-memory [`SettingsStore`].
#[derive(Default)]
pub struct MemorySettingsStore {
    payment_defaults: std::sync::Mutex<HashMap<UserId, ComponentName>>,
}

impl SettingsStore for MemorySettingsStore {
    fn payment_default(&self, user_id: UserId) -> Option<ComponentName> {
        self.payment_defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    fn set_payment_default(&self, user_id: UserId, component: Option<ComponentName>) {
        let mut defaults = self.payment_defaults.lock().unwrap_or_else(PoisonError::into_inner);
        match component {
            Some(component) => defaults.insert(user_id, component),
            None => defaults.remove(&user_id),
        };
    }
}

struct State {
    options: RoutingOptions,
    prefs: Preferences,
    cache: AidCache,
    builder: RoutingTableBuilder,
    engine: HostEmulationEngine,
    plan: Option<RoutingPlan>,
    routing_dirty: bool,
    force_routing: bool,
    // Uid that installed the routing override.
    override_uid: Option<Uid>,
    preferred: Option<ComponentName>,
}

pub struct CardEmulationManager {
    config: Config,
    registry: ServiceRegistry,
    driver: Arc<dyn ControllerDriver>,
    environment: Arc<dyn Environment>,
    settings: Arc<dyn SettingsStore>,
    listeners: Arc<ListenerRegistry>,
    events: mpsc::UnboundedSender<Event>,
    state: Mutex<State>,
}

impl CardEmulationManager {
    /// Create the manager and the receiving end of its event channel, to
    /// be passed to [`CardEmulationManager::run`].
    pub fn new(
        config: Config,
        packages: Arc<dyn PackageSource>,
        driver: Arc<dyn ControllerDriver>,
        binder: Arc<dyn ServiceBinder>,
        environment: Arc<dyn Environment>,
        settings: Arc<dyn SettingsStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let capabilities = driver.capabilities();
        let listeners = Arc::new(ListenerRegistry::new());
        let prefs = Preferences::new(config.wallet_role_enabled, config.associated_role_services);
        let state = State {
            options: RoutingOptions::new(&config),
            cache: AidCache::new(capabilities, prefs.clone()),
            prefs,
            builder: RoutingTableBuilder::new(capabilities),
            engine: HostEmulationEngine::new(
                &config,
                driver.clone(),
                binder,
                events.clone(),
                listeners.clone(),
            ),
            plan: None,
            routing_dirty: false,
            force_routing: false,
            override_uid: None,
            preferred: None,
        };
        let registry =
            ServiceRegistry::new(packages, events.clone(), config.other_category_feature);
        let manager = CardEmulationManager {
            config,
            registry,
            driver,
            environment,
            settings,
            listeners,
            events,
            state: Mutex::new(state),
        };
        (Arc::new(manager), rx)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Post an event to the loop.
    pub fn post(&self, event: impl Into<Event>) {
        if self.events.send(event.into()).is_err() {
            log::error!("event loop is gone");
        }
    }

    /// Event loop. Runs until every sender is dropped.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Event>) {
        log::info!("card emulation manager started");
        while let Some(event) = rx.recv().await {
            let mut state = self.state.lock().await;
            self.handle(&mut state, event).await;
            while let Ok(event) = rx.try_recv() {
                self.handle(&mut state, event).await;
            }
            let _ = self.flush_routing(&mut state).await;
        }
        log::info!("card emulation manager stopped");
    }

    async fn handle(&self, state: &mut State, event: Event) {
        match event {
            Event::ServicesUpdated { user_id } => {
                log::debug!("+ services_updated({})", user_id);
                if !self.config.wallet_role_enabled {
                    self.verify_defaults();
                }
                self.rebuild(state).await;
            }
            Event::Controller(event) => self.on_controller_event(state, event).await,
            Event::Engine(event) => state.engine.on_engine_event(event).await,
        }
    }

    async fn on_controller_event(&self, state: &mut State, event: ControllerEvent) {
        let State { engine, cache, .. } = state;
        match event {
            ControllerEvent::Activated(technology) => engine.on_activated(technology),
            ControllerEvent::Data(apdu) => {
                if engine.on_data(apdu, cache).await {
                    self.environment.user_activity();
                }
            }
            ControllerEvent::Deactivated => engine.on_deactivated().await,
            ControllerEvent::FieldChange(on) => engine.on_field_change(on),
            ControllerEvent::PollingFrames(frames) => {
                engine.on_polling_frames(frames, cache).await;
            }
            ControllerEvent::ObserveModeChanged(enabled) => engine.on_observe_mode_changed(enabled),
            ControllerEvent::OffHostAidSelected => engine.on_off_host_aid_selected(),
        }
    }

    /// Recompute the resolver from the current registry snapshot and
    /// preference inputs. The routing plan is marked for the next push.
    async fn rebuild(&self, state: &mut State) {
        let user_id = self.registry.current_user();
        let services = self.registry.list(user_id, None);
        let payment_default = self.settings.payment_default(user_id);
        state.prefs.set_payment_default(user_id, payment_default);
        state.cache.rebuild(user_id, services, &state.prefs);

        let preferred = state.cache.preferred_service().component.clone();
        if preferred != state.preferred {
            log::info!(
                "preferred service changed to {}",
                preferred.as_ref().map_or("none".to_string(), |c| c.to_string())
            );
            self.listeners.broadcast(|l| l.on_preferred_service_changed(user_id, preferred.as_ref()));
            state.preferred = preferred;
        }
        state.engine.on_preferred_changed(state.cache.preferred_payment_service());
        let observe_mode = state
            .preferred
            .as_ref()
            .and_then(|c| state.cache.services().iter().find(|s| &s.component == c))
            .map_or(false, |s| s.should_default_to_observe_mode);
        state.engine.set_observe_mode_preference(observe_mode).await;
        state.routing_dirty = true;
    }

    /// Build and submit the routing plan if the resolver changed since the
    /// last push.
    async fn flush_routing(&self, state: &mut State) -> Result<()> {
        if !std::mem::take(&mut state.routing_dirty) {
            return Ok(());
        }
        let force = std::mem::take(&mut state.force_routing);
        let plan = match state.builder.build(&state.cache, &state.options) {
            Ok(plan) => plan,
            Err(err) => {
                log::error!("failed to build routing plan: {}", err);
                self.listeners.broadcast(|l| l.on_internal_error(&err));
                return Err(err);
            }
        };
        if state.builder.committed() != Some(&plan) {
            for aid in &plan.not_routed {
                self.listeners.broadcast(|l| l.on_aid_not_routed(aid));
            }
        }
        let result = state.builder.commit(self.driver.as_ref(), &plan, force).await;
        state.plan = Some(plan);
        if let Err(err) = &result {
            self.listeners.broadcast(|l| l.on_internal_error(err));
        }
        result.map(|_| ())
    }

    /// Check the stored payment default against the installed services.
    /// Only used when the wallet role is not available.
    fn verify_defaults(&self) {
        let user_id = self.registry.current_user();
        let users: Vec<UserId> =
            std::iter::once(user_id).chain(self.registry.enabled_profiles(user_id)).collect();
        let with_default: Vec<UserId> =
            users.iter().copied().filter(|u| self.settings.payment_default(*u).is_some()).collect();

        if with_default.len() > 1 {
            log::warn!("payment default set in {} profiles, clearing all", with_default.len());
            for user in with_default {
                self.settings.set_payment_default(user, None);
            }
            return;
        }
        if let [user] = with_default.as_slice() {
            if let Some(component) = self.settings.payment_default(*user) {
                let valid = self
                    .registry
                    .get(*user, &component)
                    .map_or(false, |s| s.has_category(Category::Payment));
                if valid {
                    return;
                }
                log::info!("payment default {} is no longer installed", component);
                self.settings.set_payment_default(*user, None);
            }
        }

        let candidates: Vec<(UserId, ComponentName)> = users
            .iter()
            .flat_map(|&user| {
                self.registry
                    .list_for_user(user)
                    .into_iter()
                    .filter(|s| s.is_system && s.has_category(Category::Payment))
                    .map(move |s| (user, s.component.clone()))
            })
            .collect();
        match candidates.as_slice() {
            [(user, component)] => {
                log::info!("using {} as payment default", component);
                self.settings.set_payment_default(*user, Some(component.clone()));
            }
            _ => log::debug!(" > {} pre-installed payment services, no default", candidates.len()),
        }
    }

    async fn refresh(&self, state: &mut State) -> Result<()> {
        self.rebuild(state).await;
        self.flush_routing(state).await
    }

    /// Set the preferred service of an application in the foreground.
    pub async fn set_preferred_foreground(&self, uid: Uid, component: &ComponentName) -> Result<()> {
        log::debug!("+ set_preferred_foreground({}, {})", uid, component);
        if !self.environment.is_in_foreground(uid) {
            return Err(Error::InvalidArgument(format!("uid {} is not in the foreground", uid)));
        }
        let user_id = self.registry.current_user();
        let service = self
            .registry
            .get(user_id, component)
            .ok_or_else(|| Error::NotFound(format!("service {}", component)))?;
        if service.uid != uid {
            return Err(Error::PermissionDenied(format!("uid {} does not own {}", uid, component)));
        }
        let mut state = self.state.lock().await;
        state.prefs.foreground =
            Some(ForegroundPreference { component: component.clone(), uid, user_id });
        self.refresh(&mut state).await
    }

    /// Remove the foreground preference of `uid`. Returns false if it had
    /// none.
    pub async fn clear_preferred_foreground(&self, uid: Uid) -> Result<bool> {
        log::debug!("+ clear_preferred_foreground({})", uid);
        let mut state = self.state.lock().await;
        if !state.prefs.clear_foreground(uid) {
            return Ok(false);
        }
        self.refresh(&mut state).await?;
        Ok(true)
    }

    /// The application `uid` left the foreground: its preference and
    /// routing override are dropped.
    pub async fn on_uid_to_background(&self, uid: Uid) -> Result<()> {
        log::debug!("+ on_uid_to_background({})", uid);
        let mut state = self.state.lock().await;
        let mut changed = state.prefs.clear_foreground(uid);
        if state.override_uid == Some(uid) {
            log::info!("recovering routing override of uid {}", uid);
            state.override_uid = None;
            state.options.recover();
            changed = true;
        }
        if changed {
            self.refresh(&mut state).await?;
        }
        Ok(())
    }

    pub async fn set_wallet_holder(&self, user_id: UserId, package: Option<String>) -> Result<()> {
        log::debug!("+ set_wallet_holder({}, {:?})", user_id, package);
        let mut state = self.state.lock().await;
        state.prefs.set_wallet_holder(user_id, package);
        self.refresh(&mut state).await
    }

    pub async fn set_payment_default(
        &self,
        user_id: UserId,
        component: Option<ComponentName>,
    ) -> Result<()> {
        log::debug!("+ set_payment_default({}, {:?})", user_id, component.as_ref().map(|c| c.to_string()));
        self.settings.set_payment_default(user_id, component);
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await
    }

    /// Set the default service of a category. Only the payment category
    /// has a default.
    pub async fn set_default_service_for_category(
        &self,
        user_id: UserId,
        component: &ComponentName,
        category: Category,
    ) -> Result<()> {
        if category != Category::Payment {
            return Err(Error::InvalidArgument(format!("category {} has no default", category)));
        }
        if !self.registry.has(user_id, component) {
            return Err(Error::NotFound(format!("service {}", component)));
        }
        self.set_payment_default(user_id, Some(component.clone())).await
    }

    /// Switch the controller on or off. Fails with `Timeout` if the
    /// controller does not complete the transition in time.
    pub async fn on_nfc_enabled(&self, enabled: bool) -> Result<()> {
        log::debug!("+ on_nfc_enabled({})", enabled);
        let timeout = self.config.nfc_state_timeout;
        match tokio::time::timeout(timeout, self.driver.set_nfc_enabled(enabled)).await {
            Ok(result) => result?,
            Err(_) => {
                log::error!("NFC state change to {} timed out", enabled);
                return Err(Error::Timeout(format!("NFC state change after {:?}", timeout)));
            }
        }
        let mut state = self.state.lock().await;
        state.prefs.nfc_enabled = enabled;
        state.engine.on_nfc_state_changed(enabled).await;
        self.listeners.broadcast(|l| l.on_nfc_state_changed(enabled));
        self.refresh(&mut state).await
    }

    /// Temporarily override the ISO-DEP and off-host default routes. The
    /// caller must be in the foreground and hold the preferred service.
    /// The resolver is rebuilt; the plan is pushed with the next routing
    /// update.
    pub async fn override_routing_table(
        &self,
        uid: Uid,
        protocol: Option<&str>,
        technology: Option<&str>,
        package: &str,
    ) -> Result<()> {
        log::debug!("+ override_routing_table({}, {:?}, {:?}, {})", uid, protocol, technology, package);
        if [protocol, technology].into_iter().flatten().any(RoutingOptions::is_reserved) {
            return Err(Error::InvalidArgument("default is not an override value".to_string()));
        }
        let mut state = self.state.lock().await;
        let user_id = self.registry.current_user();
        if !state.cache.is_preferred_service_package_name_for_user(package, user_id) {
            return Err(Error::PermissionDenied(format!("{} is not the preferred service", package)));
        }
        if !self.environment.is_in_foreground(uid) {
            return Err(Error::InvalidArgument(format!("uid {} is not in the foreground", uid)));
        }
        let iso_dep = protocol.map(|name| state.options.parse_route(name)).transpose()?;
        let off_host = technology.map(|name| state.options.parse_route(name)).transpose()?;
        state.override_uid = Some(uid);
        if let Some(route) = iso_dep {
            state.options.override_iso_dep(route);
        }
        if let Some(route) = off_host {
            state.options.override_off_host(route);
        }
        self.rebuild(&mut state).await;
        Ok(())
    }

    /// Drop the routing override. The caller must be in the foreground.
    pub async fn recover_routing_table(&self, uid: Uid) -> Result<()> {
        log::debug!("+ recover_routing_table({})", uid);
        if !self.environment.is_in_foreground(uid) {
            return Err(Error::InvalidArgument(format!("uid {} is not in the foreground", uid)));
        }
        let mut state = self.state.lock().await;
        state.override_uid = None;
        state.options.recover();
        self.rebuild(&mut state).await;
        Ok(())
    }

    /// Replace the configured default routes. `None` leaves a route
    /// unchanged.
    pub async fn overwrite_routing_table(
        &self,
        aids: Option<&str>,
        protocol: Option<&str>,
        technology: Option<&str>,
        system_code: Option<&str>,
    ) -> Result<()> {
        log::debug!(
            "+ overwrite_routing_table({:?}, {:?}, {:?}, {:?})",
            aids,
            protocol,
            technology,
            system_code
        );
        let mut state = self.state.lock().await;
        let parse = |name: Option<&str>| name.map(|name| state.options.parse_route(name)).transpose();
        let (aid_route, iso_dep, off_host, sc) =
            (parse(aids)?, parse(protocol)?, parse(technology)?, parse(system_code)?);
        let options = &mut state.options;
        if let Some(route) = aid_route {
            options.override_aid(route);
        }
        if let Some(route) = iso_dep {
            options.override_iso_dep(route);
        }
        if let Some(route) = off_host {
            options.override_off_host(route);
        }
        if let Some(route) = sc {
            options.override_sc(route);
        }
        if options.is_overridden() {
            options.overwrite();
        }
        self.rebuild(&mut state).await;
        Ok(())
    }

    /// Symbolic names of the default AID, ISO-DEP and off-host routes.
    pub async fn routing_status(&self) -> Vec<String> {
        self.state.lock().await.options.routing_status()
    }

    pub async fn set_auto_change(&self, enabled: bool) {
        self.state.lock().await.options.set_auto_change(enabled)
    }

    pub async fn is_auto_change_enabled(&self) -> bool {
        self.state.lock().await.options.is_auto_change_enabled()
    }

    /// Push the routing plan now, even if unchanged.
    pub async fn commit_routing(&self) -> Result<()> {
        log::debug!("+ commit_routing()");
        let mut state = self.state.lock().await;
        state.routing_dirty = true;
        state.force_routing = true;
        self.flush_routing(&mut state).await
    }

    /// Last plan built for the controller.
    pub async fn routing_plan(&self) -> Option<RoutingPlan> {
        self.state.lock().await.plan.clone()
    }

    pub async fn resolve(&self, aid: &Aid) -> AidResolveInfo {
        self.state.lock().await.cache.resolve_aid(aid)
    }

    pub async fn preferred_service(&self) -> PreferredService {
        self.state.lock().await.cache.preferred_service().clone()
    }

    pub async fn is_default_service_for_aid(&self, component: &ComponentName, aid: &Aid) -> bool {
        self.state.lock().await.cache.is_default_service_for_aid(component, aid)
    }

    pub async fn is_default_service_for_category(
        &self,
        component: &ComponentName,
        category: Category,
    ) -> bool {
        self.state.lock().await.cache.is_default_service_for_category(component, category)
    }

    pub async fn registered_aid_category(&self, aid: &Aid) -> Option<Category> {
        self.state.lock().await.cache.registered_aid_category(aid)
    }

    pub async fn is_preferred_service_package_name_for_user(
        &self,
        package: &str,
        user_id: UserId,
    ) -> bool {
        self.state.lock().await.cache.is_preferred_service_package_name_for_user(package, user_id)
    }

    pub async fn host_state(&self) -> HostState {
        self.state.lock().await.engine.state()
    }

    pub async fn is_host_card_emulation_activated(&self) -> bool {
        self.state.lock().await.engine.is_host_card_emulation_activated()
    }

    /// Whether the current session saw an APDU other than an NDEF SELECT.
    pub async fn not_skip_aid(&self) -> bool {
        self.state.lock().await.engine.not_skip_aid()
    }
}
