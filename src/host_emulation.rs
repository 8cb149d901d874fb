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

//! Host card emulation session state machine.
//!
//! The engine owns the reader session. Service binding and command
//! processing run in spawned tasks whose completions come back to the
//! manager loop as [`EngineEvent`]s tagged with the session generation, so
//! that nothing started before a deactivation can reach the reader after
//! it.

use crate::aid::Aid;
use crate::aid_cache::AidCache;
use crate::apdu::{self, SkipAidLatch, SW_FILE_NOT_FOUND, SW_UNKNOWN_ERROR};
use crate::config::Config;
use crate::controller::{ControllerDriver, Technology};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, Event};
use crate::listeners::ListenerRegistry;
use crate::polling_loop::PollingFrame;
use crate::service::{ComponentName, ServiceInfo};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a bound service stops receiving commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeactivationReason {
    /// The reader link was lost.
    LinkLoss,
    /// Another AID was selected.
    Deselected,
}

/// A bound host service.
pub trait ServiceEndpoint: Send + Sync {
    fn component(&self) -> &ComponentName;

    /// Process a command APDU, returning the response APDU.
    fn process_command_apdu(&self, apdu: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>>;

    fn on_deactivated(&self, reason: DeactivationReason);

    fn process_polling_frames(&self, frames: Vec<PollingFrame>);
}

/// Establishes connections to host services.
pub trait ServiceBinder: Send + Sync {
    fn bind(&self, service: Arc<ServiceInfo>) -> BoxFuture<'static, Result<Arc<dyn ServiceEndpoint>>>;
}

/// Host session state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostState {
    /// No reader session.
    Idle,
    WaitingForSelect,
    /// A service is selected and its binding is in progress. Commands are
    /// queued.
    Xceiving,
    /// Commands are forwarded to the bound service.
    Bound,
    /// NFC is disabled; activations are refused.
    Deactivated,
}

struct Selection {
    service: Arc<ServiceInfo>,
    endpoint: Option<Arc<dyn ServiceEndpoint>>,
}

impl Selection {
    fn new(service: Arc<ServiceInfo>) -> Self {
        Selection { service, endpoint: None }
    }

    fn is(&self, component: &ComponentName) -> bool {
        &self.service.component == component
    }
}

pub struct HostEmulationEngine {
    driver: Arc<dyn ControllerDriver>,
    binder: Arc<dyn ServiceBinder>,
    events: mpsc::UnboundedSender<Event>,
    listeners: Arc<ListenerRegistry>,
    bind_timeout: Duration,
    apdu_timeout: Duration,
    observe_mode_supported: bool,
    state: HostState,
    // Bumped whenever in-flight work must be discarded.
    session: u64,
    active: Option<Selection>,
    pending: VecDeque<Vec<u8>>,
    in_flight: bool,
    latch: SkipAidLatch,
    payment: Option<Selection>,
    queued_payment: Option<Option<Arc<ServiceInfo>>>,
    observe_mode_wanted: bool,
    observe_mode_enabled: bool,
    auto_transact: bool,
}

impl HostEmulationEngine {
    pub fn new(
        config: &Config,
        driver: Arc<dyn ControllerDriver>,
        binder: Arc<dyn ServiceBinder>,
        events: mpsc::UnboundedSender<Event>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        HostEmulationEngine {
            driver,
            binder,
            events,
            listeners,
            bind_timeout: config.bind_timeout,
            apdu_timeout: config.apdu_timeout,
            observe_mode_supported: config.observe_mode_supported,
            state: HostState::Idle,
            session: 0,
            active: None,
            pending: VecDeque::new(),
            in_flight: false,
            latch: SkipAidLatch::default(),
            payment: None,
            queued_payment: None,
            observe_mode_wanted: false,
            observe_mode_enabled: false,
            auto_transact: false,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_host_card_emulation_activated(&self) -> bool {
        matches!(self.state, HostState::WaitingForSelect | HostState::Xceiving | HostState::Bound)
    }

    /// Component of the selected service.
    pub fn active_service(&self) -> Option<&ComponentName> {
        self.active.as_ref().map(|a| &a.service.component)
    }

    /// Component of the pre-bound payment service.
    pub fn payment_service(&self) -> Option<&ComponentName> {
        self.payment.as_ref().map(|p| &p.service.component)
    }

    pub fn is_observe_mode_enabled(&self) -> bool {
        self.observe_mode_enabled
    }

    /// Whether an APDU other than an NDEF SELECT was seen in this session.
    pub fn not_skip_aid(&self) -> bool {
        self.latch.is_set()
    }

    pub fn on_activated(&mut self, technology: Technology) {
        log::debug!("+ on_activated({:?})", technology);
        if technology != Technology::IsoDep {
            log::info!("ignoring {:?} activation", technology);
            return;
        }
        match self.state {
            HostState::Idle => {
                self.latch.reset();
                self.state = HostState::WaitingForSelect;
            }
            HostState::Deactivated => log::warn!("activation while NFC is disabled"),
            _ => log::debug!(" > session already active"),
        }
    }

    /// Handle a command APDU from the reader. Returns true if the APDU
    /// counts as user activity.
    pub async fn on_data(&mut self, apdu: Vec<u8>, cache: &AidCache) -> bool {
        log::debug!("+ on_data({})", hex::encode(&apdu));
        if !self.is_host_card_emulation_activated() {
            log::warn!("dropping APDU received in state {:?}", self.state);
            return false;
        }
        let skip = self.latch.observe(&apdu);

        if let Some(selected) = apdu::select_aid(&apdu) {
            let selected = selected.to_vec();
            self.on_select(&selected, apdu, cache).await;
        } else if self.active.is_some() {
            self.dispatch(apdu);
        } else if let Some(payment) = self.payment.as_ref().filter(|p| p.endpoint.is_some()) {
            log::debug!(" > forwarding to payment service {}", payment.service.component);
            self.active = Some(Selection {
                service: payment.service.clone(),
                endpoint: payment.endpoint.clone(),
            });
            self.state = HostState::Bound;
            self.dispatch(apdu);
        } else {
            log::info!("first command is not a SELECT and no payment service is bound");
            self.respond(SW_FILE_NOT_FOUND.to_vec()).await;
        }
        !skip
    }

    async fn on_select(&mut self, selected: &[u8], apdu: Vec<u8>, cache: &AidCache) {
        let info = cache.resolve(selected);
        log::debug!(" > SELECT {} resolved ({})", hex::encode_upper(selected), info.reason);
        let conflict = info.is_conflict();
        let service = match info.default_service {
            Some(service) if service.on_host => service,
            Some(service) => {
                log::warn!("AID {} is routed off host to {}", hex::encode_upper(selected), service.component);
                self.respond(SW_FILE_NOT_FOUND.to_vec()).await;
                return;
            }
            None => {
                if conflict {
                    if let Ok(aid) = Aid::exact(selected) {
                        self.listeners.broadcast(|l| l.on_aid_conflict(&aid));
                    }
                }
                self.respond(SW_FILE_NOT_FOUND.to_vec()).await;
                return;
            }
        };

        if self.active.as_ref().map_or(false, |a| a.is(&service.component)) {
            self.dispatch(apdu);
            return;
        }

        self.deselect(DeactivationReason::Deselected);
        let endpoint = self
            .payment
            .as_ref()
            .filter(|p| p.is(&service.component))
            .and_then(|p| p.endpoint.clone());
        match endpoint {
            Some(endpoint) => {
                self.state = HostState::Bound;
                self.active = Some(Selection { service, endpoint: Some(endpoint) });
            }
            None => {
                self.state = HostState::Xceiving;
                self.bind(service.clone());
                self.active = Some(Selection::new(service));
            }
        }
        self.dispatch(apdu);
    }

    /// Release the selected service and discard queued and in-flight
    /// commands.
    fn deselect(&mut self, reason: DeactivationReason) {
        if let Some(active) = self.active.take() {
            log::debug!(" > releasing {}", active.service.component);
            if let Some(endpoint) = active.endpoint {
                endpoint.on_deactivated(reason);
            }
        }
        self.pending.clear();
        self.in_flight = false;
        self.session += 1;
    }

    fn dispatch(&mut self, apdu: Vec<u8>) {
        let endpoint = match &self.active {
            Some(Selection { endpoint: Some(endpoint), .. }) if !self.in_flight => endpoint.clone(),
            _ => {
                self.pending.push_back(apdu);
                return;
            }
        };
        self.in_flight = true;
        let session = self.session;
        let events = self.events.clone();
        let timeout = self.apdu_timeout;
        let response = endpoint.process_command_apdu(apdu);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, response).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("no response after {:?}", timeout))),
            };
            let _ = events.send(EngineEvent::Response { session, result }.into());
        });
    }

    fn spawn_bind<F>(&self, service: Arc<ServiceInfo>, complete: F)
    where
        F: FnOnce(ComponentName, Result<Arc<dyn ServiceEndpoint>>) -> EngineEvent + Send + 'static,
    {
        let component = service.component.clone();
        let events = self.events.clone();
        let timeout = self.bind_timeout;
        let bind = self.binder.bind(service);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, bind).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("binding {} after {:?}", component, timeout))),
            };
            let _ = events.send(complete(component, result).into());
        });
    }

    fn bind(&self, service: Arc<ServiceInfo>) {
        let session = self.session;
        self.spawn_bind(service, move |component, result| EngineEvent::Bound {
            session,
            component,
            result,
        });
    }

    pub async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Bound { session, component, result } => {
                self.on_bound(session, component, result).await
            }
            EngineEvent::Response { session, result } => self.on_response(session, result).await,
            EngineEvent::PaymentBound { component, result } => {
                self.on_payment_bound(component, result)
            }
        }
    }

    async fn on_bound(
        &mut self,
        session: u64,
        component: ComponentName,
        result: Result<Arc<dyn ServiceEndpoint>>,
    ) {
        log::debug!("+ on_bound({}, {})", component, result.is_ok());
        let waiting = session == self.session
            && self.active.as_ref().map_or(false, |a| a.is(&component) && a.endpoint.is_none());
        if !waiting {
            log::debug!(" > dropping stale binding");
            return;
        }
        match result {
            Ok(endpoint) => {
                if let Some(active) = self.active.as_mut() {
                    active.endpoint = Some(endpoint);
                }
                self.state = HostState::Bound;
                if let Some(next) = self.pending.pop_front() {
                    self.dispatch(next);
                }
            }
            Err(err) => {
                log::error!("failed to bind {}: {}", component, err);
                self.listeners.broadcast(|l| l.on_internal_error(&err));
                let discarded = std::mem::take(&mut self.pending);
                for _ in discarded {
                    self.respond(SW_UNKNOWN_ERROR.to_vec()).await;
                }
                self.active = None;
                self.state = HostState::WaitingForSelect;
            }
        }
    }

    async fn on_response(&mut self, session: u64, result: Result<Vec<u8>>) {
        if session != self.session {
            log::debug!(" > dropping response of a released service");
            return;
        }
        self.in_flight = false;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                log::warn!("command processing failed: {}", err);
                SW_UNKNOWN_ERROR.to_vec()
            }
        };
        self.respond(response).await;
        if let Some(next) = self.pending.pop_front() {
            self.dispatch(next);
        }
    }

    async fn respond(&self, response: Vec<u8>) {
        log::debug!(" > response {}", hex::encode(&response));
        if let Err(err) = self.driver.send_data(response).await {
            log::error!("failed to send response: {}", err);
        }
    }

    /// End the reader session. Queued and in-flight commands are dropped
    /// and the selected service is released.
    pub async fn on_deactivated(&mut self) {
        log::debug!("+ on_deactivated()");
        if !self.is_host_card_emulation_activated() {
            log::debug!(" > no active session");
            return;
        }
        self.deselect(DeactivationReason::LinkLoss);
        self.latch.reset();
        self.state = HostState::Idle;
        self.auto_transact = false;
        if let Some(payment) = self.queued_payment.take() {
            self.on_preferred_changed(payment);
        }
        self.apply_observe_mode().await;
    }

    /// The reader selected an off-host AID: the host service is no longer
    /// selected.
    pub fn on_off_host_aid_selected(&mut self) {
        log::debug!("+ on_off_host_aid_selected()");
        if !self.is_host_card_emulation_activated() {
            return;
        }
        self.deselect(DeactivationReason::Deselected);
        self.state = HostState::WaitingForSelect;
    }

    pub fn on_field_change(&mut self, on: bool) {
        log::debug!("+ on_field_change({})", on);
        self.listeners.broadcast(|l| l.on_remote_field_changed(on));
    }

    /// Update the pre-bound payment service. The change waits for the end
    /// of the current session, if any.
    pub fn on_preferred_changed(&mut self, payment: Option<Arc<ServiceInfo>>) {
        if self.is_host_card_emulation_activated() {
            log::debug!(" > session in progress, preferred service change queued");
            self.queued_payment = Some(payment);
            return;
        }
        let current = self.payment.as_ref().map(|p| &p.service.component);
        if current == payment.as_ref().map(|s| &s.component) {
            return;
        }
        log::debug!(
            "+ on_preferred_changed({:?})",
            payment.as_ref().map(|s| s.component.to_string())
        );
        self.payment = None;
        if let Some(service) = payment {
            self.spawn_bind(service.clone(), |component, result| EngineEvent::PaymentBound {
                component,
                result,
            });
            self.payment = Some(Selection::new(service));
        }
    }

    fn on_payment_bound(&mut self, component: ComponentName, result: Result<Arc<dyn ServiceEndpoint>>) {
        match self.payment.as_mut() {
            Some(payment) if payment.is(&component) && payment.endpoint.is_none() => match result {
                Ok(endpoint) => payment.endpoint = Some(endpoint),
                Err(err) => log::error!("failed to bind payment service {}: {}", component, err),
            },
            _ => log::debug!(" > dropping stale payment binding of {}", component),
        }
    }

    /// Route polling frames to the services whose filters match them.
    /// Returns the frames delivered to each service.
    pub async fn on_polling_frames(
        &mut self,
        frames: Vec<PollingFrame>,
        cache: &AidCache,
    ) -> BTreeMap<ComponentName, Vec<PollingFrame>> {
        log::debug!("+ on_polling_frames({} frames)", frames.len());
        let mut deliveries: BTreeMap<ComponentName, (Arc<ServiceInfo>, Vec<PollingFrame>)> =
            BTreeMap::new();
        for mut frame in frames {
            let matching: Vec<Arc<ServiceInfo>> = cache
                .services()
                .iter()
                .filter(|s| s.polling_loop_match(&frame).is_some())
                .cloned()
                .collect();
            let target = match cache.resolve_polling_loop_conflict(&matching) {
                Some(service) => service,
                None => match &self.payment {
                    Some(payment) => payment.service.clone(),
                    None => continue,
                },
            };
            if target.polling_loop_match(&frame) == Some(true) && !self.auto_transact {
                log::info!("auto transaction enabled by {}", target.component);
                frame.triggered_auto_transact = true;
                self.auto_transact = true;
                if let Err(err) = self.driver.allow_auto_transact().await {
                    log::error!("failed to allow auto transaction: {}", err);
                }
            }
            deliveries
                .entry(target.component.clone())
                .or_insert_with(|| (target.clone(), vec![]))
                .1
                .push(frame);
        }
        for (service, frames) in deliveries.values() {
            self.deliver_polling_frames(service.clone(), frames.clone());
        }
        deliveries.into_iter().map(|(component, (_, frames))| (component, frames)).collect()
    }

    fn deliver_polling_frames(&self, service: Arc<ServiceInfo>, frames: Vec<PollingFrame>) {
        let endpoint = [&self.active, &self.payment]
            .into_iter()
            .flatten()
            .find(|s| s.is(&service.component))
            .and_then(|s| s.endpoint.clone());
        if let Some(endpoint) = endpoint {
            endpoint.process_polling_frames(frames);
            return;
        }
        let timeout = self.bind_timeout;
        let component = service.component.clone();
        let bind = self.binder.bind(service);
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, bind).await {
                Ok(Ok(endpoint)) => endpoint.process_polling_frames(frames),
                Ok(Err(err)) => log::error!("failed to bind {}: {}", component, err),
                Err(_) => log::error!("timed out binding {}", component),
            }
        });
    }

    /// Record whether the preferred service asks for observe mode. Applied
    /// immediately when no session is active, else at the end of the
    /// session.
    pub async fn set_observe_mode_preference(&mut self, wanted: bool) {
        self.observe_mode_wanted = wanted && self.observe_mode_supported;
        if !self.is_host_card_emulation_activated() {
            self.apply_observe_mode().await;
        }
    }

    async fn apply_observe_mode(&mut self) {
        if self.state == HostState::Deactivated || self.observe_mode_wanted == self.observe_mode_enabled {
            return;
        }
        let enable = self.observe_mode_wanted;
        log::debug!(" > setting observe mode {}", enable);
        match self.driver.set_observe_mode(enable).await {
            Ok(()) => self.observe_mode_enabled = enable,
            Err(err) => log::error!("failed to set observe mode {}: {}", enable, err),
        }
    }

    pub fn on_observe_mode_changed(&mut self, enabled: bool) {
        log::debug!("+ on_observe_mode_changed({})", enabled);
        self.observe_mode_enabled = enabled;
        self.listeners.broadcast(|l| l.on_observe_mode_state_changed(enabled));
    }

    pub async fn on_nfc_state_changed(&mut self, enabled: bool) {
        log::debug!("+ on_nfc_state_changed({})", enabled);
        if enabled {
            if self.state == HostState::Deactivated {
                self.state = HostState::Idle;
                self.observe_mode_enabled = false;
                self.apply_observe_mode().await;
            }
        } else {
            self.deselect(DeactivationReason::LinkLoss);
            self.latch.reset();
            self.state = HostState::Deactivated;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::aid::{AidGroup, Category};
    use crate::controller::tests::RecordingDriver;
    use crate::controller::ControllerCommand;
    use crate::listeners::tests::RecordingListener;
    use crate::polling_loop::{PollingFrameType, PollingLoopFilter};
    use crate::preferred::Preferences;
    use futures::FutureExt;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub const SW_OK: [u8; 2] = [0x90, 0x00];

    /// Endpoint answering `90 00` after an optional delay.
    pub struct TestEndpoint {
        component: ComponentName,
        delay: Option<Duration>,
        pub commands: Mutex<Vec<Vec<u8>>>,
        pub deactivations: Mutex<Vec<DeactivationReason>>,
        pub frames: Mutex<Vec<PollingFrame>>,
    }

    impl TestEndpoint {
        pub fn commands(&self) -> Vec<Vec<u8>> {
            self.commands.lock().unwrap().clone()
        }

        pub fn deactivations(&self) -> Vec<DeactivationReason> {
            self.deactivations.lock().unwrap().clone()
        }
    }

    impl ServiceEndpoint for TestEndpoint {
        fn component(&self) -> &ComponentName {
            &self.component
        }

        fn process_command_apdu(&self, apdu: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> {
            self.commands.lock().unwrap().push(apdu);
            let delay = self.delay;
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(SW_OK.to_vec())
            }
            .boxed()
        }

        fn on_deactivated(&self, reason: DeactivationReason) {
            self.deactivations.lock().unwrap().push(reason)
        }

        fn process_polling_frames(&self, frames: Vec<PollingFrame>) {
            self.frames.lock().unwrap().extend(frames)
        }
    }

    /// Binder creating one [`TestEndpoint`] per component.
    #[derive(Default)]
    pub struct FakeBinder {
        pub endpoints: Mutex<HashMap<ComponentName, Arc<TestEndpoint>>>,
        pub binds: Mutex<Vec<ComponentName>>,
        pub failing: Mutex<bool>,
        pub delay: Mutex<Option<Duration>>,
    }

    impl FakeBinder {
        pub fn endpoint(&self, component: &ComponentName) -> Arc<TestEndpoint> {
            let delay = *self.delay.lock().unwrap();
            self.endpoints
                .lock()
                .unwrap()
                .entry(component.clone())
                .or_insert_with(|| {
                    Arc::new(TestEndpoint {
                        component: component.clone(),
                        delay,
                        commands: Default::default(),
                        deactivations: Default::default(),
                        frames: Default::default(),
                    })
                })
                .clone()
        }

        pub fn binds(&self) -> Vec<ComponentName> {
            self.binds.lock().unwrap().clone()
        }
    }

    impl ServiceBinder for FakeBinder {
        fn bind(&self, service: Arc<ServiceInfo>) -> BoxFuture<'static, Result<Arc<dyn ServiceEndpoint>>> {
            self.binds.lock().unwrap().push(service.component.clone());
            let result: Result<Arc<dyn ServiceEndpoint>> = if *self.failing.lock().unwrap() {
                Err(Error::Internal(format!("{} refused the binding", service.component)))
            } else {
                Ok(self.endpoint(&service.component))
            };
            async move { result }.boxed()
        }
    }

    const SELECT_OTHER: [u8; 12] =
        [0x00, 0xa4, 0x04, 0x00, 0x07, 0xf0, 0x53, 0x41, 0x49, 0x50, 0x45, 0x4d];
    const SELECT_PAYMENT: [u8; 13] =
        [0x00, 0xa4, 0x04, 0x00, 0x08, 0xa0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10, 0x12];
    const SELECT_NDEF: [u8; 12] =
        [0x00, 0xa4, 0x04, 0x00, 0x07, 0xd2, 0x76, 0x00, 0x00, 0x85, 0x01, 0x00];
    const READ_RECORD: [u8; 5] = [0x00, 0xb2, 0x01, 0x0c, 0x00];

    struct Harness {
        engine: HostEmulationEngine,
        rx: mpsc::UnboundedReceiver<Event>,
        driver: Arc<RecordingDriver>,
        binder: Arc<FakeBinder>,
        listener: Arc<RecordingListener>,
        cache: AidCache,
    }

    impl Harness {
        fn new(services: Vec<Arc<ServiceInfo>>, prefs: Preferences) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let driver = Arc::new(RecordingDriver::default());
            let binder = Arc::new(FakeBinder::default());
            let listeners = Arc::new(ListenerRegistry::new());
            let listener = Arc::new(RecordingListener::default());
            listeners.register(listener.clone());
            let engine = HostEmulationEngine::new(
                &Config::default(),
                driver.clone(),
                binder.clone(),
                tx,
                listeners,
            );
            let mut cache = AidCache::new(Default::default(), prefs.clone());
            cache.rebuild(0, services, &prefs);
            Harness { engine, rx, driver, binder, listener, cache }
        }

        /// Feed engine completions back until none is pending.
        async fn pump(&mut self) {
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_secs(60), self.rx.recv()).await
            {
                if let Event::Engine(event) = event {
                    self.engine.on_engine_event(event).await;
                }
            }
        }

        async fn data(&mut self, apdu: &[u8]) -> bool {
            let activity = self.engine.on_data(apdu.to_vec(), &self.cache).await;
            self.pump().await;
            activity
        }
    }

    fn service(package: &str, category: Category, aids: &[&str]) -> Arc<ServiceInfo> {
        crate::aid_cache::tests::service(package, category, aids)
    }

    fn component(package: &str) -> ComponentName {
        ComponentName::new(package, format!("{}.Service", package))
    }

    fn wallet_prefs() -> Preferences {
        let mut prefs = Preferences::new(true, false);
        prefs.set_wallet_holder(0, Some("com.wallet".to_string()));
        prefs
    }

    #[tokio::test(start_paused = true)]
    async fn select_binds_and_forwards() {
        let mut h = Harness::new(
            vec![service("com.loyalty", Category::Other, &["F053414950454D"])],
            Preferences::new(true, false),
        );
        h.engine.on_activated(Technology::IsoDep);
        assert_eq!(h.engine.state(), HostState::WaitingForSelect);

        h.data(&SELECT_OTHER).await;
        assert_eq!(h.engine.state(), HostState::Bound);
        assert_eq!(h.engine.active_service(), Some(&component("com.loyalty")));
        h.data(&READ_RECORD).await;

        let endpoint = h.binder.endpoint(&component("com.loyalty"));
        assert_eq!(endpoint.commands(), vec![SELECT_OTHER.to_vec(), READ_RECORD.to_vec()]);
        assert_eq!(h.driver.responses(), vec![SW_OK.to_vec(), SW_OK.to_vec()]);
        assert_eq!(h.binder.binds(), vec![component("com.loyalty")]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_aid_and_bare_command_are_not_found() {
        let mut h = Harness::new(vec![], Preferences::new(true, false));
        h.engine.on_activated(Technology::IsoDep);
        h.data(&SELECT_OTHER).await;
        h.data(&READ_RECORD).await;
        assert_eq!(h.driver.responses(), vec![SW_FILE_NOT_FOUND.to_vec(), SW_FILE_NOT_FOUND.to_vec()]);
        assert_eq!(h.engine.state(), HostState::WaitingForSelect);
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_select_is_reported() {
        let mut h = Harness::new(
            vec![
                service("com.a", Category::Other, &["F053414950454D"]),
                service("com.b", Category::Other, &["F053414950454D"]),
            ],
            Preferences::new(true, false),
        );
        h.engine.on_activated(Technology::IsoDep);
        h.data(&SELECT_OTHER).await;
        assert_eq!(h.driver.responses(), vec![SW_FILE_NOT_FOUND.to_vec()]);
        assert_eq!(h.listener.events(), vec!["conflict F053414950454D"]);
        assert!(h.binder.binds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_binding_answers_unknown_error() {
        let mut h = Harness::new(
            vec![service("com.loyalty", Category::Other, &["F053414950454D"])],
            Preferences::new(true, false),
        );
        *h.binder.failing.lock().unwrap() = true;
        h.engine.on_activated(Technology::IsoDep);
        h.data(&SELECT_OTHER).await;
        assert_eq!(h.driver.responses(), vec![SW_UNKNOWN_ERROR.to_vec()]);
        assert_eq!(h.engine.state(), HostState::WaitingForSelect);
        assert_eq!(h.engine.active_service(), None);
        assert_eq!(h.listener.events(), vec!["error internal"]);
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout_keeps_session() {
        let mut h = Harness::new(
            vec![service("com.loyalty", Category::Other, &["F053414950454D"])],
            Preferences::new(true, false),
        );
        *h.binder.delay.lock().unwrap() = Some(Duration::from_secs(3600));
        h.engine.on_activated(Technology::IsoDep);
        h.data(&SELECT_OTHER).await;
        assert_eq!(h.driver.responses(), vec![SW_UNKNOWN_ERROR.to_vec()]);
        assert_eq!(h.engine.state(), HostState::Bound);

        h.data(&READ_RECORD).await;
        assert_eq!(h.binder.endpoint(&component("com.loyalty")).commands().len(), 2);
        assert_eq!(h.driver.responses().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_drops_in_flight_command() {
        let mut h = Harness::new(
            vec![service("com.loyalty", Category::Other, &["F053414950454D"])],
            Preferences::new(true, false),
        );
        *h.binder.delay.lock().unwrap() = Some(Duration::from_secs(1));
        h.engine.on_activated(Technology::IsoDep);
        h.engine.on_data(SELECT_OTHER.to_vec(), &h.cache).await;
        // Deliver the binding, leaving the command in flight.
        if let Some(Event::Engine(event)) = h.rx.recv().await {
            h.engine.on_engine_event(event).await;
        }
        h.engine.on_deactivated().await;
        h.pump().await;

        assert!(h.driver.responses().is_empty());
        assert_eq!(h.engine.state(), HostState::Idle);
        let endpoint = h.binder.endpoint(&component("com.loyalty"));
        assert_eq!(endpoint.deactivations(), vec![DeactivationReason::LinkLoss]);

        assert!(!h.data(&READ_RECORD).await);
        assert_eq!(endpoint.commands().len(), 1);
        h.engine.on_deactivated().await;
        assert_eq!(endpoint.deactivations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ndef_select_is_not_user_activity() {
        let mut h = Harness::new(
            vec![service("com.loyalty", Category::Other, &["F053414950454D"])],
            Preferences::new(true, false),
        );
        h.engine.on_activated(Technology::IsoDep);
        assert!(!h.data(&SELECT_NDEF).await);
        assert!(!h.engine.not_skip_aid());
        assert!(h.data(&SELECT_OTHER).await);
        assert!(h.engine.not_skip_aid());
        assert!(h.data(&SELECT_NDEF).await);
        assert!(h.engine.not_skip_aid());
    }

    #[tokio::test(start_paused = true)]
    async fn bare_command_goes_to_payment_service() {
        let wallet = service("com.wallet", Category::Payment, &["A000000004101012"]);
        let mut h = Harness::new(vec![wallet.clone()], wallet_prefs());
        h.engine.on_preferred_changed(h.cache.preferred_payment_service());
        h.pump().await;
        assert_eq!(h.engine.payment_service(), Some(&component("com.wallet")));

        h.engine.on_activated(Technology::IsoDep);
        h.data(&READ_RECORD).await;
        h.data(&SELECT_PAYMENT).await;
        assert_eq!(h.engine.state(), HostState::Bound);
        let endpoint = h.binder.endpoint(&component("com.wallet"));
        assert_eq!(endpoint.commands(), vec![READ_RECORD.to_vec(), SELECT_PAYMENT.to_vec()]);
        assert_eq!(h.binder.binds().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_change_waits_for_session_end() {
        let wallet = service("com.wallet", Category::Payment, &["A000000004101012"]);
        let other = service("com.other", Category::Payment, &["A000000003101001"]);
        let mut h = Harness::new(vec![wallet.clone(), other.clone()], wallet_prefs());
        h.engine.on_preferred_changed(Some(wallet));
        h.pump().await;

        h.engine.on_activated(Technology::IsoDep);
        h.engine.on_preferred_changed(Some(other));
        h.pump().await;
        assert_eq!(h.engine.payment_service(), Some(&component("com.wallet")));

        h.engine.on_deactivated().await;
        h.pump().await;
        assert_eq!(h.engine.payment_service(), Some(&component("com.other")));
        assert_eq!(h.binder.binds(), vec![component("com.wallet"), component("com.other")]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_frames_trigger_auto_transact() {
        let mut transit = ServiceInfo::new(component("com.transit"), 10000, 0)
            .with_group(AidGroup::parse(Category::Other, &["F0010203040506"]).unwrap());
        transit.polling_filters.push(PollingLoopFilter::parse("6A02C801", true).unwrap());
        let mut h = Harness::new(vec![Arc::new(transit)], Preferences::new(true, false));

        let frames = vec![
            PollingFrame::new(PollingFrameType::NfcA, vec![0x6a, 0x02, 0xc8, 0x01]),
            PollingFrame::new(PollingFrameType::NfcA, vec![0x26]),
        ];
        let delivered = h.engine.on_polling_frames(frames, &h.cache).await;
        h.pump().await;

        let frames = &delivered[&component("com.transit")];
        assert_eq!(frames.len(), 1);
        assert!(frames[0].triggered_auto_transact);
        assert_eq!(h.driver.count(|c| *c == ControllerCommand::AllowAutoTransact), 1);
        tokio::task::yield_now().await;
        assert_eq!(h.binder.endpoint(&component("com.transit")).frames.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nfc_f_and_off_host_selection() {
        let mut h = Harness::new(
            vec![service("com.loyalty", Category::Other, &["F053414950454D"])],
            Preferences::new(true, false),
        );
        h.engine.on_activated(Technology::NfcF);
        assert_eq!(h.engine.state(), HostState::Idle);

        h.engine.on_activated(Technology::IsoDep);
        h.data(&SELECT_OTHER).await;
        h.engine.on_off_host_aid_selected();
        assert_eq!(h.engine.state(), HostState::WaitingForSelect);
        assert_eq!(h.engine.active_service(), None);
        let endpoint = h.binder.endpoint(&component("com.loyalty"));
        assert_eq!(endpoint.deactivations(), vec![DeactivationReason::Deselected]);
    }

    #[tokio::test(start_paused = true)]
    async fn observe_mode_follows_preference_outside_sessions() {
        let mut h = Harness::new(vec![], Preferences::new(true, false));
        h.engine.on_activated(Technology::IsoDep);
        h.engine.set_observe_mode_preference(true).await;
        assert_eq!(h.driver.count(|c| matches!(c, ControllerCommand::SetObserveMode(_))), 0);

        h.engine.on_deactivated().await;
        assert!(h.engine.is_observe_mode_enabled());
        assert_eq!(h.driver.count(|c| *c == ControllerCommand::SetObserveMode(true)), 1);

        h.engine.on_nfc_state_changed(false).await;
        h.engine.on_activated(Technology::IsoDep);
        assert_eq!(h.engine.state(), HostState::Deactivated);
    }
}
