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

//! NFC event listeners.

use crate::aid::Aid;
use crate::error::Error;
use crate::service::{ComponentName, UserId};
use std::sync::{Arc, Mutex, PoisonError};

/// Observer of card emulation events. Every callback defaults to a no-op.
pub trait NfcEventListener: Send + Sync {
    fn on_preferred_service_changed(&self, user_id: UserId, component: Option<&ComponentName>) {
        let _ = (user_id, component);
    }

    /// A reader selected an AID claimed by several services with no
    /// default among them.
    fn on_aid_conflict(&self, aid: &Aid) {
        let _ = aid;
    }

    /// A registered AID is missing from the routing table.
    fn on_aid_not_routed(&self, aid: &Aid) {
        let _ = aid;
    }

    fn on_nfc_state_changed(&self, enabled: bool) {
        let _ = enabled;
    }

    fn on_remote_field_changed(&self, on: bool) {
        let _ = on;
    }

    fn on_observe_mode_state_changed(&self, enabled: bool) {
        let _ = enabled;
    }

    fn on_internal_error(&self, error: &Error) {
        let _ = error;
    }
}

type Snapshot = Arc<Vec<Arc<dyn NfcEventListener>>>;

/// Copy-on-write listener list. Broadcasts iterate over a snapshot taken
/// at dispatch time, so listeners may unregister from their callbacks.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Snapshot>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&self, listener: Arc<dyn NfcEventListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = listeners.as_ref().clone();
        next.push(listener);
        *listeners = Arc::new(next);
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unregister(&self, listener: &Arc<dyn NfcEventListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let next: Vec<_> =
            listeners.iter().filter(|l| !Arc::ptr_eq(l, listener)).cloned().collect();
        let removed = next.len() != listeners.len();
        *listeners = Arc::new(next);
        removed
    }

    pub fn snapshot(&self) -> Snapshot {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn broadcast(&self, f: impl Fn(&dyn NfcEventListener)) {
        for listener in self.snapshot().iter() {
            f(listener.as_ref())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Listener recording callbacks as strings.
    #[derive(Default)]
    pub struct RecordingListener {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event)
        }
    }

    impl NfcEventListener for RecordingListener {
        fn on_preferred_service_changed(&self, _: UserId, component: Option<&ComponentName>) {
            self.push(format!("preferred {:?}", component.map(|c| c.to_string())))
        }

        fn on_aid_conflict(&self, aid: &Aid) {
            self.push(format!("conflict {}", aid))
        }

        fn on_aid_not_routed(&self, aid: &Aid) {
            self.push(format!("not_routed {}", aid))
        }

        fn on_nfc_state_changed(&self, enabled: bool) {
            self.push(format!("nfc {}", enabled))
        }

        fn on_remote_field_changed(&self, on: bool) {
            self.push(format!("field {}", on))
        }

        fn on_observe_mode_state_changed(&self, enabled: bool) {
            self.push(format!("observe {}", enabled))
        }

        fn on_internal_error(&self, error: &Error) {
            self.push(format!("error {}", error.kind()))
        }
    }

    struct Unregistering {
        registry: Arc<ListenerRegistry>,
        this: Mutex<Option<Arc<dyn NfcEventListener>>>,
    }

    impl NfcEventListener for Unregistering {
        fn on_remote_field_changed(&self, _: bool) {
            if let Some(this) = self.this.lock().unwrap().take() {
                assert!(self.registry.unregister(&this));
            }
        }
    }

    #[test]
    fn unregister_during_broadcast() {
        let registry = Arc::new(ListenerRegistry::new());
        let recording = Arc::new(RecordingListener::default());
        let unregistering = Arc::new(Unregistering { registry: registry.clone(), this: Mutex::new(None) });
        let handle: Arc<dyn NfcEventListener> = unregistering.clone();
        *unregistering.this.lock().unwrap() = Some(handle.clone());
        registry.register(handle);
        registry.register(recording.clone());

        registry.broadcast(|l| l.on_remote_field_changed(true));
        assert_eq!(registry.snapshot().len(), 1);
        registry.broadcast(|l| l.on_remote_field_changed(false));
        assert_eq!(recording.events(), vec!["field true", "field false"]);
    }

    #[test]
    fn unregister_unknown_listener() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn NfcEventListener> = Arc::new(RecordingListener::default());
        assert!(!registry.unregister(&listener));
        registry.register(listener.clone());
        assert!(registry.unregister(&listener));
        assert!(registry.snapshot().is_empty());
    }
}
