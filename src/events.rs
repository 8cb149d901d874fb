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

//! Messages processed by the manager event loop.

use crate::controller::ControllerEvent;
use crate::error::Result;
use crate::host_emulation::ServiceEndpoint;
use crate::service::{ComponentName, UserId};
use std::sync::Arc;

/// Event posted to the manager loop.
pub enum Event {
    /// The service set of a user changed.
    ServicesUpdated { user_id: UserId },
    /// Notification received from the controller.
    Controller(ControllerEvent),
    /// Completion of an asynchronous host emulation operation.
    Engine(EngineEvent),
}

/// Completion of a task spawned by the host emulation engine. Every
/// completion carries the session generation it was started in; stale
/// completions are dropped.
pub enum EngineEvent {
    Bound {
        session: u64,
        component: ComponentName,
        result: Result<Arc<dyn ServiceEndpoint>>,
    },
    Response {
        session: u64,
        result: Result<Vec<u8>>,
    },
    PaymentBound {
        component: ComponentName,
        result: Result<Arc<dyn ServiceEndpoint>>,
    },
}

impl From<ControllerEvent> for Event {
    fn from(event: ControllerEvent) -> Self {
        Event::Controller(event)
    }
}

impl From<EngineEvent> for Event {
    fn from(event: EngineEvent) -> Self {
        Event::Engine(event)
    }
}
