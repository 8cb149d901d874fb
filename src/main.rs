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

//! Host card emulation daemon.
//!
//! Serves one NFC controller connection at a time. Controller events and
//! commands are exchanged as packets framed with their byte size encoded as
//! little-endian u16.

use anyhow::{Context, Result};
use argh::FromArgs;
use futures::future::BoxFuture;
use futures::FutureExt;
use nfc_hce::aid::{Aid, AidGroup, Category};
use nfc_hce::config::Config;
use nfc_hce::controller::{
    ControllerCapabilities, ControllerCommand, ControllerDriver, ControllerEvent, DefaultRoutes,
};
use nfc_hce::host_emulation::{DeactivationReason, ServiceBinder, ServiceEndpoint};
use nfc_hce::listeners::NfcEventListener;
use nfc_hce::manager::{CardEmulationManager, Environment, MemorySettingsStore};
use nfc_hce::polling_loop::PollingFrame;
use nfc_hce::registry::PackageSource;
use nfc_hce::routing_table::RoutingEntry;
use nfc_hce::service::{ComponentName, SecureElement, ServiceInfo, Uid, UserId};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp, TcpListener};
use tokio::select;
use tokio::sync::mpsc;

/// Read controller packets from the transport.
pub struct FrameReader {
    socket: tcp::OwnedReadHalf,
}

/// Write controller packets to the transport.
pub struct FrameWriter {
    socket: tcp::OwnedWriteHalf,
}

impl FrameReader {
    pub fn new(socket: tcp::OwnedReadHalf) -> Self {
        FrameReader { socket }
    }

    /// Read a single packet from the reader.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        const HEADER_SIZE: usize = 2;
        let mut header_bytes = [0; HEADER_SIZE];
        self.socket.read_exact(&mut header_bytes).await?;
        let packet_length = u16::from_le_bytes(header_bytes) as usize;

        let mut packet_bytes = vec![0; packet_length];
        self.socket.read_exact(&mut packet_bytes).await?;
        Ok(packet_bytes)
    }
}

impl FrameWriter {
    pub fn new(socket: tcp::OwnedWriteHalf) -> Self {
        FrameWriter { socket }
    }

    /// Write a single packet to the writer.
    pub async fn write(&mut self, packet: &[u8]) -> Result<()> {
        let packet_length: u16 = packet.len().try_into()?;
        self.socket.write_all(&packet_length.to_le_bytes()).await?;
        self.socket.write_all(packet).await?;
        Ok(())
    }
}

/// Controller driver queueing encoded commands for the transport.
/// Commands are acknowledged once queued.
struct TransportDriver {
    capabilities: ControllerCapabilities,
    commands: mpsc::UnboundedSender<Vec<u8>>,
}

impl TransportDriver {
    fn send(&self, command: ControllerCommand) -> BoxFuture<'_, nfc_hce::Result<()>> {
        let result = self
            .commands
            .send(command.into())
            .map_err(|_| nfc_hce::Error::Internal("controller transport is closed".to_string()));
        async move { result }.boxed()
    }
}

impl ControllerDriver for TransportDriver {
    fn capabilities(&self) -> ControllerCapabilities {
        self.capabilities
    }

    fn configure_routing<'a>(
        &'a self,
        entries: &'a BTreeMap<Aid, RoutingEntry>,
        force: bool,
    ) -> BoxFuture<'a, nfc_hce::Result<()>> {
        let mut tlvs = vec![];
        for entry in entries.values() {
            entry.encode(&mut tlvs);
        }
        self.send(ControllerCommand::ConfigureRouting { force, tlvs })
    }

    fn set_default_routes(&self, routes: DefaultRoutes) -> BoxFuture<'_, nfc_hce::Result<()>> {
        self.send(ControllerCommand::SetDefaultRoutes(routes))
    }

    fn commit_routing(&self) -> BoxFuture<'_, nfc_hce::Result<()>> {
        self.send(ControllerCommand::CommitRouting)
    }

    fn send_data(&self, response: Vec<u8>) -> BoxFuture<'_, nfc_hce::Result<()>> {
        self.send(ControllerCommand::Data(response))
    }

    fn set_observe_mode(&self, enable: bool) -> BoxFuture<'_, nfc_hce::Result<()>> {
        self.send(ControllerCommand::SetObserveMode(enable))
    }

    fn allow_auto_transact(&self) -> BoxFuture<'_, nfc_hce::Result<()>> {
        self.send(ControllerCommand::AllowAutoTransact)
    }

    fn set_nfc_enabled(&self, enable: bool) -> BoxFuture<'_, nfc_hce::Result<()>> {
        self.send(ControllerCommand::SetNfcEnabled(enable))
    }
}

/// Host service answering every command with `90 00`.
struct LoopbackEndpoint {
    component: ComponentName,
}

impl ServiceEndpoint for LoopbackEndpoint {
    fn component(&self) -> &ComponentName {
        &self.component
    }

    fn process_command_apdu(&self, apdu: Vec<u8>) -> BoxFuture<'static, nfc_hce::Result<Vec<u8>>> {
        log::info!("{} <- {}", self.component, hex::encode_upper(&apdu));
        async { Ok(vec![0x90, 0x00]) }.boxed()
    }

    fn on_deactivated(&self, reason: DeactivationReason) {
        log::info!("{} deactivated ({:?})", self.component, reason);
    }

    fn process_polling_frames(&self, frames: Vec<PollingFrame>) {
        log::info!("{} received {} polling frames", self.component, frames.len());
    }
}

struct LoopbackBinder;

impl ServiceBinder for LoopbackBinder {
    fn bind(
        &self,
        service: Arc<ServiceInfo>,
    ) -> BoxFuture<'static, nfc_hce::Result<Arc<dyn ServiceEndpoint>>> {
        let endpoint: Arc<dyn ServiceEndpoint> =
            Arc::new(LoopbackEndpoint { component: service.component.clone() });
        async move { Ok(endpoint) }.boxed()
    }
}

/// Services declared on the command line, all owned by user 0.
struct StaticPackages {
    services: Vec<ServiceInfo>,
}

impl PackageSource for StaticPackages {
    fn installed_services(&self, user_id: UserId) -> Vec<ServiceInfo> {
        self.services.iter().filter(|s| s.user_id == user_id).cloned().collect()
    }
}

/// Every application is considered in the foreground.
struct Foreground;

impl Environment for Foreground {
    fn is_in_foreground(&self, _uid: Uid) -> bool {
        true
    }

    fn user_activity(&self) {
        log::trace!("user activity");
    }
}

struct LogListener;

impl NfcEventListener for LogListener {
    fn on_preferred_service_changed(&self, user_id: UserId, component: Option<&ComponentName>) {
        match component {
            Some(component) => log::info!("preferred service of user {} is {}", user_id, component),
            None => log::info!("user {} has no preferred service", user_id),
        }
    }

    fn on_aid_conflict(&self, aid: &Aid) {
        log::warn!("AID {} is claimed by several services", aid);
    }

    fn on_aid_not_routed(&self, aid: &Aid) {
        log::warn!("AID {} does not fit in the routing table", aid);
    }

    fn on_internal_error(&self, error: &nfc_hce::Error) {
        log::error!("internal error: {}", error);
    }
}

/// Parse `package/Class:uid:category:AID[,AID...]`.
fn parse_service(spec: &str) -> Result<ServiceInfo> {
    let fields: Vec<&str> = spec.split(':').collect();
    let [component, uid, category, aids] = fields.as_slice() else {
        anyhow::bail!("expected package/Class:uid:category:AIDs, got {:?}", spec)
    };
    let component: ComponentName = component.parse()?;
    let uid: Uid = uid.parse().with_context(|| format!("invalid uid in {:?}", spec))?;
    let category: Category = category.parse()?;
    let aids: Vec<&str> = aids.split(',').filter(|aid| !aid.is_empty()).collect();
    Ok(ServiceInfo::new(component, uid, 0).with_group(AidGroup::parse(category, &aids)?))
}

/// Apply `package/Class=eSE1` to the declared services.
fn apply_off_host(services: &mut [ServiceInfo], spec: &str) -> Result<()> {
    let (component, secure_element) = spec
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected package/Class=SE, got {:?}", spec))?;
    let component: ComponentName = component.parse()?;
    let secure_element: SecureElement = secure_element.parse()?;
    let service = services
        .iter_mut()
        .find(|s| s.component == component)
        .ok_or_else(|| anyhow::anyhow!("{} is not declared with --service", component))?;
    service.on_host = false;
    service.static_off_host = Some(secure_element);
    Ok(())
}

#[derive(FromArgs, Debug)]
/// Host card emulation daemon.
struct Opt {
    #[argh(option, default = "7100")]
    /// configure the TCP port for the controller connection.
    port: u16,
    #[argh(switch)]
    /// the controller accepts prefix AID entries.
    supports_prefix: bool,
    #[argh(switch)]
    /// the controller accepts subset AID entries.
    supports_subset: bool,
    #[argh(option, default = "nfc_hce::controller::MAX_ROUTING_TABLE_SIZE")]
    /// capacity of the listen mode routing table, in bytes.
    max_routing_table_size: usize,
    #[argh(option)]
    /// declare a service as package/Class:uid:category:AID[,AID...].
    service: Vec<String>,
    #[argh(option)]
    /// route a declared service off host, as package/Class=eSE1.
    off_host: Vec<String>,
    #[argh(option)]
    /// package holding the wallet role.
    wallet_holder: Option<String>,
}

/// Forward controller events to the manager and queued commands to the
/// controller until the connection drops.
async fn serve(
    manager: &CardEmulationManager,
    mut reader: FrameReader,
    mut writer: FrameWriter,
    commands: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<()> {
    let result: Result<((), ())> = futures::future::try_join(
        async {
            loop {
                let packet = reader.read().await?;
                match ControllerEvent::parse(&packet) {
                    Ok(event) => manager.post(event),
                    Err(err) => log::warn!("dropping controller packet: {}", err),
                }
            }
        },
        async {
            loop {
                let command =
                    commands.recv().await.ok_or(anyhow::anyhow!("command channel closed"))?;
                writer.write(&command).await?;
            }
        },
    )
    .await;
    result?;
    Ok(())
}

async fn run() -> Result<()> {
    let opt: Opt = argh::from_env();
    let mut services = opt.service.iter().map(|spec| parse_service(spec)).collect::<Result<Vec<_>>>()?;
    for spec in &opt.off_host {
        apply_off_host(&mut services, spec)?;
    }

    let capabilities = ControllerCapabilities {
        supports_prefix: opt.supports_prefix,
        supports_subset: opt.supports_subset,
        max_routing_table_size: opt.max_routing_table_size,
    };
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let (manager, events) = CardEmulationManager::new(
        Config::default(),
        Arc::new(StaticPackages { services }),
        Arc::new(TransportDriver { capabilities, commands: commands_tx }),
        Arc::new(LoopbackBinder),
        Arc::new(Foreground),
        Arc::new(MemorySettingsStore::default()),
    );
    manager.listeners().register(Arc::new(LogListener));
    let mut manager_task = tokio::spawn(manager.clone().run(events));
    manager.registry().invalidate(0, true);
    if let Some(holder) = opt.wallet_holder {
        manager.set_wallet_holder(0, Some(holder)).await?;
    }

    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, opt.port)).await?;
    log::info!("Listening for controller connections at address 127.0.0.1:{}", opt.port);
    loop {
        select! {
            result = listener.accept() => {
                let (socket, addr) = result?;
                log::info!("Accepted controller connection from {}", addr);
                while commands_rx.try_recv().is_ok() {}
                let (socket_rx, socket_tx) = socket.into_split();
                if let Err(err) = manager.commit_routing().await {
                    log::warn!("failed to queue the routing table: {}", err);
                }
                if let Err(err) = serve(
                    &manager,
                    FrameReader::new(socket_rx),
                    FrameWriter::new(socket_tx),
                    &mut commands_rx,
                )
                .await
                {
                    log::info!("Controller {} disconnected: {}", addr, err);
                }
                manager.post(ControllerEvent::Deactivated);
            },
            result = &mut manager_task => {
                result?;
                anyhow::bail!("card emulation manager stopped");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "debug"),
    );
    run().await
}
