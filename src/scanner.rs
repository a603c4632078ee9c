use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::str::FromStr as _;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context as _, bail};
use log::{debug, info, warn};
use mac_address::MacAddress;
use serde_derive::Deserialize;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::DeviceFilter;
use crate::manager::Shutdown;
use crate::messages::{DeviceId, EventSource, PresenceEvent};

/// Source of the full list of currently associated clients.
pub trait RosterSource: Send + Sync + 'static {
    fn online_devices(&self) -> impl Future<Output = anyhow::Result<Vec<MacAddress>>> + Send;
}

/// Hands normalized events to the reconciler, dropping filtered devices.
///
/// Clones share one filter, so [`EventSink::set_filter`] applies to every
/// producer at once.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<PresenceEvent>,
    filter: Arc<RwLock<DeviceFilter>>,
    ap_name: Option<String>,
}

impl EventSink {
    pub fn new(
        tx: mpsc::Sender<PresenceEvent>,
        filter: DeviceFilter,
        ap_name: Option<String>,
    ) -> Self {
        EventSink {
            tx,
            filter: Arc::new(RwLock::new(filter)),
            ap_name,
        }
    }

    pub fn device_id(&self, mac: MacAddress) -> DeviceId {
        DeviceId::new(mac, self.ap_name.as_deref())
    }

    pub fn should_handle(&self, mac: &MacAddress) -> bool {
        let filter = self.filter.read().unwrap_or_else(PoisonError::into_inner);
        filter.should_handle(mac)
    }

    pub fn set_filter(&self, filter: DeviceFilter) {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    /// Returns false once the reconciler has gone away.
    pub async fn emit(&self, id: DeviceId, present: bool, source: EventSource) -> bool {
        if !self.should_handle(&id.mac()) {
            debug!("Ignoring filtered device {}", id);
            return true;
        }
        self.tx
            .send(PresenceEvent::now(id, present, source))
            .await
            .is_ok()
    }
}

#[derive(Deserialize, Debug)]
struct ClientsResponse {
    clients: HashMap<String, serde_json::Value>,
}

/// Parse the output of `ubus call <iface> get_clients`.
fn parse_clients(json: &str) -> anyhow::Result<Vec<MacAddress>> {
    let response: ClientsResponse = serde_json::from_str(json)?;
    let mut devices = Vec::with_capacity(response.clients.len());
    for address in response.clients.keys() {
        match MacAddress::from_str(address) {
            Ok(mac) => devices.push(mac),
            Err(err) => debug!("Skipping client {:?}: {}", address, err),
        }
    }
    Ok(devices)
}

#[derive(Deserialize, Debug)]
struct Station {
    address: String,
}

#[derive(Deserialize, Debug)]
struct StationEvent {
    assoc: Option<Station>,
    disassoc: Option<Station>,
}

/// Parse one line of `ubus subscribe <iface>` output into a join (`true`) or
/// leave (`false`).
fn parse_event_line(line: &str) -> Option<(MacAddress, bool)> {
    let event: StationEvent = serde_json::from_str(line).ok()?;
    let (station, present) = match (event.assoc, event.disassoc) {
        (Some(station), _) => (station, true),
        (None, Some(station)) => (station, false),
        (None, None) => return None,
    };
    match MacAddress::from_str(station.address.trim()) {
        Ok(mac) => Some((mac, present)),
        Err(err) => {
            debug!("Bad station address {:?}: {}", station.address, err);
            None
        }
    }
}

/// How to invoke `ubus`: the program plus any arguments that come before the
/// subcommand.
#[derive(Debug, Clone)]
pub struct UbusCommand {
    program: String,
    args: Vec<String>,
}

impl Default for UbusCommand {
    fn default() -> Self {
        UbusCommand {
            program: "ubus".to_string(),
            args: Vec::new(),
        }
    }
}

impl UbusCommand {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        UbusCommand {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    fn command<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).args(args);
        command
    }
}

/// Talks to hostapd through the `ubus` command line tool.
#[derive(Debug, Clone)]
pub struct Ubus {
    command: UbusCommand,
    interfaces: Vec<String>,
}

impl Ubus {
    pub fn new(interfaces: Vec<String>) -> Self {
        Ubus {
            command: UbusCommand::default(),
            interfaces,
        }
    }

    pub fn with_command(mut self, command: UbusCommand) -> Self {
        self.command = command;
        self
    }

    async fn clients(&self, interface: &str) -> anyhow::Result<Vec<MacAddress>> {
        let output = self
            .command
            .command(["call", interface, "get_clients"])
            .output()
            .await
            .context("running ubus")?;
        if !output.status.success() {
            bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
        }
        parse_clients(&String::from_utf8_lossy(&output.stdout))
    }
}

impl RosterSource for Ubus {
    /// Union of the clients of every interface. Fails only when no interface
    /// could be queried.
    async fn online_devices(&self) -> anyhow::Result<Vec<MacAddress>> {
        let mut devices = Vec::new();
        let mut any_ok = false;
        for interface in &self.interfaces {
            match self.clients(interface).await {
                Ok(clients) => {
                    any_ok = true;
                    devices.extend(clients);
                }
                Err(err) => warn!("Error running ubus for interface {}: {:#}", interface, err),
            }
        }
        if !any_ok {
            bail!("no interface could be queried");
        }
        devices.sort_by_key(|mac| mac.bytes());
        devices.dedup();
        Ok(devices)
    }
}

/// Follows assoc/disassoc notifications of one interface, resubscribing
/// whenever `ubus subscribe` fails or exits.
pub struct Watcher {
    command: UbusCommand,
    interface: String,
    sink: EventSink,
    resubscribe_delay: Duration,
}

impl Watcher {
    pub fn new(interface: String, sink: EventSink) -> Self {
        Watcher {
            command: UbusCommand::default(),
            interface,
            sink,
            resubscribe_delay: Duration::from_secs(1),
        }
    }

    pub fn with_command(mut self, command: UbusCommand) -> Self {
        self.command = command;
        self
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        info!("Watching {}", self.interface);
        while !shutdown.is_triggered() {
            match self.subscribe(&mut shutdown).await {
                Ok(()) => debug!("ubus subscribe {} ended", self.interface),
                Err(err) => debug!("ubus subscribe {} failed: {:#}", self.interface, err),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
                _ = shutdown.wait() => {}
            }
        }
        debug!("Watcher for {} stopped", self.interface);
    }

    async fn subscribe(&self, shutdown: &mut Shutdown) -> anyhow::Result<()> {
        let mut child = self
            .command
            .command(["subscribe", self.interface.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawning ubus")?;
        let stdout = child.stdout.take().context("ubus stdout not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if !self.handle_line(&line).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }

        child.kill().await.ok();
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> bool {
        let Some((mac, present)) = parse_event_line(line) else {
            return true;
        };
        let id = self.sink.device_id(mac);
        debug!("{} {} on {}", if present { "Join" } else { "Leave" }, id, self.interface);
        self.sink.emit(id, present, EventSource::Realtime).await
    }
}
