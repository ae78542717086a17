//! Daemon state: the device list and what happens on startup and per event

use driverd_types::DeviceRecord;
use std::io::{BufRead, Seek};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::enumerate::{DeviceList, DeviceSource};
use crate::error::DaemonError;
use crate::event::{DevdEvent, EventSystem};
use crate::ids::IdDatabase;
use crate::netstart::NetStart;
use crate::orchestrator::Orchestrator;

pub struct Daemon<R> {
    orchestrator: Orchestrator<R>,
    source: Arc<dyn DeviceSource>,
    ids: IdDatabase,
    netstart: Option<NetStart>,
    devices: DeviceList,
}

impl<R: BufRead + Seek> Daemon<R> {
    pub fn new(orchestrator: Orchestrator<R>, source: Arc<dyn DeviceSource>, ids: IdDatabase) -> Self {
        Self {
            orchestrator,
            source,
            ids,
            netstart: None,
            devices: DeviceList::new(),
        }
    }

    /// Bring up interfaces announced by IFNET attach events.
    pub fn with_netstart(mut self, netstart: NetStart) -> Self {
        self.netstart = Some(netstart);
        self
    }

    pub fn devices(&self) -> &DeviceList {
        &self.devices
    }

    /// Run the init hook, enumerate PCI then USB devices and process them
    /// all. Returns the number of devices found.
    pub async fn start(&mut self) -> Result<usize, DaemonError> {
        self.orchestrator.policy().hook().init().await;

        let mut records = self.source.pci_devices().await?;
        records.extend(self.source.usb_devices().await?);

        let added = self.admit(records).await;
        info!(devices = added.len(), "Initial enumeration complete");
        let count = added.len();
        self.process_range(added).await;
        Ok(count)
    }

    /// Decode and handle one raw event string.
    pub async fn handle_frame(&mut self, frame: &str) {
        match DevdEvent::parse(frame) {
            Some(event) => self.handle_event(&event).await,
            None => info!(frame, "Invalid event, ignored"),
        }
    }

    pub async fn handle_event(&mut self, event: &DevdEvent) {
        if !event.is_attach() {
            debug!(event = %event, "Ignoring event");
            return;
        }

        match event.system {
            EventSystem::Usb => match self.source.usb_devices().await {
                Ok(records) => {
                    let added = self.admit(records).await;
                    if added.is_empty() {
                        debug!(cdev = %event.cdev, "No new USB devices");
                    }
                    self.process_range(added).await;
                }
                Err(e) => warn!(cdev = %event.cdev, error = %e, "USB re-enumeration failed"),
            },
            EventSystem::Ifnet => {
                let Some(netstart) = &self.netstart else {
                    return;
                };
                if self.orchestrator.policy().dry_run() {
                    info!(ifname = %event.subsystem, "Dry run, not starting interface");
                    return;
                }
                // The outcome is logged by NetStart itself
                let _ = netstart.start(&event.subsystem).await;
            }
            EventSystem::Other => debug!(event = %event, "Ignoring event"),
        }
    }

    async fn admit(&mut self, records: Vec<DeviceRecord>) -> Range<usize> {
        let added = self.devices.admit(records);
        let hook = Arc::clone(self.orchestrator.policy().hook());
        for index in added.clone() {
            if let Some(device) = self.devices.get_mut(index) {
                self.ids.annotate(device);
                debug!(device = %device, bus = %device.bus, "New device");
                hook.on_add_device(device).await;
            }
        }
        added
    }

    async fn process_range(&mut self, range: Range<usize>) {
        for index in range {
            if let Some(device) = self.devices.get_mut(index) {
                self.orchestrator.process(device).await;
            }
        }
    }
}
