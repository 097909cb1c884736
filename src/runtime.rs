//! Everything the hook needs after bootstrap, assembled from a [`Config`].

use crate::card::{Card, CardSource, EamIoLibrary, StaticCards};
use crate::config::Config;
use crate::eamuse::Eamuse;
use crate::emu::chart_patch::{ChartPatch, RefreshRate};
use crate::emu::ezusb::{self, EzusbEmulator, IdleIo, IidxIoLibrary, IoBackend};
use crate::emu::serial::{CardReader, SerialPortEmulator};
use crate::emu::settings::SettingsRedirect;
use crate::iohook::Handler;
use crate::security::SecurityToken;
use crate::setupapi::DeviceInterface;
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct Runtime {
    pub config: Config,
    pub token: Arc<Mutex<SecurityToken>>,
    pub eamuse: Eamuse,
    pub refresh_rate: Arc<RefreshRate>,
    pub card_reader: Option<Arc<Mutex<CardReader>>>,
}

impl Runtime {
    /// Validate `config` and seed all shared device state. Nothing here
    /// touches the network.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let seed = config.token_seed().context("Invalid security settings")?;
        let token = Arc::new(Mutex::new(SecurityToken::seeded(seed)));

        let eamuse = Eamuse::new();
        eamuse.set_addr(config.server_addr().context("Invalid eAmusement server")?);

        let card_reader = if config.card_reader.enabled {
            let source = card_source(&config)?;
            let enabled = config.card_reader.slots.iter().map(|s| s.enabled).collect();
            Some(Arc::new(Mutex::new(CardReader::new(enabled, source))))
        } else {
            None
        };

        let refresh_rate = Arc::new(RefreshRate::new(config.chart_patch.refresh_rate));

        Ok(Self {
            config,
            token,
            eamuse,
            refresh_rate,
            card_reader,
        })
    }

    /// Check the network service; the result is informational only.
    pub fn check_network(&self) -> bool {
        self.eamuse.check_connection()
    }

    /// Panel backend for the USB bridge: the configured `iidxio` library,
    /// or idle inputs.
    pub fn io_backend(&self) -> Result<Arc<dyn IoBackend>> {
        match &self.config.ezusb.io_library {
            Some(path) => {
                let library = IidxIoLibrary::load(path)
                    .with_context(|| format!("Failed to load iidxio library {}", path.display()))?;
                Ok(Arc::new(library))
            }
            None => Ok(Arc::new(IdleIo)),
        }
    }

    /// Device interfaces the host may enumerate to find emulated hardware.
    pub fn device_interfaces(&self) -> Vec<DeviceInterface> {
        let config = &self.config.ezusb;
        if config.enabled {
            vec![ezusb::device_interface(config.vendor_id, config.product_id)]
        } else {
            Vec::new()
        }
    }

    /// The dispatch chain in priority order: USB bridge, serial port, chart
    /// patch, settings redirect. Disabled emulators are left out.
    pub fn handlers(&self, io: Arc<dyn IoBackend>) -> Vec<Handler> {
        let mut handlers = Vec::new();
        let config = &self.config;

        if config.ezusb.enabled {
            let nodes =
                EzusbEmulator::standard_nodes(Arc::clone(&self.token), self.card_reader.clone());
            handlers.push(Handler::UsbBridge(EzusbEmulator::new(
                config.ezusb.vendor_id,
                config.ezusb.product_id,
                config.ezusb.device_alias.clone(),
                nodes,
                io,
            )));
        }

        if let Some(reader) = &self.card_reader {
            handlers.push(Handler::SerialPort(SerialPortEmulator::new(
                config.card_reader.port.clone(),
                Arc::clone(reader),
            )));
        }

        if config.chart_patch.enabled {
            handlers.push(Handler::ChartPatch(ChartPatch::new(
                config.chart_patch.timebase,
                Arc::clone(&self.refresh_rate),
            )));
        }

        if config.settings.enabled {
            handlers.push(Handler::Settings(SettingsRedirect::new(
                config.settings.root.clone(),
                &config.settings.drives,
            )));
        }

        info!(
            "Handler chain: {}",
            handlers.iter().map(Handler::name).collect::<Vec<_>>().join(", ")
        );
        handlers
    }
}

fn card_source(config: &Config) -> Result<Box<dyn CardSource>> {
    if let Some(path) = &config.card_reader.eamio_library {
        let library = EamIoLibrary::load(path)
            .with_context(|| format!("Failed to load eamio library {}", path.display()))?;
        return Ok(Box::new(library));
    }

    let ids = config.card_ids().context("Invalid card ids")?;
    let cards = config
        .card_reader
        .slots
        .iter()
        .enumerate()
        .map(|(slot, slot_config)| {
            ids.get(slot).copied().flatten().map(|id| Card {
                id,
                kind: slot_config.card_type,
            })
        })
        .collect();
    Ok(Box::new(StaticCards::new(cards)))
}
