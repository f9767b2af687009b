//! The device registry: one point of truth for which devices exist and which
//! satisfy caller interest, decoupled from how they were found.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use castssdp::{
    DiscoveryFilter, DiscoveryProvider, DiscoveryProviderListener, ServiceAnnouncement,
    SsdpDiscoveryProvider,
};

use crate::dispatch::Dispatcher;
use crate::model::{Device, DeviceServiceEntry};
use crate::services::{DeviceServiceFactory, MediaRendererFactory, WebSocketTvFactory};
use crate::store::{DeviceStore, MemoryDeviceStore};

/// Provider key of the built-in SSDP transport.
pub const SSDP_PROVIDER_KEY: &str = "ssdp";

/// Local-network availability seam. Platform connectivity broadcasts stay
/// external; hosts call `on_network_connected`/`on_network_disconnected` on
/// the registry themselves.
pub trait NetworkMonitor: Send + Sync {
    fn local_address(&self) -> Option<IpAddr>;
}

/// Default monitor backed by interface enumeration.
#[derive(Debug, Default)]
pub struct IfAddrsMonitor;

impl NetworkMonitor for IfAddrsMonitor {
    fn local_address(&self) -> Option<IpAddr> {
        for iface in get_if_addrs::get_if_addrs().ok()? {
            let ip = iface.ip();
            if let IpAddr::V4(v4) = ip {
                if !v4.is_loopback() {
                    return Some(ip);
                }
            }
        }
        None
    }
}

/// Device-level events fanned out to registry observers. Callbacks arrive on
/// the dispatch thread, in the same relative order for every observer.
pub trait RegistryObserver: Send + Sync {
    fn device_added(&self, device: &Device);
    fn device_updated(&self, device: &Device);
    fn device_removed(&self, device: &Device);
    fn discovery_failed(&self, message: &str);
}

struct ProviderEntry {
    key: String,
    provider: Arc<dyn DiscoveryProvider>,
    filters: Vec<DiscoveryFilter>,
}

pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    monitor: Arc<dyn NetworkMonitor>,
    dispatcher: Dispatcher,
    observers: Mutex<Vec<Arc<dyn RegistryObserver>>>,
    factories: Mutex<HashMap<String, Arc<dyn DeviceServiceFactory>>>,
    providers: Mutex<Vec<ProviderEntry>>,
    /// Raw-announcement map, keyed by IP alone.
    all_devices: Mutex<HashMap<String, Device>>,
    /// Consolidated map, keyed by (friendly name, IP).
    compatible: Mutex<HashMap<String, Device>>,
    searching: AtomicBool,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>, monitor: Arc<dyn NetworkMonitor>) -> Arc<Self> {
        Arc::new(Self {
            store,
            monitor,
            dispatcher: Dispatcher::new(),
            observers: Mutex::new(Vec::new()),
            factories: Mutex::new(HashMap::new()),
            providers: Mutex::new(Vec::new()),
            all_devices: Mutex::new(HashMap::new()),
            compatible: Mutex::new(HashMap::new()),
            searching: AtomicBool::new(false),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(Arc::new(MemoryDeviceStore::new()), Arc::new(IfAddrsMonitor))
    }

    /// Subscribe an observer. The current compatible set is replayed to it
    /// (one add per device) before it sees any future event.
    pub fn add_observer(self: &Arc<Self>, observer: Arc<dyn RegistryObserver>) {
        let registry = Arc::clone(self);
        self.dispatcher.post(move || {
            let snapshot: Vec<Device> = registry.compatible.lock().values().cloned().collect();
            for device in &snapshot {
                observer.device_added(device);
            }
            registry.observers.lock().push(observer);
        });
    }

    /// Associate a control-protocol factory with a discovery provider.
    /// The provider is created (and subscribed) on first use; re-registering
    /// the same service on an existing provider is idempotent.
    pub fn register_device_service(
        self: &Arc<Self>,
        factory: Arc<dyn DeviceServiceFactory>,
        provider_key: &str,
        make_provider: impl FnOnce() -> Arc<dyn DiscoveryProvider>,
    ) {
        let filter = factory.discovery_filter();
        self.factories
            .lock()
            .insert(factory.service_id().to_string(), factory);

        let mut providers = self.providers.lock();
        let idx = match providers.iter().position(|e| e.key == provider_key) {
            Some(idx) => idx,
            None => {
                let provider = make_provider();
                provider.add_listener(Arc::new(ProviderBridge {
                    registry: Arc::downgrade(self),
                }));
                if self.searching.load(Ordering::SeqCst) {
                    provider.start();
                }
                providers.push(ProviderEntry {
                    key: provider_key.to_string(),
                    provider,
                    filters: Vec::new(),
                });
                providers.len() - 1
            }
        };

        let entry = &mut providers[idx];
        if entry.filters.contains(&filter) {
            debug!("Filter for {} already registered", filter.service_id);
            return;
        }
        entry.filters.push(filter.clone());
        entry.provider.add_filter(filter);
    }

    /// The built-in service set, all on the SSDP transport.
    pub fn register_default_services(self: &Arc<Self>) {
        self.register_device_service(
            Arc::new(WebSocketTvFactory::default()),
            SSDP_PROVIDER_KEY,
            || Arc::new(SsdpDiscoveryProvider::new()),
        );
        self.register_device_service(Arc::new(MediaRendererFactory), SSDP_PROVIDER_KEY, || {
            Arc::new(SsdpDiscoveryProvider::new())
        });
    }

    /// Remove a service's filter; a provider left with no filters is stopped
    /// and discarded.
    pub fn unregister_device_service(&self, service_id: &str) {
        let factory = self.factories.lock().remove(service_id);
        let Some(factory) = factory else {
            return;
        };
        let filter = factory.discovery_filter();

        let mut providers = self.providers.lock();
        for entry in providers.iter_mut() {
            if let Some(pos) = entry.filters.iter().position(|f| f == &filter) {
                entry.filters.remove(pos);
                entry.provider.remove_filter(&filter);
            }
        }
        providers.retain(|entry| {
            if entry.filters.is_empty() {
                debug!("Provider {} has no filters left, discarding", entry.key);
                entry.provider.stop();
                false
            } else {
                true
            }
        });
    }

    /// Idempotent. Instantiates the default service set when nothing was
    /// registered, then starts every provider. Without a local network the
    /// observers get one discovery-failed event and no provider starts.
    pub fn start(self: &Arc<Self>) {
        if self.searching.swap(true, Ordering::SeqCst) {
            debug!("Discovery already running");
            return;
        }

        if self.providers.lock().is_empty() {
            self.register_default_services();
        }

        if self.monitor.local_address().is_none() {
            warn!("No active network connection, discovery not started");
            self.emit(move |o| o.discovery_failed("no active network connection"));
            return;
        }

        info!("🔍 Device discovery started");
        for entry in self.providers.lock().iter() {
            entry.provider.start();
        }
    }

    pub fn stop(&self) {
        if !self.searching.swap(false, Ordering::SeqCst) {
            return;
        }
        for entry in self.providers.lock().iter() {
            entry.provider.stop();
        }
        info!("Device discovery stopped");
    }

    pub fn is_searching(&self) -> bool {
        self.searching.load(Ordering::SeqCst)
    }

    pub fn compatible_devices(&self) -> Vec<Device> {
        self.compatible.lock().values().cloned().collect()
    }

    /// Local link restored: re-issue searches without clearing known state.
    pub fn on_network_connected(&self) {
        if !self.searching.load(Ordering::SeqCst) {
            return;
        }
        info!("Network restored, restarting discovery");
        for entry in self.providers.lock().iter() {
            entry.provider.restart();
        }
    }

    /// Local link lost: reset providers and forget every tracked device.
    pub fn on_network_disconnected(self: &Arc<Self>) {
        info!("Network lost, clearing device state");
        for entry in self.providers.lock().iter() {
            entry.provider.reset();
        }
        self.all_devices.lock().clear();

        let removed: Vec<Device> = {
            let mut compatible = self.compatible.lock();
            compatible.drain().map(|(_, d)| d).collect()
        };
        for device in removed {
            for entry in device.services.values() {
                entry.service.disconnect();
            }
            self.emit_removed(device);
        }
    }

    /// Consolidate one provider announcement into the device map.
    fn on_service_added(self: &Arc<Self>, announcement: &ServiceAnnouncement) {
        let factory = self.factories.lock().get(&announcement.service_id).cloned();
        let Some(factory) = factory else {
            debug!("No factory for service id {}", announcement.service_id);
            return;
        };

        let raw_key = Device::raw_key(announcement);
        // Check-then-act stays under the map lock so concurrent providers
        // cannot create the same device twice.
        let (device, prior_key) = {
            let mut all = self.all_devices.lock();
            let prior_key = all.get(&raw_key).map(|d| d.compatible_key());
            let mut device = match all.get(&raw_key) {
                Some(d) => d.clone(),
                None => match self.store.get_device(&announcement.uuid) {
                    Some(d) => {
                        debug!("Rehydrated known device {}", announcement.uuid);
                        d
                    }
                    None => Device::from_announcement(announcement),
                },
            };
            device.absorb(announcement);

            if factory.accepts(announcement) {
                let config = self.store.get_service_config(announcement);
                let service = factory.create(announcement, config);
                device.attach_service(DeviceServiceEntry {
                    announcement: announcement.clone(),
                    service,
                });
            }

            if device.services.is_empty() {
                // Rejected with nothing else attached; forget it entirely.
                all.remove(&raw_key);
                return;
            }
            all.insert(raw_key, device.clone());
            (device, prior_key)
        };

        self.store.update_device(&device);

        let compatible_key = device.compatible_key();
        let existed = {
            let mut compatible = self.compatible.lock();
            if let Some(prior) = prior_key {
                if prior != compatible_key {
                    compatible.remove(&prior);
                }
            }
            compatible
                .insert(compatible_key, device.clone())
                .is_some()
        };

        if existed {
            self.emit_updated(device);
        } else {
            info!("✅ Device found: {} at {}", device.friendly_name, device.ip);
            self.emit_added(device);
        }
    }

    fn on_service_removed(self: &Arc<Self>, announcement: &ServiceAnnouncement) {
        let mut all = self.all_devices.lock();
        let raw_key = Device::raw_key(announcement);
        let Some(mut device) = all.remove(&raw_key) else {
            return;
        };

        let Some(removed) = device.remove_service(&announcement.service_id) else {
            all.insert(raw_key, device);
            return;
        };
        removed.service.disconnect();

        if device.services.is_empty() {
            drop(all);
            self.compatible.lock().remove(&device.compatible_key());
            info!("Device lost: {} at {}", device.friendly_name, device.ip);
            self.emit_removed(device);
        } else {
            all.insert(raw_key, device.clone());
            drop(all);
            self.compatible
                .lock()
                .insert(device.compatible_key(), device.clone());
            self.emit_updated(device);
        }
    }

    /// Blocks until all queued observer callbacks have been delivered.
    pub fn flush_events(&self) {
        self.dispatcher.flush();
    }

    fn emit(self: &Arc<Self>, f: impl Fn(&dyn RegistryObserver) + Send + 'static) {
        let registry = Arc::clone(self);
        self.dispatcher.post(move || {
            let observers = registry.observers.lock().clone();
            for observer in &observers {
                f(observer.as_ref());
            }
        });
    }

    fn emit_added(self: &Arc<Self>, device: Device) {
        self.emit(move |o| o.device_added(&device));
    }

    fn emit_updated(self: &Arc<Self>, device: Device) {
        self.emit(move |o| o.device_updated(&device));
    }

    fn emit_removed(self: &Arc<Self>, device: Device) {
        self.emit(move |o| o.device_removed(&device));
    }
}

/// Adapts provider-level events onto the registry without keeping it alive.
struct ProviderBridge {
    registry: Weak<DeviceRegistry>,
}

impl DiscoveryProviderListener for ProviderBridge {
    fn service_added(&self, announcement: &ServiceAnnouncement) {
        if let Some(registry) = self.registry.upgrade() {
            registry.on_service_added(announcement);
        }
    }

    fn service_removed(&self, announcement: &ServiceAnnouncement) {
        if let Some(registry) = self.registry.upgrade() {
            registry.on_service_removed(announcement);
        }
    }

    fn discovery_failed(&self, message: &str) {
        if let Some(registry) = self.registry.upgrade() {
            let message = message.to_string();
            registry.emit(move |o| o.discovery_failed(&message));
        }
    }
}
