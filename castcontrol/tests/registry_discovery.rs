//! Registry behavior against a scripted discovery provider.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use castcontrol::{
    Device, DeviceRegistry, DeviceService, DeviceServiceFactory, MemoryDeviceStore,
    NetworkMonitor, RegistryObserver, ServiceConfig,
};
use castssdp::{
    DiscoveryFilter, DiscoveryProvider, DiscoveryProviderListener, ServiceAnnouncement,
};

#[derive(Default)]
struct FakeProvider {
    listeners: Mutex<Vec<Arc<dyn DiscoveryProviderListener>>>,
    filters: Mutex<Vec<DiscoveryFilter>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    resets: AtomicUsize,
}

impl FakeProvider {
    fn announce(&self, announcement: &ServiceAnnouncement) {
        for listener in self.listeners.lock().clone() {
            listener.service_added(announcement);
        }
    }

    fn withdraw(&self, announcement: &ServiceAnnouncement) {
        for listener in self.listeners.lock().clone() {
            listener.service_removed(announcement);
        }
    }
}

impl DiscoveryProvider for FakeProvider {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
    fn scan(&self) {}
    fn add_filter(&self, filter: DiscoveryFilter) {
        self.filters.lock().push(filter);
    }
    fn remove_filter(&self, filter: &DiscoveryFilter) {
        self.filters.lock().retain(|f| f != filter);
    }
    fn is_empty(&self) -> bool {
        self.filters.lock().is_empty()
    }
    fn add_listener(&self, listener: Arc<dyn DiscoveryProviderListener>) {
        self.listeners.lock().push(listener);
    }
}

struct StubService {
    id: &'static str,
    announcement: ServiceAnnouncement,
    disconnects: Arc<AtomicUsize>,
}

impl DeviceService for StubService {
    fn service_id(&self) -> &str {
        self.id
    }
    fn announcement(&self) -> ServiceAnnouncement {
        self.announcement.clone()
    }
    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct StubFactory {
    id: &'static str,
    accept: bool,
    disconnects: Arc<AtomicUsize>,
}

impl StubFactory {
    fn new(id: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            accept: true,
            disconnects: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn rejecting(id: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            accept: false,
            disconnects: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl DeviceServiceFactory for StubFactory {
    fn service_id(&self) -> &'static str {
        self.id
    }
    fn discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter::new(self.id, "urn:test:service:1")
    }
    fn accepts(&self, _announcement: &ServiceAnnouncement) -> bool {
        self.accept
    }
    fn create(
        &self,
        announcement: &ServiceAnnouncement,
        _config: Option<ServiceConfig>,
    ) -> Arc<dyn DeviceService> {
        Arc::new(StubService {
            id: self.id,
            announcement: announcement.clone(),
            disconnects: self.disconnects.clone(),
        })
    }
}

#[derive(Default)]
struct RecObserver {
    events: Mutex<Vec<String>>,
}

impl RecObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl RegistryObserver for RecObserver {
    fn device_added(&self, device: &Device) {
        self.events.lock().push(format!("added:{}", device.friendly_name));
    }
    fn device_updated(&self, device: &Device) {
        self.events
            .lock()
            .push(format!("updated:{}", device.friendly_name));
    }
    fn device_removed(&self, device: &Device) {
        self.events
            .lock()
            .push(format!("removed:{}", device.friendly_name));
    }
    fn discovery_failed(&self, message: &str) {
        self.events.lock().push(format!("failed:{}", message));
    }
}

struct UpMonitor;
impl NetworkMonitor for UpMonitor {
    fn local_address(&self) -> Option<IpAddr> {
        Some("192.168.1.2".parse().unwrap())
    }
}

struct DownMonitor;
impl NetworkMonitor for DownMonitor {
    fn local_address(&self) -> Option<IpAddr> {
        None
    }
}

fn announcement(uuid: &str, service_id: &str, ip: &str, name: &str) -> ServiceAnnouncement {
    let mut a = ServiceAnnouncement::pending(
        uuid.to_string(),
        "urn:test:service:1".to_string(),
        ip.parse().unwrap(),
        3001,
    );
    a.service_id = service_id.to_string();
    a.friendly_name = name.to_string();
    a
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn registry_with(
    monitor: Arc<dyn NetworkMonitor>,
) -> (Arc<DeviceRegistry>, Arc<FakeProvider>, Arc<RecObserver>) {
    init_logging();
    let registry = DeviceRegistry::new(Arc::new(MemoryDeviceStore::new()), monitor);
    let provider = Arc::new(FakeProvider::default());
    let observer = Arc::new(RecObserver::default());
    registry.add_observer(observer.clone());
    registry.flush_events();
    (registry, provider, observer)
}

#[test]
fn start_and_stop_are_idempotent() {
    let (registry, provider, _observer) = registry_with(Arc::new(UpMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);

    registry.start();
    registry.start();
    assert_eq!(provider.starts.load(Ordering::SeqCst), 1);
    assert!(registry.is_searching());

    registry.stop();
    registry.stop();
    assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
    assert!(!registry.is_searching());
}

#[test]
fn missing_network_reports_discovery_failure_once() {
    let (registry, provider, observer) = registry_with(Arc::new(DownMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);

    registry.start();
    registry.flush_events();

    let failures: Vec<String> = observer
        .events()
        .into_iter()
        .filter(|e| e.starts_with("failed:"))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(provider.starts.load(Ordering::SeqCst), 0);
}

#[test]
fn same_identity_announcements_merge_into_one_device() {
    let (registry, provider, observer) = registry_with(Arc::new(UpMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-b"), "fake", move || p);
    registry.start();

    provider.announce(&announcement("u-1", "svc-a", "192.168.1.50", "Living Room TV"));
    provider.announce(&announcement("u-1", "svc-b", "192.168.1.50", "Living Room TV"));
    registry.flush_events();

    let devices = registry.compatible_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].services.len(), 2);
    assert_eq!(
        observer.events(),
        vec!["added:Living Room TV", "updated:Living Room TV"]
    );
}

#[test]
fn removing_the_last_service_removes_the_device() {
    let (registry, provider, observer) = registry_with(Arc::new(UpMonitor));
    let factory_a = StubFactory::new("svc-a");
    let disconnects = factory_a.disconnects.clone();
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(factory_a, "fake", move || p);
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-b"), "fake", move || p);
    registry.start();

    provider.announce(&announcement("u-1", "svc-a", "192.168.1.50", "TV"));
    provider.announce(&announcement("u-1", "svc-b", "192.168.1.50", "TV"));

    provider.withdraw(&announcement("u-1", "svc-a", "192.168.1.50", "TV"));
    assert_eq!(registry.compatible_devices().len(), 1);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    provider.withdraw(&announcement("u-1", "svc-b", "192.168.1.50", "TV"));
    registry.flush_events();

    assert!(registry.compatible_devices().is_empty());
    let removals: Vec<String> = observer
        .events()
        .into_iter()
        .filter(|e| e.starts_with("removed:"))
        .collect();
    assert_eq!(removals, vec!["removed:TV"]);
}

#[test]
fn late_subscriber_sees_existing_devices_first() {
    let (registry, provider, _observer) = registry_with(Arc::new(UpMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);
    registry.start();

    for n in 1..=3 {
        provider.announce(&announcement(
            &format!("u-{n}"),
            "svc-a",
            &format!("192.168.1.{}", 50 + n),
            &format!("TV {n}"),
        ));
    }
    registry.flush_events();

    let late = Arc::new(RecObserver::default());
    registry.add_observer(late.clone());
    registry.flush_events();

    let events = late.events();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.starts_with("added:")));

    // Subsequent discovery still reaches the late subscriber, after replay.
    provider.announce(&announcement("u-9", "svc-a", "192.168.1.99", "TV 9"));
    registry.flush_events();
    assert_eq!(late.events().len(), 4);
}

#[test]
fn rejected_announcement_leaves_no_device_behind() {
    let (registry, provider, observer) = registry_with(Arc::new(UpMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::rejecting("svc-a"), "fake", move || p);
    registry.start();

    provider.announce(&announcement("u-1", "svc-a", "192.168.1.50", "TV"));
    registry.flush_events();

    assert!(registry.compatible_devices().is_empty());
    assert!(observer.events().is_empty());
}

#[test]
fn unregistering_the_last_service_stops_the_provider() {
    let (registry, provider, _observer) = registry_with(Arc::new(UpMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-b"), "fake", move || p);

    registry.unregister_device_service("svc-a");
    assert_eq!(provider.stops.load(Ordering::SeqCst), 0);
    assert!(!provider.is_empty());

    registry.unregister_device_service("svc-b");
    assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
    assert!(provider.is_empty());
}

#[test]
fn reregistering_the_same_service_is_idempotent() {
    let (registry, provider, _observer) = registry_with(Arc::new(UpMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);

    assert_eq!(provider.filters.lock().len(), 1);
}

#[test]
fn network_loss_resets_providers_and_removes_devices() {
    let (registry, provider, observer) = registry_with(Arc::new(UpMonitor));
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);
    registry.start();

    provider.announce(&announcement("u-1", "svc-a", "192.168.1.50", "TV 1"));
    provider.announce(&announcement("u-2", "svc-a", "192.168.1.51", "TV 2"));
    registry.flush_events();

    registry.on_network_disconnected();
    registry.flush_events();

    assert_eq!(provider.resets.load(Ordering::SeqCst), 1);
    assert!(registry.compatible_devices().is_empty());
    let removals = observer
        .events()
        .into_iter()
        .filter(|e| e.starts_with("removed:"))
        .count();
    assert_eq!(removals, 2);

    // Reconnect while searching restarts the providers in place.
    registry.on_network_connected();
    assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
    assert_eq!(provider.starts.load(Ordering::SeqCst), 2);
}

#[test]
fn persisted_device_identity_survives_rediscovery() {
    init_logging();
    let store = Arc::new(MemoryDeviceStore::new());
    let registry = DeviceRegistry::new(store.clone(), Arc::new(UpMonitor));
    let provider = Arc::new(FakeProvider::default());
    let p: Arc<dyn DiscoveryProvider> = provider.clone();
    registry.register_device_service(StubFactory::new("svc-a"), "fake", move || p);
    registry.start();

    // First sighting persists the device under its uuid.
    provider.announce(&announcement("u-stable", "svc-a", "192.168.1.50", "TV"));
    registry.flush_events();

    // Simulate a fresh session: raw map cleared, store retained.
    registry.on_network_disconnected();
    registry.flush_events();

    // Same uuid reappears on a new address and rehydrates the stored record.
    provider.announce(&announcement("u-stable", "svc-a", "192.168.1.77", "TV"));
    registry.flush_events();

    let devices = registry.compatible_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "u-stable");
    assert_eq!(devices[0].ip, "192.168.1.77".parse::<IpAddr>().unwrap());
    assert_eq!(
        devices[0].last_known_ip,
        Some("192.168.1.50".parse().unwrap())
    );
}
