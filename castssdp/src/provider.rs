//! SSDP discovery provider: periodic search, announcement handling,
//! asynchronous description resolution.
//!
//! The provider is a control point. It must **not** answer M-SEARCH queries,
//! and its search socket binds an ephemeral port so unicast replies are not
//! load-balanced away by the kernel; only the notify socket binds 1900 and
//! joins the multicast group.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::announcement::{
    DiscoveryFilter, DiscoveryProvider, DiscoveryProviderListener, ServiceAnnouncement,
};
use crate::description::DeviceDescription;
use crate::message::{SsdpPacket, SsdpPacketKind, extract_uuid, search_message};
use crate::{DEFAULT_CONTROL_PORT, SSDP_MULTICAST_ADDR, SSDP_PORT};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const FETCH_WORKERS: usize = 4;

/// SSDP discovery engine. Cheap to clone handles are not provided; the
/// registry owns the provider through the [`DiscoveryProvider`] trait object.
pub struct SsdpDiscoveryProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    filters: Mutex<Vec<DiscoveryFilter>>,
    listeners: Mutex<Vec<Arc<dyn DiscoveryProviderListener>>>,
    /// Services whose description fetch is in flight, keyed by uuid.
    discovering: Mutex<HashMap<String, ServiceAnnouncement>>,
    /// Fully resolved services, keyed by uuid.
    found: Mutex<HashMap<String, ServiceAnnouncement>>,
    sockets: Mutex<Option<SsdpSockets>>,
    /// Stop token of the current start generation. Each pair of receive
    /// loops captures the token it was started with; `stop` retires it, so
    /// loops from an earlier generation wind down even after a restart has
    /// already raised a new one.
    run_token: Mutex<Option<Arc<AtomicBool>>>,
    scanning: AtomicBool,
    fetch_pool: FetchPool,
}

struct SsdpSockets {
    /// Ephemeral-port socket for M-SEARCH sends and their unicast replies.
    search: Arc<UdpSocket>,
    /// Port-1900 multicast member receiving unsolicited NOTIFYs.
    notify: Arc<UdpSocket>,
}

impl SsdpDiscoveryProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                filters: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                discovering: Mutex::new(HashMap::new()),
                found: Mutex::new(HashMap::new()),
                sockets: Mutex::new(None),
                run_token: Mutex::new(None),
                scanning: AtomicBool::new(false),
                fetch_pool: FetchPool::new(FETCH_WORKERS),
            }),
        }
    }
}

impl Default for SsdpDiscoveryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryProvider for SsdpDiscoveryProvider {
    fn start(&self) {
        let mut token_slot = self.inner.run_token.lock();
        if token_slot.is_some() {
            debug!("SSDP provider already running");
            return;
        }

        let Some(source) = local_ipv4_address() else {
            warn!("SSDP provider cannot determine a local address, not starting");
            return;
        };

        let sockets = match SsdpSockets::open(source) {
            Ok(sockets) => sockets,
            Err(e) => {
                warn!("Failed to open SSDP sockets: {}", e);
                drop(token_slot);
                self.inner
                    .for_each_listener(|l| l.discovery_failed("failed to open SSDP socket"));
                return;
            }
        };

        let search = Arc::clone(&sockets.search);
        let notify = Arc::clone(&sockets.notify);
        *self.inner.sockets.lock() = Some(sockets);

        let token = Arc::new(AtomicBool::new(true));
        *token_slot = Some(Arc::clone(&token));
        drop(token_slot);

        info!("✅ SSDP provider started on {}", source);

        let inner = Arc::clone(&self.inner);
        let stop = Arc::clone(&token);
        std::thread::spawn(move || inner.receive_loop(search, "search-response", stop));
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || inner.receive_loop(notify, "multicast-notify", token));

        self.scan();
    }

    fn stop(&self) {
        if let Some(token) = self.inner.run_token.lock().take() {
            token.store(false, Ordering::SeqCst);
        }
        // The loops observe their retired token on the next 1s read timeout.
        *self.inner.sockets.lock() = None;
        debug!("SSDP provider stopped");
    }

    fn reset(&self) {
        self.stop();
        self.inner.discovering.lock().clear();
        self.inner.found.lock().clear();
        debug!("SSDP provider reset");
    }

    fn scan(&self) {
        if self.inner.scanning.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            inner.scan_blocking();
            inner.scanning.store(false, Ordering::SeqCst);
        });
    }

    fn add_filter(&self, filter: DiscoveryFilter) {
        let mut filters = self.inner.filters.lock();
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }

    fn remove_filter(&self, filter: &DiscoveryFilter) {
        self.inner.filters.lock().retain(|f| f != filter);
    }

    fn is_empty(&self) -> bool {
        self.inner.filters.lock().is_empty()
    }

    fn add_listener(&self, listener: Arc<dyn DiscoveryProviderListener>) {
        self.inner.listeners.lock().push(listener);
    }
}

impl SsdpDiscoveryProvider {
    #[cfg(test)]
    fn handle_packet(&self, packet: SsdpPacket) {
        self.inner.handle_packet(packet);
    }

    #[cfg(test)]
    fn complete_resolution(&self, uuid: &str, description: DeviceDescription) {
        self.inner.complete_resolution(uuid, description);
    }
}

impl ProviderInner {
    fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>, name: &str, stop: Arc<AtomicBool>) {
        let mut buf = [0u8; 8192];
        while stop.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let data = String::from_utf8_lossy(&buf[..n]);
                    if let Some(packet) = SsdpPacket::parse(&data, from) {
                        self.handle_packet(packet);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    // A read error kills only this loop; its sibling keeps going.
                    warn!("❌ SSDP {} loop read error: {}", name, e);
                    break;
                }
            }
        }
        debug!("SSDP {} loop exited", name);
    }

    fn scan_blocking(&self) {
        let filters = self.filters.lock().clone();
        let socket = {
            let sockets = self.sockets.lock();
            match sockets.as_ref() {
                Some(s) => Arc::clone(&s.search),
                None => return,
            }
        };

        let addr: SocketAddr = format!("{}:{}", SSDP_MULTICAST_ADDR, SSDP_PORT)
            .parse()
            .expect("static multicast address");

        for filter in filters {
            let message = search_message(&filter.ssdp_filter);
            match socket.send_to(message.as_bytes(), addr) {
                Ok(_) => debug!("📤 M-SEARCH sent (ST={})", filter.ssdp_filter),
                Err(e) => {
                    // Per-filter, non-fatal: the remaining filters still go out.
                    warn!(
                        "Failed to send M-SEARCH for {}: {}",
                        filter.ssdp_filter, e
                    );
                }
            }
        }
    }

    fn handle_packet(self: &Arc<Self>, packet: SsdpPacket) {
        if packet.kind == SsdpPacketKind::Search {
            // Another control point querying; we are not a device.
            return;
        }

        let Some(token) = packet.filter_token().map(str::to_string) else {
            return;
        };
        if !self.is_searching_for(&token) {
            return;
        }

        let Some(uuid) = packet.header("USN").and_then(extract_uuid) else {
            return;
        };

        if packet.is_byebye() {
            let removed = self.found.lock().remove(&uuid);
            if let Some(announcement) = removed {
                debug!("👋 byebye for {} ({})", announcement.friendly_name, uuid);
                self.fan_out_removed(&announcement);
            }
            return;
        }

        let Some(location) = packet
            .header("LOCATION")
            .filter(|l| !l.is_empty())
            .map(str::to_string)
        else {
            return;
        };

        if let Some(known) = self.found.lock().get_mut(&uuid) {
            known.touch();
            return;
        }
        {
            let mut discovering = self.discovering.lock();
            if let Some(pending) = discovering.get_mut(&uuid) {
                pending.touch();
                return;
            }

            let pending = ServiceAnnouncement::pending(
                uuid.clone(),
                token.clone(),
                packet.from.ip(),
                DEFAULT_CONTROL_PORT,
            );
            discovering.insert(uuid.clone(), pending);
        }

        let inner = Arc::clone(self);
        self.fetch_pool.submit(Box::new(move || {
            match DeviceDescription::fetch(&location, FETCH_TIMEOUT) {
                Ok(mut description) => {
                    description.response_headers.push_str("LOCATION: ");
                    description.response_headers.push_str(&location);
                    inner.complete_resolution_at(&uuid, description, Some(location));
                }
                Err(e) => {
                    debug!("Failed to get location data for {}: {}", uuid, e);
                    inner.discovering.lock().remove(&uuid);
                }
            }
        }));
    }

    fn complete_resolution(self: &Arc<Self>, uuid: &str, description: DeviceDescription) {
        self.complete_resolution_at(uuid, description, None);
    }

    /// Move a pending entry to `found` and fan out one add event per filter
    /// whose token matches. If the pending entry is gone (reset or byebye
    /// raced the fetch) the result is discarded.
    fn complete_resolution_at(
        self: &Arc<Self>,
        uuid: &str,
        description: DeviceDescription,
        location: Option<String>,
    ) {
        let announcement = {
            let mut discovering = self.discovering.lock();
            let Some(mut announcement) = discovering.remove(uuid) else {
                debug!("Discarding resolved description for forgotten uuid {}", uuid);
                return;
            };

            announcement.friendly_name = description.friendly_name;
            announcement.model_name = description.model_name;
            announcement.model_number = description.model_number;
            announcement.model_description = description.model_description;
            announcement.manufacturer = description.manufacturer;
            announcement.application_url = description.application_url;
            announcement.service_list = description.services;
            announcement.response_headers = description.response_headers;
            if location.is_some() {
                announcement.location = location;
            }
            announcement.touch();
            announcement
        };

        self.found
            .lock()
            .insert(uuid.to_string(), announcement.clone());

        debug!(
            "Service resolved: {} ({}) at {}",
            announcement.friendly_name, uuid, announcement.ip
        );
        self.fan_out_added(&announcement);
    }

    fn is_searching_for(&self, token: &str) -> bool {
        self.filters.lock().iter().any(|f| f.ssdp_filter == token)
    }

    fn service_ids_for(&self, token: &str) -> Vec<String> {
        self.filters
            .lock()
            .iter()
            .filter(|f| f.ssdp_filter == token)
            .map(|f| f.service_id.clone())
            .collect()
    }

    /// One add event per registered filter matching the announcement's token:
    /// a single physical root device can back several logical registrations.
    fn fan_out_added(&self, announcement: &ServiceAnnouncement) {
        for service_id in self.service_ids_for(&announcement.service_filter) {
            let mut tagged = announcement.clone();
            tagged.service_id = service_id;
            self.for_each_listener(|l| l.service_added(&tagged));
        }
    }

    fn fan_out_removed(&self, announcement: &ServiceAnnouncement) {
        for service_id in self.service_ids_for(&announcement.service_filter) {
            let mut tagged = announcement.clone();
            tagged.service_id = service_id;
            self.for_each_listener(|l| l.service_removed(&tagged));
        }
    }

    fn for_each_listener(&self, f: impl Fn(&Arc<dyn DiscoveryProviderListener>)) {
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            f(listener);
        }
    }
}

impl SsdpSockets {
    fn open(source: IpAddr) -> std::io::Result<Self> {
        // Search socket: ephemeral port, unicast replies only.
        let search = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        search.set_reuse_address(true)?;
        let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("static address");
        search.bind(&bind_addr.into())?;
        let search: UdpSocket = search.into();
        search.set_read_timeout(Some(RECV_TIMEOUT))?;
        search.set_multicast_loop_v4(true)?;

        // Notify socket: multicast group member on 1900.
        let notify = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        notify.set_reuse_address(true)?;
        #[cfg(unix)]
        notify.set_reuse_port(true)?;
        let bind_addr: SocketAddr = format!("0.0.0.0:{}", SSDP_PORT)
            .parse()
            .expect("static address");
        notify.bind(&bind_addr.into())?;
        let notify: UdpSocket = notify.into();
        notify.set_read_timeout(Some(RECV_TIMEOUT))?;

        let group = SSDP_MULTICAST_ADDR.parse().expect("static address");
        match source {
            IpAddr::V4(v4) => notify.join_multicast_v4(&group, &v4)?,
            IpAddr::V6(_) => {
                // SSDP discovery here is IPv4-only.
                notify.join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)?
            }
        }

        Ok(Self {
            search: Arc::new(search),
            notify: Arc::new(notify),
        })
    }
}

fn local_ipv4_address() -> Option<IpAddr> {
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

type FetchJob = Box<dyn FnOnce() + Send>;

/// Fixed-size worker pool for description fetches. Fetch results for entries
/// that vanished while the job was queued are discarded by the caller.
struct FetchPool {
    tx: Sender<FetchJob>,
}

impl FetchPool {
    fn new(workers: usize) -> Self {
        let (tx, rx) = unbounded::<FetchJob>();

        for n in 0..workers.max(1) {
            let rx: Receiver<FetchJob> = rx.clone();
            std::thread::Builder::new()
                .name(format!("ssdp-fetch-{}", n))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn fetch worker");
        }

        Self { tx }
    }

    fn submit(&self, job: FetchJob) {
        if self.tx.send(job).is_err() {
            warn!("Fetch pool is gone, dropping description fetch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::DescribedService;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingListener {
        added: PlMutex<Vec<ServiceAnnouncement>>,
        removed: PlMutex<Vec<ServiceAnnouncement>>,
    }

    impl DiscoveryProviderListener for RecordingListener {
        fn service_added(&self, announcement: &ServiceAnnouncement) {
            self.added.lock().push(announcement.clone());
        }
        fn service_removed(&self, announcement: &ServiceAnnouncement) {
            self.removed.lock().push(announcement.clone());
        }
        fn discovery_failed(&self, _message: &str) {}
    }

    const TV_FILTER: &str = "urn:lge-com:service:webos-second-screen:1";

    fn alive_packet(uuid: &str, token: &str) -> SsdpPacket {
        let data = format!(
            "NOTIFY * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             CACHE-CONTROL: max-age=1800\r\n\
             LOCATION: http://192.168.1.50:8080/desc.xml\r\n\
             NT: {token}\r\n\
             NTS: ssdp:alive\r\n\
             USN: uuid:{uuid}::{token}\r\n\
             \r\n"
        );
        SsdpPacket::parse(&data, "192.168.1.50:1900".parse().unwrap()).unwrap()
    }

    fn byebye_packet(uuid: &str, token: &str) -> SsdpPacket {
        let data = format!(
            "NOTIFY * HTTP/1.1\r\n\
             HOST: 239.255.255.250:1900\r\n\
             NT: {token}\r\n\
             NTS: ssdp:byebye\r\n\
             USN: uuid:{uuid}::{token}\r\n\
             \r\n"
        );
        SsdpPacket::parse(&data, "192.168.1.50:1900".parse().unwrap()).unwrap()
    }

    fn tv_description() -> DeviceDescription {
        DeviceDescription {
            friendly_name: "Living Room TV".into(),
            model_name: "OLED55".into(),
            manufacturer: "LG Electronics".into(),
            services: vec![DescribedService {
                service_type: TV_FILTER.into(),
                control_url: Some("/control".into()),
                event_sub_url: None,
            }],
            ..Default::default()
        }
    }

    fn provider_with_listener() -> (SsdpDiscoveryProvider, Arc<RecordingListener>) {
        let provider = SsdpDiscoveryProvider::new();
        let listener = Arc::new(RecordingListener::default());
        provider.add_listener(listener.clone());
        (provider, listener)
    }

    #[test]
    fn unregistered_filter_is_ignored() {
        let (provider, listener) = provider_with_listener();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));

        provider.handle_packet(alive_packet("u-1", "urn:other:service:1"));

        assert!(provider.inner.discovering.lock().is_empty());
        assert!(listener.added.lock().is_empty());
    }

    #[test]
    fn alive_registers_pending_entry_until_resolution() {
        let (provider, listener) = provider_with_listener();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));

        provider.handle_packet(alive_packet("u-1", TV_FILTER));
        assert!(provider.inner.discovering.lock().contains_key("u-1"));
        assert!(listener.added.lock().is_empty());

        provider.complete_resolution("u-1", tv_description());
        assert!(provider.inner.discovering.lock().is_empty());
        assert!(provider.inner.found.lock().contains_key("u-1"));

        let added = listener.added.lock();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].friendly_name, "Living Room TV");
        assert_eq!(added[0].service_id, "tv-control");
        assert_eq!(added[0].port, DEFAULT_CONTROL_PORT);
    }

    #[test]
    fn one_announcement_fans_out_to_all_matching_filters() {
        let (provider, listener) = provider_with_listener();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));
        provider.add_filter(DiscoveryFilter::new("tv-apps", TV_FILTER));

        provider.handle_packet(alive_packet("u-1", TV_FILTER));
        provider.complete_resolution("u-1", tv_description());

        let ids: Vec<String> = listener
            .added
            .lock()
            .iter()
            .map(|a| a.service_id.clone())
            .collect();
        assert_eq!(ids, vec!["tv-control".to_string(), "tv-apps".to_string()]);
    }

    #[test]
    fn byebye_removes_found_service_and_emits_once() {
        let (provider, listener) = provider_with_listener();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));

        provider.handle_packet(alive_packet("u-1", TV_FILTER));
        provider.complete_resolution("u-1", tv_description());

        provider.handle_packet(byebye_packet("u-1", TV_FILTER));
        assert!(provider.inner.found.lock().is_empty());
        let removed = listener.removed.lock();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].uuid, "u-1");
    }

    #[test]
    fn byebye_for_unknown_uuid_is_a_noop() {
        let (provider, listener) = provider_with_listener();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));

        provider.handle_packet(byebye_packet("nope", TV_FILTER));
        assert!(listener.removed.lock().is_empty());
    }

    #[test]
    fn resolution_after_reset_is_discarded() {
        let (provider, listener) = provider_with_listener();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));

        provider.handle_packet(alive_packet("u-1", TV_FILTER));
        provider.reset();

        provider.complete_resolution("u-1", tv_description());
        assert!(provider.inner.found.lock().is_empty());
        assert!(listener.added.lock().is_empty());
    }

    #[test]
    fn repeat_announcement_refreshes_known_entry_without_refetch() {
        let (provider, _listener) = provider_with_listener();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));

        provider.handle_packet(alive_packet("u-1", TV_FILTER));
        let first_seen = provider.inner.discovering.lock()["u-1"].last_detection;

        provider.handle_packet(alive_packet("u-1", TV_FILTER));
        assert_eq!(provider.inner.discovering.lock().len(), 1);
        assert!(provider.inner.discovering.lock()["u-1"].last_detection >= first_seen);
    }

    #[test]
    fn duplicate_filter_registration_is_idempotent() {
        let provider = SsdpDiscoveryProvider::new();
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));
        provider.add_filter(DiscoveryFilter::new("tv-control", TV_FILTER));
        assert_eq!(provider.inner.filters.lock().len(), 1);

        provider.remove_filter(&DiscoveryFilter::new("tv-control", TV_FILTER));
        assert!(provider.is_empty());
    }

    #[test]
    fn receive_loop_exits_when_its_generation_is_stopped() {
        let provider = SsdpDiscoveryProvider::new();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let socket = Arc::new(socket);
        let stop = Arc::new(AtomicBool::new(true));

        let inner = Arc::clone(&provider.inner);
        let loop_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || inner.receive_loop(socket, "test", loop_stop));

        stop.store(false, Ordering::SeqCst);
        // The loop re-checks its token after at most one read timeout.
        handle.join().unwrap();
    }

    #[test]
    fn stop_retires_the_running_generation_token() {
        let provider = SsdpDiscoveryProvider::new();
        let old = Arc::new(AtomicBool::new(true));
        *provider.inner.run_token.lock() = Some(Arc::clone(&old));

        provider.stop();
        assert!(!old.load(Ordering::SeqCst));
        assert!(provider.inner.run_token.lock().is_none());

        // A generation raised afterwards carries its own live token.
        let fresh = Arc::new(AtomicBool::new(true));
        *provider.inner.run_token.lock() = Some(Arc::clone(&fresh));
        assert!(fresh.load(Ordering::SeqCst));
        provider.stop();
        assert!(!fresh.load(Ordering::SeqCst));
    }
}
