//! In-process host and packet source
//!
//! [`LocalPacketSource`] feeds packets to its processors from a fixed pool of
//! worker threads, or inline on the caller's thread when built with zero
//! workers. Packets are only delivered while at least one application has a
//! matching packet request.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use super::{ApplicationId, HostServices, PacketProcessor, PacketSource, ProcessorId, TrafficSelector};
use crate::error::{Error, Result};
use crate::packet::DecodedPacket;

/// Default depth of the hand-off channel between `submit` and the workers
pub const DEFAULT_BACKLOG: usize = 4096;

struct Registration {
    id: ProcessorId,
    priority: u32,
    processor: Arc<dyn PacketProcessor>,
}

struct SourceInner {
    processors: RwLock<Vec<Registration>>,
    requests: RwLock<Vec<(TrafficSelector, ApplicationId)>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl SourceInner {
    fn new() -> Self {
        Self {
            processors: RwLock::new(Vec::new()),
            requests: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    fn dispatch(&self, packet: &DecodedPacket) {
        let wanted = self
            .requests
            .read()
            .iter()
            .any(|(selector, _)| selector.matches(packet));
        if !wanted {
            return;
        }

        // Held for the whole dispatch so removal waits for running processors
        let processors = self.processors.read();
        for registration in processors.iter() {
            let processor = &registration.processor;
            if panic::catch_unwind(AssertUnwindSafe(|| processor.process(packet))).is_err() {
                tracing::error!(processor = registration.id.0, "packet processor panicked");
            }
        }
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }
}

/// Packet source driven by the embedding program
pub struct LocalPacketSource {
    inner: Arc<SourceInner>,
    sender: Mutex<Option<Sender<DecodedPacket>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LocalPacketSource {
    /// Create a source with `workers` threads and the default backlog
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_backlog(workers, DEFAULT_BACKLOG)
    }

    /// Create a source that processes packets on the submitting thread
    pub fn inline() -> Self {
        Self {
            inner: Arc::new(SourceInner::new()),
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a source with `workers` threads behind a channel of `backlog` packets
    pub fn with_backlog(workers: usize, backlog: usize) -> Result<Self> {
        if workers == 0 {
            return Ok(Self::inline());
        }

        let inner = Arc::new(SourceInner::new());
        let (sender, receiver) = channel::bounded::<DecodedPacket>(backlog.max(1));

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let inner = inner.clone();
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("packet-worker-{}", index))
                .spawn(move || {
                    while let Ok(packet) = receiver.recv() {
                        inner.dispatch(&packet);
                        inner.finish_one();
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            inner,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver one decoded packet
    ///
    /// Blocks while the worker backlog is full.
    pub fn submit(&self, packet: DecodedPacket) -> Result<()> {
        if self.is_closed() {
            return Err(Error::host("Packet source is closed"));
        }

        let Some(sender) = self.sender.lock().clone() else {
            self.inner.dispatch(&packet);
            return Ok(());
        };

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        if sender.send(packet).is_err() {
            self.inner.finish_one();
            return Err(Error::host("Packet source is closed"));
        }

        Ok(())
    }

    /// Decode a raw Ethernet II frame that arrived now and deliver it
    pub fn submit_frame(&self, frame: &[u8]) -> Result<()> {
        self.submit(DecodedPacket::from_ethernet_frame(frame, Instant::now())?)
    }

    /// Wait up to `timeout` until every submitted packet has been processed
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.idle_lock.lock();

        while self.inner.in_flight.load(Ordering::Acquire) > 0 {
            if self.inner.idle.wait_until(&mut guard, deadline).timed_out() {
                return self.inner.in_flight.load(Ordering::Acquire) == 0;
            }
        }

        true
    }

    /// Number of subscribed processors
    pub fn processor_count(&self) -> usize {
        self.inner.processors.read().len()
    }

    /// Number of active packet requests
    pub fn request_count(&self) -> usize {
        self.inner.requests.read().len()
    }

    /// Number of worker threads, zero for an inline source
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Check if `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting packets, let the workers drain the backlog, and join them
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.lock().take();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("packet worker panicked");
            }
        }
    }
}

impl Drop for LocalPacketSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LocalPacketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPacketSource")
            .field("processors", &self.processor_count())
            .field("requests", &self.request_count())
            .field("workers", &self.worker_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PacketSource for LocalPacketSource {
    fn add_processor(&self, processor: Arc<dyn PacketProcessor>, priority: u32) -> Result<ProcessorId> {
        let id = ProcessorId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        let mut processors = self.inner.processors.write();
        let position = processors.partition_point(|r| r.priority <= priority);
        processors.insert(position, Registration { id, priority, processor });

        tracing::debug!(processor = id.0, priority, "processor added");
        Ok(id)
    }

    fn remove_processor(&self, id: ProcessorId) -> Result<()> {
        let mut processors = self.inner.processors.write();
        let before = processors.len();
        processors.retain(|r| r.id != id);

        if processors.len() == before {
            return Err(Error::host(format!("Unknown processor {}", id.0)));
        }
        tracing::debug!(processor = id.0, "processor removed");
        Ok(())
    }

    fn request_packets(&self, selector: TrafficSelector, app: &ApplicationId) -> Result<()> {
        let mut requests = self.inner.requests.write();
        if !requests.iter().any(|(s, a)| *s == selector && a == app) {
            requests.push((selector, app.clone()));
        }
        Ok(())
    }

    fn cancel_packets(&self, selector: TrafficSelector, app: &ApplicationId) -> Result<()> {
        self.inner
            .requests
            .write()
            .retain(|(s, a)| !(*s == selector && a == app));
        Ok(())
    }
}

/// Host whose application registry lives in memory
#[derive(Debug, Default)]
pub struct LocalHost {
    applications: RwLock<HashMap<String, ApplicationId>>,
}

impl LocalHost {
    /// Create an empty host
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a registered application by name
    pub fn application(&self, name: &str) -> Option<ApplicationId> {
        self.applications.read().get(name).cloned()
    }

    /// Number of registered applications
    pub fn application_count(&self) -> usize {
        self.applications.read().len()
    }
}

impl HostServices for LocalHost {
    /// Registering a name twice returns the same ID
    fn register_application(&self, name: &str) -> Result<ApplicationId> {
        if name.trim().is_empty() {
            return Err(Error::host("Application name must not be empty"));
        }

        let mut applications = self.applications.write();
        let id = applications
            .entry(name.to_string())
            .or_insert_with(|| ApplicationId::new(name))
            .clone();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ethertype;
    use crate::packet::test_frames::{ipv4_frame, udp};
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u16>>,
        label: Option<(&'static str, Arc<Mutex<Vec<&'static str>>>)>,
    }

    impl PacketProcessor for Recorder {
        fn process(&self, packet: &DecodedPacket) {
            self.seen.lock().push(packet.ether_type);
            if let Some((label, order)) = &self.label {
                order.lock().push(label);
            }
        }
    }

    fn ipv4_packet() -> DecodedPacket {
        DecodedPacket::ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 20, None, Instant::now())
    }

    #[test]
    fn test_inline_delivery_follows_requests() -> Result<()> {
        let source = LocalPacketSource::inline();
        let host = LocalHost::new();
        let app = host.register_application("org.netcap.test")?;
        let recorder = Arc::new(Recorder::default());

        source.add_processor(recorder.clone(), 2)?;
        source.submit(ipv4_packet())?;
        assert!(recorder.seen.lock().is_empty());

        source.request_packets(TrafficSelector::ipv4(), &app)?;
        source.request_packets(TrafficSelector::ipv4(), &app)?;
        assert_eq!(source.request_count(), 1);

        source.submit(ipv4_packet())?;
        source.submit(DecodedPacket::other(ethertype::ARP, Instant::now()))?;
        assert_eq!(*recorder.seen.lock(), vec![ethertype::IPV4]);

        source.cancel_packets(TrafficSelector::ipv4(), &app)?;
        source.submit(ipv4_packet())?;
        assert_eq!(recorder.seen.lock().len(), 1);

        Ok(())
    }

    #[test]
    fn test_processors_run_by_priority() -> Result<()> {
        let source = LocalPacketSource::inline();
        let app = ApplicationId::new("org.netcap.test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let late = Arc::new(Recorder {
            label: Some(("late", order.clone())),
            ..Default::default()
        });
        let early = Arc::new(Recorder {
            label: Some(("early", order.clone())),
            ..Default::default()
        });
        let late_id = source.add_processor(late, 5)?;
        source.add_processor(early, 1)?;
        source.request_packets(TrafficSelector::any(), &app)?;

        source.submit(ipv4_packet())?;
        assert_eq!(*order.lock(), vec!["early", "late"]);

        source.remove_processor(late_id)?;
        assert!(source.remove_processor(late_id).is_err());
        assert_eq!(source.processor_count(), 1);

        Ok(())
    }

    #[test]
    fn test_worker_pool_and_wait_idle() -> Result<()> {
        let source = LocalPacketSource::with_backlog(2, 8)?;
        let app = ApplicationId::new("org.netcap.test");
        let recorder = Arc::new(Recorder::default());
        source.add_processor(recorder.clone(), 2)?;
        source.request_packets(TrafficSelector::ipv4(), &app)?;
        assert_eq!(source.worker_count(), 2);

        let frame = ipv4_frame(17, [10, 0, 0, 1], [10, 0, 0, 2], &udp(1000, 53));
        for _ in 0..100 {
            source.submit_frame(&frame)?;
        }
        assert!(source.wait_idle(Duration::from_secs(5)));
        assert_eq!(recorder.seen.lock().len(), 100);

        source.close();
        assert!(source.is_closed());
        assert!(source.submit(ipv4_packet()).is_err());

        Ok(())
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let source = LocalPacketSource::inline();
        assert!(source.submit_frame(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_host_registration() -> Result<()> {
        let host = LocalHost::new();

        let first = host.register_application("org.netcap.a")?;
        let again = host.register_application("org.netcap.a")?;
        let other = host.register_application("org.netcap.b")?;

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(host.application_count(), 2);
        assert_eq!(host.application("org.netcap.b"), Some(other));
        assert!(host.register_application("  ").is_err());

        Ok(())
    }
}
