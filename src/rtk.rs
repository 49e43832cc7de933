//! RTK coordinator.
//!
//! Owns the GNSS receiver and (optionally) the NTRIP client and runs the
//! plumbing between them:
//!
//! - a blocking position reader that publishes every fix to the registered
//!   observers and caches the latest,
//! - a bounded RTCM queue filled by the NTRIP reception callback and drained
//!   by a blocking writer that pushes raw frames to the receiver,
//! - a 1 Hz GGA uploader synthesising the caster's position report from the
//!   latest fix,
//! - a monitor that logs NTRIP state transitions and restarts the client
//!   when its reconnect budget ran out.
//!
//! Without NTRIP configuration the coordinator runs in GPS-only mode: the
//! reader and observers work, the correction path stays dark.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::gnss::{GnssReceiver, Position};
use crate::nmea;
use crate::ntrip::{NtripClient, NtripStatus};
use crate::rtcm::RtcmFrame;
use crate::util::BoundedQueue;

/// Bounded correction queue between the NTRIP reader and the serial writer.
const RTCM_QUEUE_CAPACITY: usize = 100;
/// Consecutive serial write failures before the writer declares degradation.
const MAX_WRITE_FAILURES: u32 = 5;
/// GGA uplink cadence.
const GGA_UPLOAD_INTERVAL: Duration = Duration::from_secs(1);
/// Back-off after a failed GGA uplink.
const GGA_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
/// Delay between GNSS reconnection attempts.
const GPS_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// NTRIP monitor polling cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
/// Thread join deadline during shutdown.
const JOIN_DEADLINE: Duration = Duration::from_secs(2);

/// Observer callback; invoked on the reader thread for every published
/// position, so implementations must not block.
pub type PositionObserver = Box<dyn Fn(&Position) + Send + Sync>;

/// Coordinator counters for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct RtkStatus {
    pub gps_connected:       bool,
    pub gps_baud:            Option<u32>,
    pub nmea_checksum_errors: u64,
    pub nmea_format_errors:  u64,
    pub positions_published: u64,
    pub rtcm_queue_depth:    usize,
    pub rtcm_queue_overflows: u64,
    pub rtcm_frames_written: u64,
    pub rtcm_write_failures: u64,
    pub rtcm_avg_write_ms:   Option<f64>,
    pub gga_uploads:         u64,
    pub corrections_degraded: bool,
    pub ntrip:               Option<NtripStatus>,
}

pub struct RtkCoordinator {
    receiver: Arc<GnssReceiver>,
    ntrip:    Option<Arc<NtripClient>>,

    latest:     Arc<Mutex<Option<Position>>>,
    observers:  Mutex<Vec<PositionObserver>>,
    rtcm_queue: BoundedQueue<Vec<u8>>,

    running:  AtomicBool,
    degraded: AtomicBool,

    positions_published: AtomicU64,
    frames_written:      AtomicU64,
    write_failures:      AtomicU64,
    write_micros_total:  AtomicU64,
    gga_uploads:         AtomicU64,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtkCoordinator {
    pub fn new(receiver: Arc<GnssReceiver>, ntrip: Option<Arc<NtripClient>>) -> Self {
        RtkCoordinator {
            receiver,
            ntrip,
            latest:     Arc::new(Mutex::new(None)),
            observers:  Mutex::new(Vec::new()),
            rtcm_queue: BoundedQueue::new(RTCM_QUEUE_CAPACITY),
            running:  AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            positions_published: AtomicU64::new(0),
            frames_written:      AtomicU64::new(0),
            write_failures:      AtomicU64::new(0),
            write_micros_total:  AtomicU64::new(0),
            gga_uploads:         AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a position observer.  Every published position reaches every
    /// observer, in production order.
    pub fn register_observer(&self, observer: PositionObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn get_current_position(&self) -> Option<Position> {
        self.latest.lock().unwrap().clone()
    }

    /// Shared handle on the latest-position cell, for callbacks that must
    /// not own the coordinator (e.g. the NTRIP client's GGA source).
    pub fn position_cell(&self) -> Arc<Mutex<Option<Position>>> {
        Arc::clone(&self.latest)
    }

    /// Connect the receiver (and caster, when configured) and start the
    /// worker tasks.
    pub async fn start(this: &Arc<Self>) -> crate::error::Result<()> {
        if this.running.swap(true, Ordering::SeqCst) {
            warn!("RTK coordinator already running");
            return Ok(());
        }

        let rx = Arc::clone(&this.receiver);
        tokio::task::spawn_blocking(move || rx.connect()).await??;

        let mut ntrip_up = false;
        if let Some(client) = &this.ntrip {
            match client.connect().await {
                Ok(()) => ntrip_up = true,
                Err(e) => {
                    warn!("NTRIP connect failed ({e}), continuing in GPS-only mode");
                }
            }
        } else {
            info!("no NTRIP configuration, running GPS-only");
        }

        // Position reader runs regardless of correction availability.
        {
            let coord = Arc::clone(this);
            let handle =
                tokio::task::spawn_blocking(move || coord.position_reader_loop());
            this.tasks.lock().unwrap().push(handle);
        }

        if ntrip_up {
            let client = Arc::clone(this.ntrip.as_ref().expect("checked above"));
            Self::spawn_ntrip_reception(this, &client);

            {
                let coord = Arc::clone(this);
                let handle = tokio::task::spawn_blocking(move || coord.rtcm_writer_loop());
                this.tasks.lock().unwrap().push(handle);
            }
            {
                let coord = Arc::clone(this);
                let c = Arc::clone(&client);
                let handle = tokio::spawn(async move { coord.gga_upload_loop(c).await });
                this.tasks.lock().unwrap().push(handle);
            }
            {
                let coord = Arc::clone(this);
                let c = Arc::clone(&client);
                let handle = tokio::spawn(async move { coord.ntrip_monitor_loop(c).await });
                this.tasks.lock().unwrap().push(handle);
            }
        }

        info!(
            "RTK coordinator started ({})",
            if ntrip_up { "RTK corrections active" } else { "GPS only" }
        );
        Ok(())
    }

    fn spawn_ntrip_reception(this: &Arc<Self>, client: &Arc<NtripClient>) {
        let coord = Arc::clone(this);
        let handle = tokio::spawn(Arc::clone(client).run_reception(move |frame: RtcmFrame| {
            coord.enqueue_rtcm(frame.raw);
        }));
        this.tasks.lock().unwrap().push(handle);
    }

    /// Queue one raw frame for the serial writer, oldest-drop on overflow.
    fn enqueue_rtcm(&self, raw: Vec<u8>) {
        if let Some(dropped) = self.rtcm_queue.push(raw) {
            warn!(
                "RTCM queue overflow: dropped {} stale bytes ({} overflows total)",
                dropped.len(),
                self.rtcm_queue.overflow_count()
            );
        }
    }

    /// Store and fan out one position.
    pub(crate) fn publish_position(&self, position: Position) {
        *self.latest.lock().unwrap() = Some(position.clone());
        self.positions_published.fetch_add(1, Ordering::Relaxed);
        for observer in self.observers.lock().unwrap().iter() {
            observer(&position);
        }
    }

    // ── Worker loops ──────────────────────────────────────────────────────────

    fn position_reader_loop(self: Arc<Self>) {
        info!("position reader started");
        while self.running.load(Ordering::SeqCst) {
            match self.receiver.read_position() {
                Ok(Some(position)) => self.publish_position(position),
                Ok(None) => {}
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("GNSS link lost ({e}), reconnecting in {GPS_RECONNECT_INTERVAL:?}");
                    std::thread::sleep(GPS_RECONNECT_INTERVAL);
                    match self.receiver.connect() {
                        Ok(()) => info!("GNSS receiver reconnected"),
                        Err(e) => warn!("GNSS reconnect failed: {e}"),
                    }
                }
            }
        }
        info!("position reader stopped");
    }

    fn rtcm_writer_loop(self: Arc<Self>) {
        info!("RTCM writer started");
        let mut consecutive_failures = 0u32;
        while self.running.load(Ordering::SeqCst) {
            let raw = match self.rtcm_queue.pop_timeout(Duration::from_secs(1)) {
                Some(raw) => raw,
                None => continue,
            };
            let start = Instant::now();
            match self.receiver.write_rtcm(&raw) {
                Ok(_) => {
                    consecutive_failures = 0;
                    self.frames_written.fetch_add(1, Ordering::Relaxed);
                    self.write_micros_total
                        .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                    debug!(
                        "RTCM written: {} bytes, queue depth {}",
                        raw.len(),
                        self.rtcm_queue.len()
                    );
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "RTCM serial write failed ({consecutive_failures}/{MAX_WRITE_FAILURES}): {e}"
                    );
                    if consecutive_failures >= MAX_WRITE_FAILURES {
                        error!("too many serial write failures, corrections degraded");
                        self.degraded.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
        info!("RTCM writer stopped");
    }

    /// Single consolidated GGA uplink path: one sentence per second, built
    /// from the latest position (dummy until the first fix).
    async fn gga_upload_loop(self: Arc<Self>, client: Arc<NtripClient>) {
        info!("GGA uploader started");
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(GGA_UPLOAD_INTERVAL).await;
            if !client.is_connected() {
                continue;
            }
            let gga = self.synthesize_gga();
            match client.send_gga(&gga).await {
                Ok(()) => {
                    self.gga_uploads.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("GGA uplink failed: {e}");
                    tokio::time::sleep(GGA_FAILURE_BACKOFF).await;
                }
            }
        }
        info!("GGA uploader stopped");
    }

    async fn ntrip_monitor_loop(self: Arc<Self>, client: Arc<NtripClient>) {
        let mut was_connected = client.is_connected();
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(MONITOR_INTERVAL).await;
            let connected = client.is_connected();
            if connected != was_connected {
                if connected {
                    info!("NTRIP connection restored");
                } else {
                    warn!("NTRIP connection lost");
                }
                was_connected = connected;
            }
            // The reception loop reconnects itself; only when it gave up
            // entirely does the monitor restart the client.
            if !connected && !client.is_running() && self.running.load(Ordering::SeqCst) {
                match client.connect().await {
                    Ok(()) => {
                        info!("NTRIP client restarted by monitor");
                        Self::spawn_ntrip_reception(&self, &client);
                        was_connected = true;
                    }
                    Err(e) => debug!("NTRIP restart attempt failed: {e}"),
                }
            }
        }
        info!("NTRIP monitor stopped");
    }

    /// GGA for the caster from the latest fix; dummy before the first one.
    fn synthesize_gga(&self) -> String {
        match self.get_current_position() {
            Some(p) => nmea::build_gga(p.lat, p.lon, p.altitude, p.satellites as u8, p.hdop),
            None => nmea::build_dummy_gga(),
        }
    }

    // ── Introspection / shutdown ──────────────────────────────────────────────

    pub fn status(&self) -> RtkStatus {
        let written = self.frames_written.load(Ordering::Relaxed);
        let avg_ms = if written > 0 {
            Some(
                self.write_micros_total.load(Ordering::Relaxed) as f64
                    / written as f64
                    / 1000.0,
            )
        } else {
            None
        };
        let (nmea_checksum_errors, nmea_format_errors) = self.receiver.error_counters();
        RtkStatus {
            gps_connected:        self.receiver.is_connected(),
            gps_baud:             self.receiver.baud(),
            nmea_checksum_errors,
            nmea_format_errors,
            positions_published:  self.positions_published.load(Ordering::Relaxed),
            rtcm_queue_depth:     self.rtcm_queue.len(),
            rtcm_queue_overflows: self.rtcm_queue.overflow_count(),
            rtcm_frames_written:  written,
            rtcm_write_failures:  self.write_failures.load(Ordering::Relaxed),
            rtcm_avg_write_ms:    avg_ms,
            gga_uploads:          self.gga_uploads.load(Ordering::Relaxed),
            corrections_degraded: self.degraded.load(Ordering::SeqCst),
            ntrip:                self.ntrip.as_ref().map(|c| c.status()),
        }
    }

    /// Stop all workers, close the caster session and the serial link.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping RTK coordinator");
        self.rtcm_queue.notify_all();
        if let Some(client) = &self.ntrip {
            client.disconnect().await;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(JOIN_DEADLINE, &mut handle).await.is_err() {
                warn!("worker task did not stop within {JOIN_DEADLINE:?}, aborting");
                handle.abort();
            }
        }

        self.receiver.close();
        info!("RTK coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::FixQuality;
    use crate::rtcm::encode_frame;

    fn coordinator() -> Arc<RtkCoordinator> {
        Arc::new(RtkCoordinator::new(
            Arc::new(GnssReceiver::new("/dev/null")),
            None,
        ))
    }

    fn position(lat: f64) -> Position {
        Position {
            lat,
            lon: 21.0,
            altitude: 100.0,
            satellites: 9,
            hdop: 1.1,
            fix: FixQuality::Single,
            course: None,
            speed: None,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn observers_see_positions_in_order() {
        let coord = coordinator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        coord.register_observer(Box::new(move |p| {
            sink.lock().unwrap().push(p.lat);
        }));

        for i in 0..5 {
            coord.publish_position(position(50.0 + i as f64));
        }

        assert_eq!(*seen.lock().unwrap(), vec![50.0, 51.0, 52.0, 53.0, 54.0]);
        assert_eq!(coord.get_current_position().unwrap().lat, 54.0);
        assert_eq!(coord.status().positions_published, 5);
    }

    #[test]
    fn rtcm_backpressure_drops_oldest() {
        // S5: 150 frames into a blocked queue → 100 survive, 50 overflow,
        // and the survivors are exactly the most recent 100.
        let coord = coordinator();
        for i in 0..150u16 {
            let frame = encode_frame(1000 + i, &[(i & 0xFF) as u8]);
            coord.enqueue_rtcm(frame);
        }

        let status = coord.status();
        assert_eq!(status.rtcm_queue_depth, 100);
        assert_eq!(status.rtcm_queue_overflows, 50);

        let mut seen = Vec::new();
        while let Some(raw) = coord.rtcm_queue.try_pop() {
            let msg_type = (u16::from(raw[3]) << 4) | (u16::from(raw[4]) >> 4);
            seen.push(msg_type);
        }
        assert_eq!(seen.len(), 100);
        assert_eq!(seen[0], 1050);
        assert_eq!(*seen.last().unwrap(), 1149);
    }

    #[test]
    fn gga_synthesis_uses_latest_position() {
        let coord = coordinator();
        let dummy = coord.synthesize_gga();
        assert!(dummy.contains("5213.0000,N"));

        coord.publish_position(position(52.2297));
        let gga = coord.synthesize_gga();
        assert!(gga.starts_with("$GNGGA,"));
        assert!(gga.contains("5213.7820,N"), "gga was {gga}");
        assert!(crate::nmea::checksum_ok(gga.trim_end()));
    }
}
