use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide counters shared by every tier.
pub struct GatewayMonitor {
    // Comet
    pub connections_opened: AtomicU64,
    pub active_connections: AtomicU64,
    pub connections_closed: AtomicU64,
    pub supersedes: AtomicU64,
    pub auth_failures: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub forwarded: AtomicU64,
    pub unauthenticated_drops: AtomicU64,
    pub delivered: AtomicU64,
    pub undeliverable: AtomicU64,
    pub protocol_errors: AtomicU64,

    // Dispatch
    pub dispatched: AtomicU64,
    pub fanout_failures: AtomicU64,

    // Store / Push
    pub stored: AtomicU64,
    pub persistence_errors: AtomicU64,
    pub offline_notified: AtomicU64,

    pub transport_errors: AtomicU64,

    pub start_time: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub connections_opened: u64,
    pub active_connections: u64,
    pub connections_closed: u64,
    pub supersedes: u64,
    pub auth_failures: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub forwarded: u64,
    pub unauthenticated_drops: u64,
    pub delivered: u64,
    pub undeliverable: u64,
    pub protocol_errors: u64,
    pub dispatched: u64,
    pub fanout_failures: u64,
    pub stored: u64,
    pub persistence_errors: u64,
    pub offline_notified: u64,
    pub transport_errors: u64,
}

impl GatewayMonitor {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            supersedes: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            unauthenticated_drops: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            undeliverable: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),

            dispatched: AtomicU64::new(0),
            fanout_failures: AtomicU64::new(0),

            stored: AtomicU64::new(0),
            persistence_errors: AtomicU64::new(0),
            offline_notified: AtomicU64::new(0),

            transport_errors: AtomicU64::new(0),

            start_time: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        // saturating: a connection built outside the accept loop was never counted as opened
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MonitorSnapshot {
            connections_opened: load(&self.connections_opened),
            active_connections: load(&self.active_connections),
            connections_closed: load(&self.connections_closed),
            supersedes: load(&self.supersedes),
            auth_failures: load(&self.auth_failures),
            frames_in: load(&self.frames_in),
            frames_out: load(&self.frames_out),
            forwarded: load(&self.forwarded),
            unauthenticated_drops: load(&self.unauthenticated_drops),
            delivered: load(&self.delivered),
            undeliverable: load(&self.undeliverable),
            protocol_errors: load(&self.protocol_errors),
            dispatched: load(&self.dispatched),
            fanout_failures: load(&self.fanout_failures),
            stored: load(&self.stored),
            persistence_errors: load(&self.persistence_errors),
            offline_notified: load(&self.offline_notified),
            transport_errors: load(&self.transport_errors),
        }
    }

    pub fn render_summary(&self) {
        let s = self.snapshot();
        println!("\n╔═══════════════════════════════════════════════════════════════════════╗");
        println!("║                     IM GATEWAY SHUTDOWN SUMMARY                       ║");
        println!("╚═══════════════════════════════════════════════════════════════════════╝");
        println!("  Connections:        {} opened | {} closed | {} superseded", s.connections_opened, s.connections_closed, s.supersedes);
        println!("  Auth Failures:      {}", s.auth_failures);
        println!("  Frames:             {} in | {} out", s.frames_in, s.frames_out);
        println!("  Forwarded:          {} (dropped unauthenticated: {})", s.forwarded, s.unauthenticated_drops);
        println!("  Dispatched:         {} (fan-out failures: {})", s.dispatched, s.fanout_failures);
        println!("  Delivered:          {} (not held locally: {})", s.delivered, s.undeliverable);
        println!("  Stored:             {} (persistence errors: {})", s.stored, s.persistence_errors);
        println!("  Offline Notified:   {}", s.offline_notified);
        println!("  Errors:             {} transport | {} protocol", s.transport_errors, s.protocol_errors);
        println!("-------------------------------------------------------------------------");
        println!("  Uptime:             {:?}\n", self.uptime());
    }
}

impl Default for GatewayMonitor {
    fn default() -> Self {
        Self::new()
    }
}
