//! In-process operation counters.
//!
//! Plain atomics, snapshotted for `/metrics` and the storage-info
//! endpoint. The registry is injected into the services that record into
//! it, never reached through a global.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub uploads_ok: AtomicU64,
    pub uploads_failed: AtomicU64,
    pub downloads_ok: AtomicU64,
    pub downloads_failed: AtomicU64,
    pub deletes: AtomicU64,
    pub updates: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    pub mode_transitions: AtomicU64,
    pub proxied_requests: AtomicU64,
    pub wal_recovered: AtomicU64,
    pub gc_passes: AtomicU64,
    pub gc_expired: AtomicU64,
    pub gc_purged: AtomicU64,
    pub reconcile_runs: AtomicU64,
    pub orphan_data_files: AtomicU64,
    pub orphan_sidecars: AtomicU64,
    pub corrupt_objects: AtomicU64,
    pub index_refreshes: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uploads_ok: u64,
    pub uploads_failed: u64,
    pub downloads_ok: u64,
    pub downloads_failed: u64,
    pub deletes: u64,
    pub updates: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub mode_transitions: u64,
    pub proxied_requests: u64,
    pub wal_recovered: u64,
    pub gc_passes: u64,
    pub gc_expired: u64,
    pub gc_purged: u64,
    pub reconcile_runs: u64,
    pub orphan_data_files: u64,
    pub orphan_sidecars: u64,
    pub corrupt_objects: u64,
    pub index_refreshes: u64,
}

impl Metrics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uploads_ok: read(&self.uploads_ok),
            uploads_failed: read(&self.uploads_failed),
            downloads_ok: read(&self.downloads_ok),
            downloads_failed: read(&self.downloads_failed),
            deletes: read(&self.deletes),
            updates: read(&self.updates),
            bytes_uploaded: read(&self.bytes_uploaded),
            bytes_downloaded: read(&self.bytes_downloaded),
            mode_transitions: read(&self.mode_transitions),
            proxied_requests: read(&self.proxied_requests),
            wal_recovered: read(&self.wal_recovered),
            gc_passes: read(&self.gc_passes),
            gc_expired: read(&self.gc_expired),
            gc_purged: read(&self.gc_purged),
            reconcile_runs: read(&self.reconcile_runs),
            orphan_data_files: read(&self.orphan_data_files),
            orphan_sidecars: read(&self.orphan_sidecars),
            corrupt_objects: read(&self.corrupt_objects),
            index_refreshes: read(&self.index_refreshes),
        }
    }

    /// Plain-text exposition for the `/metrics` probe, one
    /// `se_<name> <value>` line per counter.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        let mut line = |name: &str, value: u64| {
            out.push_str("se_");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        };
        line("uploads_ok_total", s.uploads_ok);
        line("uploads_failed_total", s.uploads_failed);
        line("downloads_ok_total", s.downloads_ok);
        line("downloads_failed_total", s.downloads_failed);
        line("deletes_total", s.deletes);
        line("updates_total", s.updates);
        line("bytes_uploaded_total", s.bytes_uploaded);
        line("bytes_downloaded_total", s.bytes_downloaded);
        line("mode_transitions_total", s.mode_transitions);
        line("proxied_requests_total", s.proxied_requests);
        line("wal_recovered_total", s.wal_recovered);
        line("gc_passes_total", s.gc_passes);
        line("gc_expired_total", s.gc_expired);
        line("gc_purged_total", s.gc_purged);
        line("reconcile_runs_total", s.reconcile_runs);
        line("orphan_data_files", s.orphan_data_files);
        line("orphan_sidecars", s.orphan_sidecars);
        line("corrupt_objects", s.corrupt_objects);
        line("index_refreshes_total", s.index_refreshes);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.uploads_ok);
        Metrics::incr(&metrics.uploads_ok);
        Metrics::add(&metrics.bytes_uploaded, 1024);

        let snap = metrics.snapshot();
        assert_eq!(snap.uploads_ok, 2);
        assert_eq!(snap.bytes_uploaded, 1024);
        assert_eq!(snap.downloads_ok, 0);
    }

    #[test]
    fn text_render_has_one_line_per_counter() {
        let metrics = Metrics::default();
        Metrics::incr(&metrics.gc_passes);
        let text = metrics.render_text();
        assert!(text.contains("se_gc_passes_total 1\n"));
        assert!(text.lines().all(|l| l.starts_with("se_")));
    }
}
