use std::fs;
use std::path::Path;

use log::debug;
use thiserror::Error;

/// Errors from coverage-map persistence and decoding.
#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Coverage map file not found: {0}")]
    MapFileMissing(String),
    #[error("Coverage map size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Coverage map I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CoverageError {
    fn from(err: std::io::Error) -> Self {
        CoverageError::Io(err.to_string())
    }
}

/// Number of bytes needed to hold one bit per edge.
pub fn bitmap_len(num_edges: u32) -> usize {
    (num_edges as usize).div_ceil(8)
}

/// Count edges hit in a per-run edge buffer (run sense: bit 1 = hit).
///
/// `0xff` short-circuits to 8 without per-bit inspection and `0x00` is
/// skipped entirely; run buffers are almost all zeros with occasional
/// saturated bytes, so the two sentinels carry most of the work.
pub fn count_hits(run_buf: &[u8]) -> usize {
    let mut hits = 0usize;
    for &byte in run_buf {
        match byte {
            0x00 => {}
            0xff => hits += 8,
            b => hits += b.count_ones() as usize,
        }
    }
    hits
}

/// True if the per-run buffer shows `edge` as hit.
pub fn run_contains(run_buf: &[u8], edge: u32) -> bool {
    let byte = (edge / 8) as usize;
    if byte >= run_buf.len() {
        return false;
    }
    run_buf[byte] & (1 << (edge % 8)) != 0
}

/// An owned point-in-time copy of the global map, for snapshot/rollback
/// around phases that perturb coverage (minimization, verification).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageSnapshot {
    bits: Vec<u8>,
    num_edges: u32,
}

impl CoverageSnapshot {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Write the snapshot to disk in the same raw dump format as a live map.
    pub fn save(&self, path: &Path) -> Result<(), CoverageError> {
        fs::write(path, &self.bits)?;
        Ok(())
    }
}

/// The global edge-coverage map.
///
/// Persisted sense is inverted: bit 1 = not yet triggered, bit 0 = triggered
/// at some point. A fresh map is all `0xff`. Within a session the map is
/// monotonic: bits only flip to 0 through [`CoverageMap::commit`], and only
/// [`CoverageMap::restore`], [`CoverageMap::load`] and
/// [`CoverageMap::reset_edges`] may bring a bit back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageMap {
    bits: Vec<u8>,
    num_edges: u32,
}

impl CoverageMap {
    /// A map with every edge still untriggered.
    pub fn new(num_edges: u32) -> Self {
        CoverageMap {
            bits: vec![0xff; bitmap_len(num_edges)],
            num_edges,
        }
    }

    pub fn num_edges(&self) -> u32 {
        self.num_edges
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Rebuild a map from a raw dump. The buffer length must match the
    /// edge count exactly; anything else is a corrupt or mismatched file.
    pub fn from_bytes(num_edges: u32, bytes: &[u8]) -> Result<Self, CoverageError> {
        let expected = bitmap_len(num_edges);
        if bytes.len() != expected {
            return Err(CoverageError::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(CoverageMap {
            bits: bytes.to_vec(),
            num_edges,
        })
    }

    /// True if `edge` has been triggered at some point in this map's history.
    pub fn is_triggered(&self, edge: u32) -> bool {
        if edge >= self.num_edges {
            return false;
        }
        self.bits[(edge / 8) as usize] & (1 << (edge % 8)) == 0
    }

    /// Total number of triggered edges. A byte still at `0xff` holds no
    /// triggered edges and is skipped without per-bit inspection.
    pub fn triggered_count(&self) -> usize {
        let mut count = 0usize;
        for (i, &byte) in self.bits.iter().enumerate() {
            if byte == 0xff {
                continue;
            }
            let valid = std::cmp::min(8, self.num_edges as usize - i * 8);
            let mask: u8 = if valid == 8 { 0xff } else { (1u8 << valid) - 1 };
            count += valid - (byte & mask).count_ones() as usize;
        }
        count
    }

    /// Ordered list of every triggered edge index.
    pub fn triggered_edges(&self) -> Vec<u32> {
        let mut edges = Vec::new();
        for (i, &byte) in self.bits.iter().enumerate() {
            if byte == 0xff {
                continue;
            }
            for bit in 0..8 {
                let edge = (i * 8 + bit) as u32;
                if edge >= self.num_edges {
                    break;
                }
                if byte & (1 << bit) == 0 {
                    edges.push(edge);
                }
            }
        }
        edges
    }

    /// Edges hit by a run buffer that are not yet triggered here. Does not
    /// modify the map; commit separately once the hits are trusted.
    pub fn peek_new(&self, run_buf: &[u8]) -> Vec<u32> {
        let mut new_edges = Vec::new();
        let limit = std::cmp::min(run_buf.len(), self.bits.len());
        for i in 0..limit {
            // A bit that is hit in the run and still set here is new.
            let candidates = run_buf[i] & self.bits[i];
            if candidates == 0 {
                continue;
            }
            for bit in 0..8 {
                let edge = (i * 8 + bit) as u32;
                if edge >= self.num_edges {
                    break;
                }
                if candidates & (1 << bit) != 0 {
                    new_edges.push(edge);
                }
            }
        }
        new_edges
    }

    /// Mark edges as permanently triggered.
    pub fn commit(&mut self, edges: &[u32]) {
        for &edge in edges {
            if edge < self.num_edges {
                self.bits[(edge / 8) as usize] &= !(1 << (edge % 8));
            }
        }
        if !edges.is_empty() {
            debug!(
                "Committed {} edges, {} total triggered",
                edges.len(),
                self.triggered_count()
            );
        }
    }

    /// Peek and commit in one step, returning the newly triggered edges.
    pub fn scan_and_commit(&mut self, run_buf: &[u8]) -> Vec<u32> {
        let new_edges = self.peek_new(run_buf);
        self.commit(&new_edges);
        new_edges
    }

    /// Flip edges back to untriggered so a verification replay can check
    /// they are rediscovered. The only sanctioned non-monotonic edit
    /// besides restore/load.
    pub fn reset_edges(&mut self, edges: &[u32]) {
        for &edge in edges {
            if edge < self.num_edges {
                self.bits[(edge / 8) as usize] |= 1 << (edge % 8);
            }
        }
    }

    pub fn backup(&self) -> CoverageSnapshot {
        CoverageSnapshot {
            bits: self.bits.clone(),
            num_edges: self.num_edges,
        }
    }

    pub fn restore(&mut self, snapshot: &CoverageSnapshot) {
        self.bits = snapshot.bits.clone();
        self.num_edges = snapshot.num_edges;
    }

    /// Edges triggered now that were still untriggered in `snapshot`.
    pub fn newly_triggered_since(&self, snapshot: &CoverageSnapshot) -> Vec<u32> {
        let mut edges = Vec::new();
        for (i, (&now, &then)) in self.bits.iter().zip(snapshot.bits.iter()).enumerate() {
            // Bits untriggered then and triggered now.
            let fresh = then & !now;
            if fresh == 0 {
                continue;
            }
            for bit in 0..8 {
                let edge = (i * 8 + bit) as u32;
                if edge < self.num_edges && fresh & (1 << bit) != 0 {
                    edges.push(edge);
                }
            }
        }
        edges
    }

    /// Raw dump to disk; format is the bitmap bytes and nothing else.
    pub fn save(&self, path: &Path) -> Result<(), CoverageError> {
        fs::write(path, &self.bits)?;
        Ok(())
    }

    /// Load a raw dump. The file must exist: callers that accept absence
    /// (resume-or-fresh startup) check beforehand.
    pub fn load(path: &Path, num_edges: u32) -> Result<Self, CoverageError> {
        if !path.exists() {
            return Err(CoverageError::MapFileMissing(path.display().to_string()));
        }
        let bytes = fs::read(path)?;
        CoverageMap::from_bytes(num_edges, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Build a run buffer with the given edges hit.
    fn run_buf(num_edges: u32, hits: &[u32]) -> Vec<u8> {
        let mut buf = vec![0u8; bitmap_len(num_edges)];
        for &edge in hits {
            buf[(edge / 8) as usize] |= 1 << (edge % 8);
        }
        buf
    }

    #[test]
    fn test_new_map_has_nothing_triggered() {
        let map = CoverageMap::new(64);
        assert_eq!(map.triggered_count(), 0);
        assert!(map.triggered_edges().is_empty());
        assert!(!map.is_triggered(0));
    }

    #[test]
    fn test_commit_marks_edges_triggered() {
        let mut map = CoverageMap::new(64);
        map.commit(&[0, 9, 63]);
        assert!(map.is_triggered(0));
        assert!(map.is_triggered(9));
        assert!(map.is_triggered(63));
        assert!(!map.is_triggered(1));
        assert_eq!(map.triggered_count(), 3);
        assert_eq!(map.triggered_edges(), vec![0, 9, 63]);
    }

    #[test]
    fn test_peek_new_reports_only_untriggered_hits() {
        let mut map = CoverageMap::new(32);
        map.commit(&[4]);
        let buf = run_buf(32, &[3, 4, 17]);
        assert_eq!(map.peek_new(&buf), vec![3, 17]);
        // Peek must not commit.
        assert!(!map.is_triggered(3));
    }

    #[test]
    fn test_scan_and_commit_is_idempotent_on_second_run() {
        let mut map = CoverageMap::new(32);
        let buf = run_buf(32, &[1, 2, 30]);
        assert_eq!(map.scan_and_commit(&buf), vec![1, 2, 30]);
        assert!(map.scan_and_commit(&buf).is_empty());
    }

    #[test]
    fn test_reset_edges_allows_rediscovery() {
        let mut map = CoverageMap::new(16);
        map.commit(&[5, 6]);
        map.reset_edges(&[5]);
        assert!(!map.is_triggered(5));
        assert!(map.is_triggered(6));
        let buf = run_buf(16, &[5, 6]);
        assert_eq!(map.peek_new(&buf), vec![5]);
    }

    #[test]
    fn test_backup_restore_round_trip() {
        let mut map = CoverageMap::new(128);
        map.commit(&[7, 70]);
        let snapshot = map.backup();
        map.commit(&[8, 9, 100]);
        assert_eq!(map.triggered_count(), 5);
        map.restore(&snapshot);
        assert_eq!(map.triggered_count(), 2);
        assert!(map.is_triggered(7));
        assert!(!map.is_triggered(8));
    }

    #[test]
    fn test_newly_triggered_since_snapshot() {
        let mut map = CoverageMap::new(64);
        map.commit(&[2]);
        let snapshot = map.backup();
        map.commit(&[3, 40]);
        assert_eq!(map.newly_triggered_since(&snapshot), vec![3, 40]);
        assert!(map.backup().as_bytes() != snapshot.as_bytes());
        map.restore(&snapshot);
        assert!(map.newly_triggered_since(&snapshot).is_empty());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut map = CoverageMap::new(100);
        map.commit(&[0, 1, 50, 99]);
        let decoded = CoverageMap::from_bytes(100, map.as_bytes()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        let err = CoverageMap::from_bytes(64, &[0u8; 3]).unwrap_err();
        match err {
            CoverageError::SizeMismatch { expected, actual } => {
                assert_eq!(expected, 8);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_count_hits_sentinel_bytes() {
        // 0xff decodes to all 8 edges hit, 0x00 to none.
        assert_eq!(count_hits(&[0xff]), 8);
        assert_eq!(count_hits(&[0x00]), 0);
        assert_eq!(count_hits(&[0xff, 0x00, 0b0000_0101]), 10);
    }

    #[test]
    fn test_run_contains_bit_addressing() {
        let buf = run_buf(32, &[0, 8, 31]);
        assert!(run_contains(&buf, 0));
        assert!(run_contains(&buf, 8));
        assert!(run_contains(&buf, 31));
        assert!(!run_contains(&buf, 1));
        assert!(!run_contains(&buf, 200));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coverage_final.bin");
        let mut map = CoverageMap::new(256);
        map.commit(&[12, 13, 200]);
        map.save(&path).unwrap();
        let loaded = CoverageMap::load(&path, 256).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does_not_exist.bin");
        let err = CoverageMap::load(&path, 64).unwrap_err();
        assert!(matches!(err, CoverageError::MapFileMissing(_)));
    }

    #[test]
    fn test_triggered_count_with_partial_final_byte() {
        // 12 edges: final byte only holds 4 valid bits.
        let mut map = CoverageMap::new(12);
        map.commit(&[8, 9, 10, 11]);
        assert_eq!(map.triggered_count(), 4);
        map.commit(&[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(map.triggered_count(), 12);
    }

    #[test]
    fn test_snapshot_save_matches_map_save() {
        let dir = tempdir().unwrap();
        let mut map = CoverageMap::new(64);
        map.commit(&[3, 33]);
        let snap_path = dir.path().join("coverage_previous.bin");
        map.backup().save(&snap_path).unwrap();
        let loaded = CoverageMap::load(&snap_path, 64).unwrap();
        assert_eq!(loaded, map);
    }
}
