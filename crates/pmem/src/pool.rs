//! Simulated persistent-memory pool
//!
//! The pool keeps two byte images of equal size:
//!
//! - the **cache**: what loads and stores see
//! - the **media**: what survives a crash
//!
//! A store lands in the cache and marks its 64-byte lines dirty. `flush`
//! snapshots dirty lines of a region into a pending write-back set; `fence`
//! drains the pending set into media. Nothing reaches media any other way,
//! so a crash (see [`crate::fault`]) loses exactly the stores that were not
//! both flushed and fenced.
//!
//! A pool opened with a backing file loads its media from that file and
//! writes it back on [`Pool::sync_to_file`].

use crate::config::PmemConfig;
use crate::fault::FaultInjector;
use crate::layout::{le_u64, CACHE_LINE, MAGIC_OFFSET, POOL_MAGIC};
use nvbench_core::{Error, Result};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};

struct Images {
    cache: Vec<u8>,
    media: Vec<u8>,
    dirty: FxHashSet<u64>,
    pending: FxHashMap<u64, [u8; CACHE_LINE as usize]>,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// `flush` calls
    pub flushes: u64,
    /// `fence` calls that succeeded
    pub fences: u64,
    /// Cache lines written back to media
    pub lines_written_back: u64,
}

/// Byte-addressable pool with explicit flush and fence
pub struct Pool {
    config: PmemConfig,
    images: Mutex<Images>,
    faults: FaultInjector,
    fresh: bool,
    flushes: AtomicU64,
    fences: AtomicU64,
    lines_written_back: AtomicU64,
}

impl Pool {
    /// Open a pool, loading media from the backing file if one exists
    ///
    /// A missing file, or no path at all, yields a freshly formatted pool.
    pub fn open(config: PmemConfig) -> Result<Self> {
        config.validate()?;
        let image = match &config.path {
            Some(path) if path.exists() => {
                let bytes = fs::read(path)?;
                tracing::info!(path = %path.display(), size = bytes.len(), "loaded pool image");
                Some(bytes)
            }
            _ => None,
        };
        match image {
            Some(bytes) => Self::from_image(config, bytes),
            None => Self::format(config),
        }
    }

    /// Rebuild a pool from a media image, as a restarted process would
    pub fn from_image(config: PmemConfig, image: Vec<u8>) -> Result<Self> {
        config.validate()?;
        if image.len() as u64 != config.size {
            return Err(Error::invalid_config(format!(
                "pool image is {} bytes, configured size is {}",
                image.len(),
                config.size
            )));
        }
        let magic = le_u64(&image[MAGIC_OFFSET as usize..]);
        if magic == 0 && image.iter().all(|b| *b == 0) {
            return Self::format(config);
        }
        if magic != POOL_MAGIC {
            return Err(Error::corruption("pool magic mismatch"));
        }
        Ok(Self::with_images(config, image, false))
    }

    fn format(config: PmemConfig) -> Result<Self> {
        let image = vec![0u8; config.size as usize];
        let pool = Self::with_images(config, image, true);
        pool.write_u64(MAGIC_OFFSET, POOL_MAGIC)?;
        pool.flush(MAGIC_OFFSET, 8)?;
        pool.fence()?;
        tracing::info!(size = pool.size(), "formatted new pool");
        Ok(pool)
    }

    fn with_images(config: PmemConfig, media: Vec<u8>, fresh: bool) -> Self {
        Pool {
            images: Mutex::new(Images {
                cache: media.clone(),
                media,
                dirty: FxHashSet::default(),
                pending: FxHashMap::default(),
            }),
            config,
            faults: FaultInjector::new(),
            fresh,
            flushes: AtomicU64::new(0),
            fences: AtomicU64::new(0),
            lines_written_back: AtomicU64::new(0),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PmemConfig {
        &self.config
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.config.size
    }

    /// True if this pool was formatted on open rather than loaded
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Fault injector shared by every protocol running on this pool
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    fn check_range(&self, off: u64, len: u64) -> Result<()> {
        match off.checked_add(len) {
            Some(end) if end <= self.config.size => Ok(()),
            _ => Err(Error::corruption(format!(
                "access [{}, +{}) outside pool of {} bytes",
                off, len, self.config.size
            ))),
        }
    }

    // ========================================================================
    // Loads and stores (cache image)
    // ========================================================================

    /// Store bytes into the cache
    pub fn write(&self, off: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        self.check_range(off, len)?;
        if len == 0 {
            return Ok(());
        }
        let mut images = self.images.lock();
        let start = off as usize;
        images.cache[start..start + bytes.len()].copy_from_slice(bytes);
        let first = off / CACHE_LINE;
        let last = (off + len - 1) / CACHE_LINE;
        for line in first..=last {
            images.dirty.insert(line);
        }
        Ok(())
    }

    /// Store one little-endian word
    pub fn write_u64(&self, off: u64, value: u64) -> Result<()> {
        self.write(off, &value.to_le_bytes())
    }

    /// Store `len` zero bytes
    pub fn zero(&self, off: u64, len: u64) -> Result<()> {
        self.write(off, &vec![0u8; len as usize])
    }

    /// Load bytes from the cache into `buf`
    pub fn read_into(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(off, buf.len() as u64)?;
        let images = self.images.lock();
        let start = off as usize;
        buf.copy_from_slice(&images.cache[start..start + buf.len()]);
        Ok(())
    }

    /// Load `len` bytes from the cache
    pub fn read(&self, off: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read_into(off, &mut buf)?;
        Ok(buf)
    }

    /// Load one little-endian word
    pub fn read_u64(&self, off: u64) -> Result<u64> {
        let mut word = [0u8; 8];
        self.read_into(off, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Schedule the dirty lines of a region for write-back
    ///
    /// Lines that were not stored to since their last flush are skipped.
    pub fn flush(&self, off: u64, len: u64) -> Result<()> {
        self.check_range(off, len)?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if len == 0 {
            return Ok(());
        }
        let mut images = self.images.lock();
        let images = &mut *images;
        let first = off / CACHE_LINE;
        let last = (off + len - 1) / CACHE_LINE;
        for line in first..=last {
            if images.dirty.remove(&line) {
                let start = (line * CACHE_LINE) as usize;
                let mut snapshot = [0u8; CACHE_LINE as usize];
                snapshot.copy_from_slice(&images.cache[start..start + CACHE_LINE as usize]);
                images.pending.insert(line, snapshot);
            }
        }
        Ok(())
    }

    /// Make every flushed line durable
    ///
    /// # Errors
    ///
    /// [`Error::Durability`] when fence failure is injected. Pending lines
    /// are kept so that nothing is reported durable that is not.
    pub fn fence(&self) -> Result<()> {
        if !self.faults.admit_fence() {
            tracing::error!("fence failed");
            return Err(Error::durability("fence did not complete"));
        }
        let mut images = self.images.lock();
        let images = &mut *images;
        if self.faults.crashed() {
            images.pending.clear();
            return Ok(());
        }
        let written = images.pending.len() as u64;
        for (line, bytes) in images.pending.drain() {
            let start = (line * CACHE_LINE) as usize;
            images.media[start..start + CACHE_LINE as usize].copy_from_slice(&bytes);
        }
        self.fences.fetch_add(1, Ordering::Relaxed);
        self.lines_written_back.fetch_add(written, Ordering::Relaxed);
        Ok(())
    }

    /// Flush a region and fence
    pub fn persist(&self, off: u64, len: u64) -> Result<()> {
        self.flush(off, len)?;
        self.fence()
    }

    /// Copy of the media image: what a restart after a crash right now
    /// would find
    pub fn media_image(&self) -> Vec<u8> {
        self.images.lock().media.clone()
    }

    /// Write the media image to the backing file, if any
    ///
    /// The image is written to a sibling temporary file and renamed over
    /// the target.
    pub fn sync_to_file(&self) -> Result<()> {
        let Some(path) = &self.config.path else {
            return Ok(());
        };
        let image = self.media_image();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &image)?;
        fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), size = image.len(), "synced pool image");
        Ok(())
    }

    /// Counters since open
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            fences: self.fences.load(Ordering::Relaxed),
            lines_written_back: self.lines_written_back.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.config.size)
            .field("path", &self.config.path)
            .field("fresh", &self.fresh)
            .finish()
    }
}
