use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{Context, Result};
use image::ImageFormat;
use image_hasher::{HashAlg, HasherConfig};
use log::{debug, warn};

/// Bounded store for screenshot payloads, keyed by perceptual hash.
///
/// Samples only carry the phash; the PNG bytes live here until their batch is
/// extracted. Over the byte budget the oldest frames are spilled to disk (when
/// a spill directory is configured) or dropped outright — a dropped frame
/// surfaces later as a batcher cache miss, which the pipeline tolerates.
pub struct FrameCache {
    inner: Mutex<CacheInner>,
    spill_dir: Option<PathBuf>,
    budget_bytes: usize,
}

struct CacheInner {
    frames: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
    total_bytes: usize,
}

impl FrameCache {
    pub fn new(budget_bytes: usize, spill_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &spill_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create spill directory {}", dir.display()))?;
        }

        Ok(Self {
            inner: Mutex::new(CacheInner {
                frames: HashMap::new(),
                order: VecDeque::new(),
                total_bytes: 0,
            }),
            spill_dir,
            budget_bytes,
        })
    }

    /// Hash and store a PNG payload, returning its phash key. Decoding and
    /// hashing are CPU-bound; call from `spawn_blocking` on hot paths.
    pub fn store(&self, png_bytes: Vec<u8>) -> Result<String> {
        let phash = compute_phash(&png_bytes)?;
        self.store_keyed(phash.clone(), png_bytes);
        Ok(phash)
    }

    /// Store a payload under a caller-computed key.
    pub fn store_keyed(&self, phash: String, png_bytes: Vec<u8>) {
        let mut inner = self.inner.lock().expect("frame cache lock");

        let new_len = png_bytes.len();
        match inner.frames.insert(phash.clone(), png_bytes) {
            Some(old) => inner.total_bytes -= old.len(),
            None => inner.order.push_back(phash),
        }
        inner.total_bytes += new_len;

        while inner.total_bytes > self.budget_bytes {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            let Some(bytes) = inner.frames.remove(&oldest) else {
                continue;
            };
            inner.total_bytes -= bytes.len();
            self.spill(&oldest, &bytes);
        }
    }

    /// Fetch a payload by phash, falling back to the spill directory. `None`
    /// means the frame was evicted for good.
    pub fn lookup(&self, phash: &str) -> Option<Vec<u8>> {
        {
            let inner = self.inner.lock().expect("frame cache lock");
            if let Some(bytes) = inner.frames.get(phash) {
                return Some(bytes.clone());
            }
        }

        let dir = self.spill_dir.as_ref()?;
        match std::fs::read(self.spill_path(dir, phash)) {
            Ok(bytes) => Some(bytes),
            Err(_) => None,
        }
    }

    /// Drop a frame everywhere; called once its batch has been extracted.
    pub fn discard(&self, phash: &str) {
        let mut inner = self.inner.lock().expect("frame cache lock");
        if let Some(bytes) = inner.frames.remove(phash) {
            inner.total_bytes -= bytes.len();
            inner.order.retain(|key| key != phash);
        }
        drop(inner);

        if let Some(dir) = &self.spill_dir {
            let _ = std::fs::remove_file(self.spill_path(dir, phash));
        }
    }

    fn spill(&self, phash: &str, bytes: &[u8]) {
        let Some(dir) = &self.spill_dir else {
            debug!("frame cache over budget, dropping frame {phash}");
            return;
        };

        if let Err(err) = std::fs::write(self.spill_path(dir, phash), bytes) {
            warn!("failed to spill frame {phash} to disk: {err}");
        }
    }

    fn spill_path(&self, dir: &std::path::Path, phash: &str) -> PathBuf {
        // phash is base64; make it filename-safe.
        let safe: String = phash
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        dir.join(format!("{safe}.png"))
    }
}

pub fn compute_phash(png_bytes: &[u8]) -> Result<String> {
    let img = image::load_from_memory_with_format(png_bytes, ImageFormat::Png)?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();

    Ok(hasher.hash_image(&img).to_base64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_looks_up_by_key() {
        let cache = FrameCache::new(1024, None).unwrap();
        cache.store_keyed("hash-a".into(), vec![1, 2, 3]);
        assert_eq!(cache.lookup("hash-a"), Some(vec![1, 2, 3]));
        assert_eq!(cache.lookup("hash-b"), None);
    }

    #[test]
    fn eviction_without_spill_dir_loses_oldest_frame() {
        let cache = FrameCache::new(4, None).unwrap();
        cache.store_keyed("old".into(), vec![0; 3]);
        cache.store_keyed("new".into(), vec![0; 3]);

        assert_eq!(cache.lookup("old"), None);
        assert_eq!(cache.lookup("new"), Some(vec![0; 3]));
    }

    #[test]
    fn discard_removes_frame() {
        let cache = FrameCache::new(1024, None).unwrap();
        cache.store_keyed("hash-a".into(), vec![9; 8]);
        cache.discard("hash-a");
        assert_eq!(cache.lookup("hash-a"), None);
    }
}
