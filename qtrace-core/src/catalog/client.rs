//! Producer-side catalog client
//!
//! The client owns the per-process cache from call site to descriptor and
//! the serialized registration path. It is created with its trace file and
//! reset when the tracer closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{encode_entry, fit_entry, CallSite, CatalogReader, Descriptor};
use crate::error::{QtError, Result};
use crate::format::ArgFormat;
use crate::trace::TraceFile;

/// Registers and caches message descriptors for one trace file
#[derive(Debug)]
pub struct CatalogClient {
    cache: RwLock<HashMap<CallSite, Arc<Descriptor>>>,
    registry: Mutex<CatalogReader>,
}

impl CatalogClient {
    /// Client for a file whose catalog starts at `catalog_offset`
    pub fn new(catalog_offset: u64) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            registry: Mutex::new(CatalogReader::new(catalog_offset)),
        }
    }

    /// Fast path: descriptor already known to this process
    pub fn cached(&self, site: &CallSite) -> Option<Arc<Descriptor>> {
        self.cache.read().ok()?.get(site).cloned()
    }

    /// Look up the descriptor for `site`, registering it on first use
    ///
    /// `template` is only evaluated when this process has not seen the
    /// site. If another process already registered the same site in this
    /// file, its descriptor is reused.
    pub fn lookup_or_create<F>(
        &self,
        file: &TraceFile,
        site: &CallSite,
        template: F,
    ) -> Result<Arc<Descriptor>>
    where
        F: FnOnce() -> (String, ArgFormat),
    {
        if let Some(desc) = self.cached(site) {
            return Ok(desc);
        }

        let mut registry = self.registry.lock().map_err(|_| QtError::InternalError {
            reason: "catalog registration lock poisoned".to_string(),
        })?;

        // Another thread may have registered while we waited.
        if let Some(desc) = self.cached(site) {
            return Ok(desc);
        }

        let _guard = file.lock_catalog();
        registry.refresh(file.catalog_file())?;

        let desc = match registry.find_site(site) {
            Some(existing) => existing.clone(),
            None => {
                let (text, format) = template();
                let mut desc = Descriptor {
                    id: 0,
                    file: site.file.to_string(),
                    line: site.line,
                    text,
                    format,
                    flags: site.flags(),
                };
                fit_entry(&mut desc)?;
                desc.id = file.allocate_id()?;
                file.append_catalog(&encode_entry(&desc))?;
                registry.refresh(file.catalog_file())?;
                match registry.get(desc.id) {
                    Some(stored) => stored.clone(),
                    None => Arc::new(desc),
                }
            }
        };

        tracing::debug!(
            id = desc.id,
            site = %site,
            text = %desc.text,
            "registered trace message"
        );

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(site.clone(), desc.clone());
        }
        Ok(desc)
    }

    /// Descriptor by id, rereading the file if this process has not seen it
    pub fn descriptor(&self, file: &TraceFile, id: u32) -> Option<Arc<Descriptor>> {
        let mut registry = self.registry.lock().ok()?;
        if registry.get(id).is_none() {
            if let Err(e) = registry.refresh(file.catalog_file()) {
                tracing::warn!(error = %e, "failed to reread catalog");
            }
        }
        registry.get(id).cloned()
    }

    /// Number of call sites cached by this process
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every cached call site
    pub fn reset(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOrigin;
    use crate::format::{FileHeader, NUM_LEVELS};
    use crate::trace::{Access, TraceFile};

    fn template() -> (String, ArgFormat) {
        ("hit %s".to_string(), ArgFormat::parse("q").unwrap_or_default())
    }

    #[test]
    fn test_first_registration_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let header = FileHeader::new([1; NUM_LEVELS], 24, 8, ClockOrigin::now(), 0);
        let file = TraceFile::create(&dir.path().join("c.qt"), header).unwrap();
        let client = CatalogClient::new(file.header().catalog_offset);
        let site = CallSite::new("c.rs", 4);

        let first = client.lookup_or_create(&file, &site, template).unwrap();
        let again = client
            .lookup_or_create(&file, &site, || panic!("template evaluated twice"))
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(client.len(), 1);

        let other = client
            .lookup_or_create(&file, &site.continuation(), template)
            .unwrap();
        assert_ne!(other.id, first.id);
        assert!(other.is_continuation());

        client.reset();
        assert!(client.is_empty());
    }

    #[test]
    fn test_second_writer_reuses_on_disk_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.qt");
        let header = FileHeader::new([1; NUM_LEVELS], 24, 8, ClockOrigin::now(), 0);
        let first = TraceFile::create(&path, header).unwrap();
        let second = TraceFile::open(&path, Access::ReadWrite).unwrap();
        let a = CatalogClient::new(first.header().catalog_offset);
        let b = CatalogClient::new(second.header().catalog_offset);

        let site = CallSite::dynamic(String::from("gen.rs"), 12);
        let registered = a.lookup_or_create(&first, &site, template).unwrap();
        let reused = b
            .lookup_or_create(&second, &site, || panic!("site was already registered"))
            .unwrap();
        assert_eq!(registered, reused);
        assert_eq!(b.descriptor(&second, registered.id).unwrap().text, "hit %s");
        assert!(b.descriptor(&second, 99).is_none());
    }
}
