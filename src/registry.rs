use crate::key::RegionKey;
use crate::region::{Region, RegionHandle};
use crate::utils::{read, write};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct RegistryInner {
    // dedup index; stored keys are always ranges
    by_key: BTreeMap<RegionKey, u32>,
    // dense id order, index = id - 1
    by_id: Vec<RegionHandle>,
}

/// Owns every [`Region`]. Ids are dense, start at 1 and are never reused;
/// interning the same key twice returns the first winner.
#[derive(Default)]
pub struct RegionRegistry {
    inner: RwLock<RegistryInner>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the region for `key`, creating it on first discovery. The
    /// discovery attributes of later equivalent keys are ignored.
    pub fn intern(
        &self,
        key: RegionKey,
        size_bytes: u64,
        inst_count: u32,
        module_id: u32,
    ) -> RegionHandle {
        {
            let inner = read(&self.inner);
            if let Some(id) = inner.by_key.get(&key) {
                return inner.by_id[(id - 1) as usize].clone();
            }
        }

        let mut inner = write(&self.inner);
        // lost the race to another discoverer
        if let Some(id) = inner.by_key.get(&key) {
            return inner.by_id[(id - 1) as usize].clone();
        }
        let id = inner.by_id.len() as u32 + 1;
        let region = Arc::new(Region::new(id, key, size_bytes, inst_count, module_id));
        inner.by_key.insert(key, id);
        inner.by_id.push(region.clone());
        region
    }

    pub fn find(&self, key: &RegionKey) -> Option<RegionHandle> {
        let inner = read(&self.inner);
        inner
            .by_key
            .get(key)
            .map(|id| inner.by_id[(id - 1) as usize].clone())
    }

    pub fn get(&self, id: u32) -> Option<RegionHandle> {
        let inner = read(&self.inner);
        if id == 0 {
            return None;
        }
        inner.by_id.get((id - 1) as usize).cloned()
    }

    /// Id-ordered snapshot for emission.
    pub fn snapshot(&self) -> Vec<RegionHandle> {
        read(&self.inner).by_id.clone()
    }

    pub fn len(&self) -> usize {
        read(&self.inner).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub id: u32,
    pub name: String,
    pub base: u64,
    pub loaded: bool,
}

#[derive(Default)]
struct ModuleRegistryInner {
    by_id: HashMap<u32, usize>,
    // insertion order, for G: line emission
    modules: Vec<ModuleInfo>,
}

/// Module table fed by the image loader collaborator. Info survives unload
/// so late symbolic rendering keeps working.
#[derive(Default)]
pub struct ModuleRegistry {
    inner: RwLock<ModuleRegistryInner>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, id: u32, name: &str, base: u64) -> ModuleInfo {
        let mut inner = write(&self.inner);
        if let Some(index) = inner.by_id.get(&id).copied() {
            warn!("module id {id} reloaded as {name} at {base:#x}, replacing previous entry");
            let entry = &mut inner.modules[index];
            entry.name = name.to_string();
            entry.base = base;
            entry.loaded = true;
            return entry.clone();
        }
        debug!("module {id} ({name}) loaded at {base:#x}");
        let info = ModuleInfo {
            id,
            name: name.to_string(),
            base,
            loaded: true,
        };
        let index = inner.modules.len();
        inner.modules.push(info.clone());
        inner.by_id.insert(id, index);
        info
    }

    pub fn unload(&self, id: u32) {
        let mut inner = write(&self.inner);
        if let Some(index) = inner.by_id.get(&id).copied() {
            inner.modules[index].loaded = false;
            debug!("module {id} unloaded");
        }
    }

    /// Name and base address for symbolic marker rendering.
    pub fn resolve(&self, id: u32) -> Option<(String, u64)> {
        let inner = read(&self.inner);
        inner
            .by_id
            .get(&id)
            .map(|index| {
                let info = &inner.modules[*index];
                (info.name.clone(), info.base)
            })
    }

    /// Insertion-order snapshot.
    pub fn snapshot(&self) -> Vec<ModuleInfo> {
        read(&self.inner).modules.clone()
    }
}
