use crate::utils::{read, write};
use anyhow::Result;
use log::{debug, warn};
use object::{Object, ObjectSymbol};
use std::collections::HashMap;
use std::path::Path;

/// Thread-team-creation routines whose entry addresses anchor barrier
/// flushes. Matching is by exact externally-visible name.
pub const RECOGNIZED_ROUTINES: &[&str] =
    &["GOMP_parallel_start", "GOMP_parallel", "__kmpc_fork_call"];

#[derive(Default)]
struct RecognizerInner {
    // entry address -> owning module id
    by_addr: HashMap<u64, u32>,
    // routine name -> first claimed address
    claims: HashMap<String, u64>,
}

/// Resolves parallel-region-entry addresses from module routine lists.
/// The first module to claim a routine name wins; duplicates are ignored
/// with a warning.
#[derive(Default)]
pub struct BarrierRecognizer {
    inner: std::sync::RwLock<RecognizerInner>,
}

impl BarrierRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the externally visible routines of a newly loaded module.
    pub fn register_routines(&self, module_id: u32, routines: &[(String, u64)]) {
        let mut inner = write(&self.inner);
        for (name, addr) in routines {
            if !RECOGNIZED_ROUTINES.contains(&name.as_str()) {
                continue;
            }
            if let Some(claimed) = inner.claims.get(name) {
                warn!(
                    "routine {name} at {addr:#x} already claimed at {claimed:#x}, ignoring duplicate"
                );
                continue;
            }
            debug!("parallel region entry {name} at {addr:#x} (module {module_id})");
            inner.claims.insert(name.clone(), *addr);
            inner.by_addr.insert(*addr, module_id);
        }
    }

    /// Owning module id when `addr` is a registered parallel entry point.
    pub fn recognized(&self, addr: u64) -> Option<u32> {
        read(&self.inner).by_addr.get(&addr).copied()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.inner).by_addr.is_empty()
    }
}

/// Scan an ELF's symbol tables for the recognized routine names.
pub fn scan_parallel_entries<P: AsRef<Path>>(elf: P) -> Result<Vec<(String, u64)>> {
    let binary_data = std::fs::read(elf)?;
    let file = object::File::parse(&*binary_data)?;
    let mut routines = vec![];
    for symbol in file.symbols().chain(file.dynamic_symbols()) {
        if let Ok(name) = symbol.name() {
            if RECOGNIZED_ROUTINES.contains(&name) && symbol.address() != 0 {
                routines.push((name.to_string(), symbol.address()));
            }
        }
    }
    Ok(routines)
}
