use crate::barrier::BarrierRecognizer;
use crate::counters::ThreadCounters;
use crate::emitter::{BbWriter, FinalBlock, Marker, SliceComment};
use crate::key::RegionKey;
use crate::region::RegionHandle;
use crate::registry::{ModuleRegistry, RegionRegistry};
use crate::scheduler::{GlobalTimer, ScopePolicy, SliceTimer};
use crate::utils::{lock, read, write};
use anyhow::{Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const DEFAULT_SLICE_SIZE: i64 = 100000000;

/// Session parameters, validated by [`SamplingSession::new`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Instructions per slice.
    pub slice_size: i64,
    pub policy: ScopePolicy,
    /// Output files are `<base>.T.<slot>.bb` plus, under shared-scope
    /// policies, `<base>.global.bb`.
    pub output_base: PathBuf,
    /// `S:` marker lines when true, `M:` lines otherwise.
    pub symbolic_markers: bool,
    /// Track region-to-region transition counts.
    pub track_prev_region: bool,
    /// Rendered into each file's `C:` header line.
    pub command_line: String,
    /// Optional log of barrier-entry reaches.
    pub barrier_log: Option<PathBuf>,
}

impl SessionConfig {
    pub fn new<P: Into<PathBuf>>(output_base: P) -> Self {
        Self {
            slice_size: DEFAULT_SLICE_SIZE,
            policy: ScopePolicy::SingleThread,
            output_base: output_base.into(),
            symbolic_markers: true,
            track_prev_region: false,
            command_line: String::new(),
            barrier_log: None,
        }
    }
}

struct SlotState {
    counters: ThreadCounters,
    timer: SliceTimer,
    // single-thread policy: this slot's vector fired but is not yet emitted
    pending: bool,
    writer: BbWriter,
}

/// One observed thread. Slots are assigned on first event, densely from 0,
/// and never reclaimed.
struct ThreadSlot {
    slot: u32,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotTable {
    by_tid: HashMap<u64, usize>,
    slots: Vec<Arc<ThreadSlot>>,
}

struct GlobalScope {
    timer: GlobalTimer,
    pending: AtomicBool,
    icount: AtomicI64,
    // also the cross-flush ordering token, held across a boundary's file io
    writer: Mutex<BbWriter>,
}

/// End-of-run totals, also serialized by the replay driver.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub policy: String,
    pub slice_size: i64,
    pub total_instructions: i64,
    pub regions: usize,
    pub threads: usize,
    pub global_slices: u64,
    pub thread_slices: Vec<u64>,
}

/// A profiling session: region registry, per-thread and shared counters,
/// slice scheduling and `.bb` emission, driven by region-entry events.
pub struct SamplingSession {
    config: SessionConfig,
    regions: RegionRegistry,
    modules: ModuleRegistry,
    barriers: BarrierRecognizer,
    slots: RwLock<SlotTable>,
    global: Option<GlobalScope>,
    // recorders hold this for read; shared-boundary snapshots for write
    world: RwLock<()>,
    // start addresses that anchored an emitted boundary, for force-emit
    start_slices: Mutex<BTreeSet<u64>>,
    barrier_log: Option<Mutex<BufWriter<File>>>,
}

fn scoped_path(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

impl SamplingSession {
    pub fn new(config: SessionConfig) -> Result<Self> {
        if config.slice_size <= 0 {
            bail!("slice size must be positive, got {}", config.slice_size);
        }
        if config.policy == ScopePolicy::ThreadProgress(0) {
            bail!("thread-progress divisor must be at least 1");
        }
        let global = if config.policy.is_global() {
            let path = scoped_path(&config.output_base, ".global.bb");
            let writer = BbWriter::create(
                &path,
                0,
                &config.command_line,
                &[],
                config.symbolic_markers,
            )?;
            Some(GlobalScope {
                timer: GlobalTimer::new(config.slice_size),
                pending: AtomicBool::new(false),
                icount: AtomicI64::new(0),
                writer: Mutex::new(writer),
            })
        } else {
            None
        };
        let barrier_log = match &config.barrier_log {
            Some(path) => Some(Mutex::new(BufWriter::new(File::create(path)?))),
            None => None,
        };
        debug!(
            "sampling session: policy {}, slice size {}",
            config.policy, config.slice_size
        );
        Ok(Self {
            config,
            regions: RegionRegistry::new(),
            modules: ModuleRegistry::new(),
            barriers: BarrierRecognizer::new(),
            slots: RwLock::new(SlotTable::default()),
            global,
            world: RwLock::new(()),
            start_slices: Mutex::new(BTreeSet::new()),
            barrier_log,
        })
    }

    /// Region discovery front-end: intern `(start, end, sizes, module)` and
    /// hand back the handle used for entry events.
    pub fn register_region(
        &self,
        start: u64,
        end: u64,
        size_bytes: u64,
        inst_count: u32,
        module_id: u32,
    ) -> RegionHandle {
        self.regions
            .intern(RegionKey::range(start, end), size_bytes, inst_count, module_id)
    }

    /// Image-loader notification. `routines` lists the module's externally
    /// visible routines for barrier recognition.
    pub fn module_loaded(
        &self,
        id: u32,
        name: &str,
        base: u64,
        routines: &[(String, u64)],
    ) -> Result<()> {
        let info = self.modules.load(id, name, base);
        self.barriers.register_routines(id, routines);
        if let Some(global) = &self.global {
            lock(&global.writer).module_loaded(&info)?;
        }
        let slots = read(&self.slots).slots.clone();
        for slot in slots {
            lock(&slot.state).writer.module_loaded(&info)?;
        }
        Ok(())
    }

    pub fn module_unloaded(&self, id: u32) {
        self.modules.unload(id);
    }

    fn slot_for(&self, os_tid: u64) -> Result<Arc<ThreadSlot>> {
        {
            let slots = read(&self.slots);
            if let Some(index) = slots.by_tid.get(&os_tid) {
                return Ok(slots.slots[*index].clone());
            }
        }
        let mut slots = write(&self.slots);
        if let Some(index) = slots.by_tid.get(&os_tid) {
            return Ok(slots.slots[*index].clone());
        }
        let slot_id = slots.slots.len() as u32;
        let path = scoped_path(&self.config.output_base, &format!(".T.{slot_id}.bb"));
        let writer = BbWriter::create(
            &path,
            slot_id,
            &self.config.command_line,
            &self.modules.snapshot(),
            self.config.symbolic_markers,
        )?;
        debug!("thread {os_tid} assigned slot {slot_id}");
        let slot = Arc::new(ThreadSlot {
            slot: slot_id,
            state: Mutex::new(SlotState {
                counters: ThreadCounters::new(),
                timer: SliceTimer::new(self.config.policy.thread_budget(self.config.slice_size)),
                pending: false,
                writer,
            }),
        });
        slots.by_tid.insert(os_tid, slot_id as usize);
        slots.slots.push(slot.clone());
        Ok(slot)
    }

    /// One dynamic execution of `region` on `os_tid`.
    pub fn on_region_entry(&self, region: &RegionHandle, os_tid: u64) -> Result<()> {
        let slot = self.slot_for(os_tid)?;

        // a pending shared slice is flushed before this execution is
        // recorded, so the triggering region opens the fresh interval
        if let Some(global) = &self.global {
            if global.pending.load(Ordering::Relaxed) {
                let module = self.modules.resolve(region.module_id);
                self.flush_global(region.key.start(), module, 0)?;
            }
        }

        let _world = read(&self.world);
        let mut state = lock(&slot.state);
        match &self.global {
            None => {
                if state.pending {
                    let module = self.modules.resolve(region.module_id);
                    self.flush_slot(&mut state, region.key.start(), module, 0)?;
                }
                state.counters.record(region, self.config.track_prev_region);
                if state.timer.consume(region.inst_count as i64) {
                    state.timer.recharge(self.config.slice_size);
                    state.pending = true;
                }
            }
            Some(global) => {
                let prev = state.counters.last_region;
                state.counters.record(region, self.config.track_prev_region);
                region.record_global(prev, self.config.track_prev_region);
                global.icount.fetch_add(region.inst_count as i64, Ordering::Relaxed);
                let fired = match self.config.policy {
                    ScopePolicy::ThreadProgress(_) => {
                        let fired = state.timer.consume(region.inst_count as i64);
                        if fired {
                            state
                                .timer
                                .extend(self.config.policy.thread_budget(self.config.slice_size));
                        }
                        fired
                    }
                    _ => {
                        let fired = global.timer.consume(region.inst_count as i64);
                        if fired {
                            global.timer.recharge(self.config.slice_size);
                        }
                        fired
                    }
                };
                if fired {
                    global.pending.store(true, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Reach of a possible thread-team-creation entry point. Recognized
    /// addresses force a pending slice to flush there, with the marker
    /// count offset by one for the not-yet-recorded in-flight execution.
    pub fn on_parallel_region_entry(&self, addr: u64, os_tid: u64) -> Result<()> {
        let Some(module_id) = self.barriers.recognized(addr) else {
            return Ok(());
        };
        let slot = self.slot_for(os_tid)?;
        if let Some(log) = &self.barrier_log {
            writeln!(lock(log), "tid: {} Entering barrier at {:#x}", slot.slot, addr)?;
        }
        let module = self.modules.resolve(module_id);
        match &self.global {
            Some(global) => {
                if global.pending.load(Ordering::Relaxed) {
                    self.flush_global(addr, module, 1)?;
                }
            }
            None => {
                let _world = read(&self.world);
                let mut state = lock(&slot.state);
                if state.pending {
                    self.flush_slot(&mut state, addr, module, 1)?;
                }
            }
        }
        Ok(())
    }

    // single-thread policy flush; caller holds the slot mutex
    fn flush_slot(
        &self,
        state: &mut SlotState,
        marker_addr: u64,
        marker_module: Option<(String, u64)>,
        offset: i64,
    ) -> Result<()> {
        let regions = self.regions.snapshot();
        let vector: Vec<(u32, i64)> = state
            .counters
            .take_slice_vector()
            .into_iter()
            .map(|(id, execs)| (id, execs * regions[(id - 1) as usize].inst_count as i64))
            .collect();
        let mut count = offset;
        for region in &regions {
            if region.key.contains(marker_addr) {
                count += state.counters.total(region.id);
            }
        }
        lock(&self.start_slices).insert(marker_addr);
        state.pending = false;
        state.writer.emit_slice(
            SliceComment::Local(state.counters.icount),
            &vector,
            &Marker {
                addr: marker_addr,
                count,
                module: marker_module,
            },
        )?;
        Ok(())
    }

    // shared-scope flush: one boundary across the global file and every
    // thread file
    fn flush_global(
        &self,
        marker_addr: u64,
        marker_module: Option<(String, u64)>,
        offset: i64,
    ) -> Result<()> {
        let Some(global) = &self.global else {
            return Ok(());
        };
        let mut global_writer = lock(&global.writer);
        // claim the boundary; losers of the race leave quietly
        if !global.pending.swap(false, Ordering::Relaxed) {
            return Ok(());
        }

        let icount;
        let mut global_vector = vec![];
        let mut global_count = offset;
        let slots;
        let mut slot_flushes = vec![];
        {
            // bounded critical section: snapshot-and-reset, no file io
            let _world = write(&self.world);
            // taken with the world stopped: ids drained from the slots
            // below never exceed this snapshot
            let regions = self.regions.snapshot();
            icount = global.icount.load(Ordering::Relaxed);
            for region in &regions {
                let execs = region.fold_global();
                if execs != 0 {
                    global_vector.push((region.id, execs * region.inst_count as i64));
                }
                if region.key.contains(marker_addr) {
                    global_count += region.global_total();
                }
            }
            slots = read(&self.slots).slots.clone();
            for slot in &slots {
                let mut state = lock(&slot.state);
                let vector: Vec<(u32, i64)> = state
                    .counters
                    .take_slice_vector()
                    .into_iter()
                    .map(|(id, execs)| (id, execs * regions[(id - 1) as usize].inst_count as i64))
                    .collect();
                let mut count = offset;
                for region in &regions {
                    if region.key.contains(marker_addr) {
                        count += state.counters.total(region.id);
                    }
                }
                slot_flushes.push((vector, count));
            }
        }

        lock(&self.start_slices).insert(marker_addr);
        global_writer.emit_slice(
            SliceComment::Global(icount),
            &global_vector,
            &Marker {
                addr: marker_addr,
                count: global_count,
                module: marker_module.clone(),
            },
        )?;
        for (slot, (vector, count)) in slots.iter().zip(slot_flushes) {
            let mut state = lock(&slot.state);
            state.writer.emit_slice(
                SliceComment::Global(icount),
                &vector,
                &Marker {
                    addr: marker_addr,
                    count,
                    module: marker_module.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Finalize the session: fold still-pending counters, emit every
    /// scope's cumulative dump and flush all outputs.
    pub fn finish(self) -> Result<SessionSummary> {
        let regions = self.regions.snapshot();
        let start_slices = lock(&self.start_slices).clone();
        let force = |key: &RegionKey| start_slices.contains(&key.start());

        let mut summary = SessionSummary {
            policy: self.config.policy.to_string(),
            slice_size: self.config.slice_size,
            total_instructions: 0,
            regions: regions.len(),
            threads: 0,
            global_slices: 0,
            thread_slices: vec![],
        };

        if let Some(global) = &self.global {
            let mut writer = lock(&global.writer);
            let mut blocks = vec![];
            for region in &regions {
                region.fold_global();
                let count = region.global_cumulative();
                if count == 0 && !force(&region.key) {
                    continue;
                }
                blocks.push(FinalBlock {
                    id: region.id,
                    start: region.key.start(),
                    end: region.key.end(),
                    static_insts: region.inst_count,
                    count,
                    size_bytes: region.size_bytes,
                    prev: region.global_prev_snapshot(),
                });
            }
            let icount = global.icount.load(Ordering::Relaxed);
            writer.emit_final(icount, self.config.slice_size, &blocks)?;
            writer.flush()?;
            summary.total_instructions = icount;
            summary.global_slices = writer.slices();
        }

        let slots = read(&self.slots).slots.clone();
        for slot in &slots {
            let mut state = lock(&slot.state);
            // pending executions fold into cumulative, no trailing vector
            state.counters.take_slice_vector();
            let mut blocks = vec![];
            for region in &regions {
                let counts = state.counters.get(region.id);
                let count = counts.map_or(0, |c| c.cumulative);
                if count == 0 && !force(&region.key) {
                    continue;
                }
                blocks.push(FinalBlock {
                    id: region.id,
                    start: region.key.start(),
                    end: region.key.end(),
                    static_insts: region.inst_count,
                    count,
                    size_bytes: region.size_bytes,
                    prev: counts.map_or(vec![], |c| {
                        c.prev.iter().map(|(id, n)| (*id, *n)).collect()
                    }),
                });
            }
            let icount = state.counters.icount;
            state.writer.emit_final(icount, self.config.slice_size, &blocks)?;
            state.writer.flush()?;
            if self.global.is_none() {
                summary.total_instructions += icount;
            }
            summary.threads += 1;
            summary.thread_slices.push(state.writer.slices());
        }

        if let Some(log) = &self.barrier_log {
            lock(log).flush()?;
        }
        debug!(
            "session finished: {} instructions over {} regions",
            summary.total_instructions, summary.regions
        );
        Ok(summary)
    }
}
