pub mod gpu;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::common::error::RunnerError;
use crate::common::format::human_size;

/// A resource ask as it arrives inside an experiment request, and also the
/// shape of headroom snapshots handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceAsk {
    pub cpus: u32,
    pub ram: u64,
    pub disk: u64,
    pub gpus: u32,
    pub gpu_mem: u64,
}

impl ResourceAsk {
    /// Whether this ask could be satisfied by a host with `headroom` free.
    /// The gpu fields of a headroom snapshot describe the single most
    /// capable board, matching the ledger's no-spanning rule.
    pub fn fits(&self, headroom: &ResourceAsk) -> bool {
        self.cpus <= headroom.cpus
            && self.ram <= headroom.ram
            && self.disk <= headroom.disk
            && self.gpus <= headroom.gpus
            && (self.gpus == 0 || self.gpu_mem <= headroom.gpu_mem)
    }
}

/// One physical GPU board and its schedulable slot count.
#[derive(Debug, Clone)]
pub struct GpuBoard {
    pub id: u32,
    pub name: String,
    pub slots: u32,
    pub mem: u64,
}

#[derive(Debug)]
struct BoardState {
    board: GpuBoard,
    free_slots: u32,
    free_mem: u64,
}

/// GPU portion of an allocation.  `env` pins the experiment process onto the
/// granted board.
#[derive(Debug, Clone)]
pub struct GpuGrant {
    pub board: u32,
    pub slots: u32,
    pub mem: u64,
}

impl GpuGrant {
    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), self.board.to_string());
        env.insert("CUDA_DEVICE_ORDER".to_string(), "PCI_BUS_ID".to_string());
        env
    }
}

/// Receipt for a successful reservation.  Owned by exactly one executor and
/// handed back through `ResourceLedger::release` on every exit path.
#[derive(Debug)]
pub struct Allocation {
    id: u64,
    pub cpus: u32,
    pub ram: u64,
    pub disk: u64,
    pub gpu: Option<GpuGrant>,
}

impl Allocation {
    pub fn env(&self) -> HashMap<String, String> {
        self.gpu.as_ref().map(|g| g.env()).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Capacity {
    pub cpus: u32,
    pub ram: u64,
    pub disk: u64,
    pub boards: Vec<GpuBoard>,
}

impl Capacity {
    /// Derives the host capacity from hardware introspection, clamped by the
    /// operator supplied limits.  A zero limit means "everything available";
    /// a zero disk limit means 85% of the free space under `working_dir`.
    pub fn detect(
        working_dir: &Path,
        max_cores: u32,
        max_mem: u64,
        max_disk: u64,
        cpu_only: bool,
    ) -> crate::Result<Capacity> {
        let detected_cpus = num_cpus::get() as u32;
        let cpus = if max_cores == 0 {
            detected_cpus
        } else {
            max_cores.min(detected_cpus)
        };

        let total_ram = psutil::memory::virtual_memory()
            .map_err(|e| RunnerError::Config(format!("cannot read host memory: {e}")))?
            .total();
        let ram = if max_mem == 0 { total_ram } else { max_mem.min(total_ram) };

        let free_disk = psutil::disk::disk_usage(working_dir)
            .map_err(|e| {
                RunnerError::Config(format!(
                    "cannot read disk usage for {}: {e}",
                    working_dir.display()
                ))
            })?
            .free();
        let disk = if max_disk == 0 {
            free_disk / 100 * 85
        } else {
            max_disk.min(free_disk)
        };
        if disk == 0 {
            return Err(RunnerError::Config(format!(
                "insufficient disk storage available under {}",
                working_dir.display()
            )));
        }

        let boards = match gpu::detect_boards() {
            Ok(boards) => boards,
            Err(err) if cpu_only => {
                log::debug!("gpu detection skipped: {err}");
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        if boards.is_empty() && !cpu_only {
            return Err(RunnerError::Config(
                "no available GPUs could be detected, pass --cpu-only to start anyway".to_string(),
            ));
        }

        Ok(Capacity { cpus, ram, disk, boards })
    }
}

#[derive(Debug)]
struct LedgerState {
    free_cpus: u32,
    free_ram: u64,
    free_disk: u64,
    boards: Vec<BoardState>,
    outstanding: HashSet<u64>,
    next_id: u64,
}

/// The single source of truth for what this host can still accept.  All
/// bookkeeping happens under one mutex which is never held across I/O.
pub struct ResourceLedger {
    capacity: Capacity,
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new(capacity: Capacity) -> Self {
        let state = LedgerState {
            free_cpus: capacity.cpus,
            free_ram: capacity.ram,
            free_disk: capacity.disk,
            boards: capacity
                .boards
                .iter()
                .map(|board| BoardState {
                    free_slots: board.slots,
                    free_mem: board.mem,
                    board: board.clone(),
                })
                .collect(),
            outstanding: HashSet::new(),
            next_id: 1,
        };
        ResourceLedger {
            capacity,
            state: Mutex::new(state),
        }
    }

    pub fn capacity(&self) -> &Capacity {
        &self.capacity
    }

    /// Atomically reserves the asked resources, or reports the tightest
    /// binding dimension so the scheduler can emit an informative back-off.
    pub fn reserve(&self, ask: &ResourceAsk) -> crate::Result<Allocation> {
        let mut state = self.state.lock().unwrap();

        // (dimension, requested, free) for every dimension that cannot be met
        let mut failing: Vec<(&'static str, u64, u64)> = Vec::new();
        if ask.cpus > state.free_cpus {
            failing.push(("cpus", ask.cpus as u64, state.free_cpus as u64));
        }
        if ask.ram > state.free_ram {
            failing.push(("ram", ask.ram, state.free_ram));
        }
        if ask.disk > state.free_disk {
            failing.push(("disk", ask.disk, state.free_disk));
        }

        let board_idx = if ask.gpus > 0 {
            match Self::best_fit_board(&state.boards, ask) {
                Ok(idx) => Some(idx),
                Err(binding) => {
                    failing.push(binding);
                    None
                }
            }
        } else {
            None
        };

        if !failing.is_empty() {
            // The dimension with the least headroom relative to the ask.
            let (dimension, requested, free) = failing
                .into_iter()
                .min_by(|a, b| {
                    let ra = a.2 as f64 / a.1 as f64;
                    let rb = b.2 as f64 / b.1 as f64;
                    ra.partial_cmp(&rb).unwrap()
                })
                .unwrap();
            return Err(RunnerError::InsufficientResources {
                dimension,
                requested,
                free,
            });
        }

        state.free_cpus -= ask.cpus;
        state.free_ram -= ask.ram;
        state.free_disk -= ask.disk;
        let gpu = board_idx.map(|idx| {
            let board = &mut state.boards[idx];
            board.free_slots -= ask.gpus;
            board.free_mem -= ask.gpu_mem;
            GpuGrant {
                board: board.board.id,
                slots: ask.gpus,
                mem: ask.gpu_mem,
            }
        });

        let id = state.next_id;
        state.next_id += 1;
        state.outstanding.insert(id);

        Ok(Allocation {
            id,
            cpus: ask.cpus,
            ram: ask.ram,
            disk: ask.disk,
            gpu,
        })
    }

    /// Best-fit board selection: among boards that satisfy both the slot and
    /// the device memory ask, prefer the fewest free slots so large boards
    /// stay empty for large asks.
    fn best_fit_board(
        boards: &[BoardState],
        ask: &ResourceAsk,
    ) -> std::result::Result<usize, (&'static str, u64, u64)> {
        let candidate = boards
            .iter()
            .enumerate()
            .filter(|(_, b)| b.free_slots >= ask.gpus && b.free_mem >= ask.gpu_mem)
            .min_by_key(|(_, b)| (b.free_slots, b.free_mem))
            .map(|(idx, _)| idx);
        if let Some(idx) = candidate {
            return Ok(idx);
        }

        let max_slots = boards.iter().map(|b| b.free_slots).max().unwrap_or(0);
        if max_slots < ask.gpus {
            Err(("gpu slots", ask.gpus as u64, max_slots as u64))
        } else {
            let max_mem = boards
                .iter()
                .filter(|b| b.free_slots >= ask.gpus)
                .map(|b| b.free_mem)
                .max()
                .unwrap_or(0);
            Err(("gpu memory", ask.gpu_mem, max_mem))
        }
    }

    /// Infallible; a double release is logged and ignored.
    pub fn release(&self, alloc: Allocation) {
        let mut state = self.state.lock().unwrap();
        if !state.outstanding.remove(&alloc.id) {
            log::warn!("double release of allocation {} ignored", alloc.id);
            return;
        }

        state.free_cpus += alloc.cpus;
        state.free_ram += alloc.ram;
        state.free_disk += alloc.disk;
        if let Some(grant) = &alloc.gpu {
            if let Some(board) = state.boards.iter_mut().find(|b| b.board.id == grant.board) {
                board.free_slots += grant.slots;
                board.free_mem += grant.mem;
                debug_assert!(board.free_slots <= board.board.slots);
                debug_assert!(board.free_mem <= board.board.mem);
            }
        }
        debug_assert!(state.free_cpus <= self.capacity.cpus);
        debug_assert!(state.free_ram <= self.capacity.ram);
        debug_assert!(state.free_disk <= self.capacity.disk);
    }

    /// Snapshot of what is currently free.  The gpu fields report the single
    /// board with the most free slots, and the most free memory across
    /// boards, matching how asks are admitted.
    pub fn headroom(&self) -> ResourceAsk {
        let state = self.state.lock().unwrap();
        ResourceAsk {
            cpus: state.free_cpus,
            ram: state.free_ram,
            disk: state.free_disk,
            gpus: state.boards.iter().map(|b| b.free_slots).max().unwrap_or(0),
            gpu_mem: state.boards.iter().map(|b| b.free_mem).max().unwrap_or(0),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding.len()
    }
}

/// Loops printing out resource consumption statistics on a regular basis.
pub async fn log_usage_loop(
    ledger: std::sync::Arc<ResourceLedger>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let free = ledger.headroom();
                log::debug!(
                    "free resources: {} cores, {} ram, {} disk, {} gpu slots ({} gpu mem), {} allocations outstanding",
                    free.cpus,
                    human_size(free.ram),
                    human_size(free.disk),
                    free.gpus,
                    human_size(free.gpu_mem),
                    ledger.outstanding(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn test_capacity() -> Capacity {
        Capacity {
            cpus: 4,
            ram: 8 * GIB,
            disk: 100 * GIB,
            boards: vec![GpuBoard {
                id: 0,
                name: "test board".to_string(),
                slots: 2,
                mem: 16 * GIB,
            }],
        }
    }

    fn gpu_ask() -> ResourceAsk {
        ResourceAsk {
            cpus: 2,
            ram: 3 * GIB,
            disk: GIB,
            gpus: 1,
            gpu_mem: 8 * GIB,
        }
    }

    #[test]
    fn test_parallel_admission_and_recovery() {
        let ledger = ResourceLedger::new(test_capacity());

        let first = ledger.reserve(&gpu_ask()).unwrap();
        let second = ledger.reserve(&gpu_ask()).unwrap();

        let third = ledger.reserve(&ResourceAsk {
            cpus: 0,
            ram: 0,
            disk: 0,
            gpus: 1,
            gpu_mem: 0,
        });
        assert!(matches!(
            third,
            Err(RunnerError::InsufficientResources { dimension: "gpu slots", .. })
        ));

        ledger.release(first);
        ledger
            .reserve(&ResourceAsk {
                cpus: 0,
                ram: 0,
                disk: 0,
                gpus: 1,
                gpu_mem: 0,
            })
            .unwrap();
        drop(second);
    }

    #[test]
    fn test_conservation() {
        let ledger = ResourceLedger::new(test_capacity());
        let capacity = ledger.headroom();

        let a = ledger.reserve(&gpu_ask()).unwrap();
        let b = ledger
            .reserve(&ResourceAsk { cpus: 1, ram: GIB, disk: 2 * GIB, ..Default::default() })
            .unwrap();

        let free = ledger.headroom();
        assert_eq!(free.cpus, capacity.cpus - 3);
        assert_eq!(free.ram, capacity.ram - 4 * GIB);
        assert_eq!(free.disk, capacity.disk - 3 * GIB);
        assert_eq!(free.gpus, 1);
        assert_eq!(free.gpu_mem, 8 * GIB);

        ledger.release(a);
        ledger.release(b);
        assert_eq!(ledger.headroom(), capacity);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_double_release_ignored() {
        let ledger = ResourceLedger::new(test_capacity());
        let alloc = ledger.reserve(&gpu_ask()).unwrap();
        let forged = Allocation {
            id: alloc.id,
            cpus: alloc.cpus,
            ram: alloc.ram,
            disk: alloc.disk,
            gpu: alloc.gpu.clone(),
        };
        ledger.release(alloc);
        let free = ledger.headroom();
        ledger.release(forged);
        assert_eq!(ledger.headroom(), free);
    }

    #[test]
    fn test_best_fit_prefers_tightest_board() {
        let mut capacity = test_capacity();
        capacity.boards = vec![
            GpuBoard { id: 0, name: "large".into(), slots: 4, mem: 32 * GIB },
            GpuBoard { id: 1, name: "small".into(), slots: 1, mem: 8 * GIB },
        ];
        let ledger = ResourceLedger::new(capacity);

        let alloc = ledger
            .reserve(&ResourceAsk { gpus: 1, gpu_mem: 4 * GIB, ..Default::default() })
            .unwrap();
        assert_eq!(alloc.gpu.as_ref().unwrap().board, 1);

        // The large board keeps all four slots for a bigger ask
        let big = ledger
            .reserve(&ResourceAsk { gpus: 4, gpu_mem: 16 * GIB, ..Default::default() })
            .unwrap();
        assert_eq!(big.gpu.as_ref().unwrap().board, 0);
    }

    #[test]
    fn test_no_board_spanning() {
        let mut capacity = test_capacity();
        capacity.boards = vec![
            GpuBoard { id: 0, name: "a".into(), slots: 1, mem: 8 * GIB },
            GpuBoard { id: 1, name: "b".into(), slots: 1, mem: 8 * GIB },
        ];
        let ledger = ResourceLedger::new(capacity);

        // Two slots exist in total but never on a single board
        let res = ledger.reserve(&ResourceAsk { gpus: 2, ..Default::default() });
        assert!(matches!(
            res,
            Err(RunnerError::InsufficientResources { dimension: "gpu slots", .. })
        ));
    }

    #[test]
    fn test_tightest_dimension_reported() {
        let ledger = ResourceLedger::new(test_capacity());
        // ram is at 1/8 of the ask while cpus are at 4/8: ram binds tighter
        let res = ledger.reserve(&ResourceAsk {
            cpus: 8,
            ram: 64 * GIB,
            ..Default::default()
        });
        match res {
            Err(RunnerError::InsufficientResources { dimension, .. }) => {
                assert_eq!(dimension, "ram")
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_allocation_env_pins_board() {
        let ledger = ResourceLedger::new(test_capacity());
        let alloc = ledger.reserve(&gpu_ask()).unwrap();
        let env = alloc.env();
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("0"));
        assert_eq!(
            env.get("CUDA_DEVICE_ORDER").map(String::as_str),
            Some("PCI_BUS_ID")
        );
        ledger.release(alloc);
    }
}
