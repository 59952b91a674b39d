//! Proxy `vcpu_run` (spec §4.I "Proxy `vcpu_run`").
//!
//! While enabled on a VCPU, the VCPU stays blocked with `VCPU_RUN` between
//! external `vcpu_run` calls instead of being scheduled normally; a
//! privileged owner supplies it execution ticks on demand via a directed
//! `yield_to`, the same donation-style switch `sched::scheduler` already
//! provides for priority-inversion avoidance. Power voting is skipped for a
//! run-enabled VCPU (spec: "power voting is disabled while `vcpu_run` is
//! enabled") since the proxy owner, not the normal power-vote path, decides
//! when the VCPU's CPU needs to stay online.

use crate::error::{HypError, HypResult};
use crate::ipc::doorbell::Doorbell;
use crate::primitives::cpulocal::CpuIndex;
use crate::sched::thread::{BlockReason, ThreadId};
use crate::sched::Scheduler;
use crate::vgic::vic::Vic;

/// Reported back to the proxy-scheduling owner on return from a `vcpu_run`
/// call (spec: "READY, BLOCKED, POWERED_OFF, ADDRSPACE_VMMIO_READ/WRITE").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The VCPU ran and re-blocked with `VCPU_RUN` on its own (timeslice
    /// exhausted, or it otherwise yielded); call `vcpu_run` again to
    /// continue it.
    Ready,
    /// The VCPU blocked on something other than `VCPU_RUN` while running
    /// (e.g. `VCPU_WFI`, `VCPU_SUSPEND`); `data0` is unused.
    Blocked,
    /// The VCPU powered itself off while running.
    PoweredOff,
    /// The VCPU trapped a stage-2 translation/permission fault against an
    /// emulated MMIO range and is blocked with `ADDRSPACE_VMMIO_ACCESS`;
    /// `data0` is the faulting IPA, `data1` the access size.
    AddrspaceVmmioRead { ipa: u64, size: u64 },
    AddrspaceVmmioWrite { ipa: u64, size: u64 },
}

/// Per-VCPU proxy-run bookkeeping, alongside the generic fields already on
/// [`crate::sched::thread::Thread`] (`run_enabled`, `run_doorbell`).
pub struct VcpuRun {
    thread_id: ThreadId,
}

impl VcpuRun {
    pub const fn new(thread_id: ThreadId) -> Self {
        Self { thread_id }
    }

    /// Enable proxy scheduling for this VCPU and bind the doorbell it rings
    /// to tell its owner a reschedule is warranted. Blocks the VCPU with
    /// `VCPU_RUN` immediately: it will not run again until the first
    /// `vcpu_run` call.
    pub fn enable(&self, scheduler: &Scheduler, doorbell_index: u32) -> HypResult<()> {
        let thread = scheduler.thread(self.thread_id).ok_or(HypError::ArgumentInvalid)?;
        thread.set_run_enabled(true);
        thread.bind_run_doorbell(doorbell_index);
        thread.block(BlockReason::VCPU_RUN);
        Ok(())
    }

    /// One round of proxy scheduling: unblock `VCPU_RUN`, force affinity to
    /// the caller's own CPU (the owner runs the VCPU on whatever CPU it is
    /// itself running on), directed-switch into it, and on return re-block
    /// with `VCPU_RUN` and report what happened.
    ///
    /// `resume_value` is written into the opaque per-thread slot the VMMIO
    /// emulation path reads back (spec scenario 5: "V unblocks, its GPR is
    /// populated with `value`"); arch-specific GPR placement happens in the
    /// (out of scope) trap-return path that consults it, so this function
    /// only records the value.
    pub fn run(
        &self,
        scheduler: &Scheduler,
        vic: &Vic,
        doorbells: &[Doorbell],
        caller_cpu: CpuIndex,
        cur_ticks: u64,
        resume_value: Option<u64>,
    ) -> HypResult<RunState> {
        let thread = scheduler.thread(self.thread_id).ok_or(HypError::ArgumentInvalid)?;
        if !thread.run_enabled() {
            return Err(HypError::ObjectConfig);
        }
        if let Some(value) = resume_value {
            thread.set_resume_value(value);
        }
        thread.set_affinity(Some(caller_cpu))?;
        scheduler.unblock(caller_cpu, self.thread_id, BlockReason::VCPU_RUN);
        scheduler.yield_to(caller_cpu, self.thread_id, cur_ticks);

        thread.block(BlockReason::VCPU_RUN);

        let state = if thread.block_bits().contains(BlockReason::VCPU_OFF) {
            RunState::PoweredOff
        } else if let Some(is_write) = thread.take_vmmio_pending() {
            let (ipa, size) = thread.vmmio_fault_info();
            if is_write {
                RunState::AddrspaceVmmioWrite { ipa, size }
            } else {
                RunState::AddrspaceVmmioRead { ipa, size }
            }
        } else if thread
            .block_bits()
            .intersects(BlockReason::VCPU_WFI | BlockReason::VCPU_SUSPEND | BlockReason::WAIT_QUEUE)
        {
            RunState::Blocked
        } else {
            RunState::Ready
        };

        if let Some(doorbell_index) = thread.run_doorbell() {
            if let Some(db) = doorbells.get(doorbell_index as usize) {
                let _ = db.send(1, vic);
            }
        }

        Ok(state)
    }

    /// Disable proxy scheduling: the VCPU reverts to ordinary scheduling
    /// (and, implicitly, ordinary power voting) the next time it is
    /// unblocked from `VCPU_RUN`.
    pub fn disable(&self, scheduler: &Scheduler) -> HypResult<()> {
        let thread = scheduler.thread(self.thread_id).ok_or(HypError::ArgumentInvalid)?;
        thread.set_run_enabled(false);
        Ok(())
    }
}

/// Static slab of [`VcpuRun`] state, one per VCPU thread slot, mirroring
/// the rest of the crate's index-not-`Arc` object style (see `DESIGN.md`).
pub struct VcpuRunSlab;

impl VcpuRunSlab {
    pub const fn new() -> Self {
        Self
    }

    pub fn for_thread(&self, thread_id: ThreadId) -> VcpuRun {
        VcpuRun::new(thread_id)
    }
}

impl Default for VcpuRunSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::doorbell::Doorbell;
    use crate::object::header::PartitionId as Pid;
    use crate::vgic::vic::{Vic, Virq};

    fn setup() -> (Scheduler, Vic, [Doorbell; 1], CpuIndex) {
        let sched = Scheduler::new();
        let cpu = CpuIndex::new(0).unwrap();
        let vic = Vic::new_uninit();
        vic.configure(Pid(0), 1).unwrap();
        vic.configure_virq(Virq::Spi(0), true, 0, 0).unwrap();
        vic.enable_virq(Virq::Spi(0), true).unwrap();
        vic.set_spi_route(0, 0).unwrap();
        let db = Doorbell::new_uninit();
        db.configure(0b1, 0).unwrap();
        db.bind_virq(Virq::Spi(0));
        (sched, vic, [db], cpu)
    }

    #[test]
    fn enable_blocks_the_vcpu_with_vcpu_run() {
        let (sched, _vic, _db, _cpu) = setup();
        let run = VcpuRun::new(1);
        run.enable(&sched, 0).unwrap();
        assert!(sched.thread(1).unwrap().block_bits().contains(BlockReason::VCPU_RUN));
        assert!(sched.thread(1).unwrap().run_enabled());
    }

    #[test]
    fn run_without_enable_is_rejected() {
        let (sched, vic, db, cpu) = setup();
        let run = VcpuRun::new(2);
        assert_eq!(
            run.run(&sched, &vic, &db, cpu, 0, None),
            Err(HypError::ObjectConfig)
        );
    }

    #[test]
    fn run_reports_ready_when_the_vcpu_reblocks_with_vcpu_run_only() {
        let (sched, vic, db, cpu) = setup();
        let run = VcpuRun::new(3);
        run.enable(&sched, 0).unwrap();
        let state = run.run(&sched, &vic, &db, cpu, 0, None).unwrap();
        assert_eq!(state, RunState::Ready);
        assert!(sched.thread(3).unwrap().block_bits().contains(BlockReason::VCPU_RUN));
    }

    #[test]
    fn run_reports_vmmio_read_and_clears_the_pending_marker() {
        let (sched, vic, db, cpu) = setup();
        let run = VcpuRun::new(4);
        run.enable(&sched, 0).unwrap();
        let thread = sched.thread(4).unwrap();
        thread.set_vmmio_pending(false);
        thread.set_vmmio_fault_info(0x4000_1000, 4);
        let state = run.run(&sched, &vic, &db, cpu, 0, None).unwrap();
        assert_eq!(state, RunState::AddrspaceVmmioRead { ipa: 0x4000_1000, size: 4 });
    }

    #[test]
    fn run_reports_vmmio_write() {
        let (sched, vic, db, cpu) = setup();
        let run = VcpuRun::new(5);
        run.enable(&sched, 0).unwrap();
        let thread = sched.thread(5).unwrap();
        thread.set_vmmio_pending(true);
        thread.set_vmmio_fault_info(0x4000_2000, 8);
        let state = run.run(&sched, &vic, &db, cpu, 0, None).unwrap();
        assert_eq!(state, RunState::AddrspaceVmmioWrite { ipa: 0x4000_2000, size: 8 });
    }

    #[test]
    fn run_reports_powered_off() {
        let (sched, vic, db, cpu) = setup();
        let run = VcpuRun::new(6);
        run.enable(&sched, 0).unwrap();
        // Simulate the VCPU powering itself off mid-run: by the time
        // `run()` re-blocks it with VCPU_RUN, VCPU_OFF is also set (as
        // `vcpu::lifecycle::poweroff` would leave it).
        sched.thread(6).unwrap().block(BlockReason::VCPU_OFF);
        let state = run.run(&sched, &vic, &db, cpu, 0, None).unwrap();
        assert_eq!(state, RunState::PoweredOff);
    }

    #[test]
    fn disable_clears_run_enabled() {
        let (sched, _vic, _db, _cpu) = setup();
        let run = VcpuRun::new(7);
        run.enable(&sched, 0).unwrap();
        run.disable(&sched).unwrap();
        assert!(!sched.thread(7).unwrap().run_enabled());
    }
}
