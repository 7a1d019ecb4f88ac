use super::*;
use hal_core::{console::ReadLine, cpu::Idle, VAddr};
use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc, Mutex as StdMutex,
    },
};

const CPU0: CpuId = CpuId::new(0);
const CPU1: CpuId = CpuId::new(1);

/// Panic payload standing in for "the core jumped into an environment".
#[derive(Debug, PartialEq)]
struct Dispatched(EnvId);

/// Panic payload standing in for "the core parked itself".
#[derive(Debug, PartialEq)]
struct Idled(VAddr);

/// Panic payload used to get out of the kernel monitor.
#[derive(Debug, PartialEq)]
struct ConsoleClosed;

#[derive(Default)]
struct MockArch {
    kernel_loads: AtomicUsize,
    input: StdMutex<VecDeque<&'static str>>,
}

impl MockArch {
    fn with_input(lines: &[&'static str]) -> Self {
        Self {
            input: StdMutex::new(lines.iter().copied().collect()),
            ..Self::default()
        }
    }

    fn kernel_loads(&self) -> usize {
        self.kernel_loads.load(SeqCst)
    }
}

impl AddressSpace for MockArch {
    fn load_kernel_address_space(&self) {
        self.kernel_loads.fetch_add(1, SeqCst);
    }
}

impl Idle for MockArch {
    unsafe fn idle(&self, stack_top: VAddr) -> ! {
        panic::panic_any(Idled(stack_top))
    }
}

impl Dispatch<EnvId> for MockArch {
    fn dispatch(&self, env: EnvId) -> ! {
        panic::panic_any(Dispatched(env))
    }
}

impl ReadLine for MockArch {
    fn read_line<'buf>(&self, buf: &'buf mut [u8]) -> &'buf str {
        let line = self.input.lock().unwrap().pop_front();
        let Some(line) = line else {
            panic::panic_any(ConsoleClosed)
        };
        let len = line.len().min(buf.len());
        buf[..len].copy_from_slice(&line.as_bytes()[..len]);
        core::str::from_utf8(&buf[..len]).unwrap()
    }
}

impl Architecture for MockArch {
    const NAME: &'static str = "mock";
}

/// A spinlock that counts how many times it has been released.
struct TrackingLock {
    inner: Spinlock,
    releases: Arc<AtomicUsize>,
}

unsafe impl RawMutex for TrackingLock {
    type GuardMarker = ();

    fn lock(&self) {
        self.inner.lock()
    }

    fn try_lock(&self) -> bool {
        self.inner.try_lock()
    }

    unsafe fn unlock(&self) {
        self.releases.fetch_add(1, SeqCst);
        self.inner.unlock()
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

fn config(envs: usize) -> Config {
    Config::new().with_envs(envs).with_cpus(2)
}

fn tracking_kernel(envs: usize) -> (Kernel<TrackingLock>, Arc<AtomicUsize>) {
    let releases = Arc::new(AtomicUsize::new(0));
    let lock = TrackingLock {
        inner: Spinlock::new(),
        releases: releases.clone(),
    };
    let kernel = Kernel::with_lock(&config(envs), lock).unwrap();
    (kernel, releases)
}

#[track_caller]
fn expect_run<L: RawMutex>(transfer: Transfer<'_, L>) -> EnvId {
    match transfer {
        Transfer::Run { env, .. } => env,
        transfer => panic!("expected to dispatch an environment, got {transfer:?}"),
    }
}

#[track_caller]
fn expect_panic<P: core::any::Any + core::fmt::Debug>(f: impl FnOnce()) -> P {
    let payload = panic::catch_unwind(AssertUnwindSafe(f)).expect_err("function returned");
    match payload.downcast::<P>() {
        Ok(payload) => *payload,
        Err(_) => panic!("unexpected panic payload"),
    }
}

#[test]
fn rejects_invalid_config() {
    let err = Kernel::new(&Config::new().with_cpus(0)).unwrap_err();
    assert_eq!(err, ConfigError::NoCpus);
}

#[test]
fn cpus_start_unused() {
    let kernel = Kernel::new(&config(1)).unwrap();
    for (i, cpu) in kernel.cpus().iter().enumerate() {
        assert_eq!(cpu.id(), CpuId::new(i));
        assert_eq!(cpu.status(), CpuStatus::Unused);
        assert_eq!(cpu.stack_top(), config(1).stack_top(cpu.id()));
    }
}

#[test]
#[should_panic]
fn start_cpu_twice() {
    let kernel = Kernel::new(&config(1)).unwrap();
    drop(kernel.start_cpu(CPU0));
    drop(kernel.start_cpu(CPU0));
}

#[test]
fn dispatch_bookkeeping() {
    let _trace = crate::test_util::trace_init();
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(2)).unwrap();
    let (a, b) = {
        let mut state = kernel.lock();
        let a = state.envs_mut().alloc().unwrap();
        let b = state.envs_mut().alloc().unwrap();
        (a, b)
    };

    let guard = kernel.start_cpu(CPU0);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU0, &arch)), a);
    {
        let state = kernel.lock();
        assert_eq!(state.current(CPU0), Some(a));
        let env = state.envs().get(a).unwrap();
        assert_eq!(env.status(), Status::Running);
        assert_eq!(env.cpu(), Some(CPU0));
        assert_eq!(env.runs(), 1);
        assert_consistent(&state, 2);
    }

    // a is preempted by the timer; b gets a turn.
    let guard = kernel.trap_entry(CPU0);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU0, &arch)), b);
    {
        let state = kernel.lock();
        assert_eq!(state.current(CPU0), Some(b));
        assert_eq!(state.envs().get(a).unwrap().status(), Status::Runnable);
        assert_eq!(state.envs().get(b).unwrap().status(), Status::Running);
        assert_consistent(&state, 2);
    }

    let guard = kernel.trap_entry(CPU0);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU0, &arch)), a);
    assert_eq!(kernel.lock().envs().get(a).unwrap().runs(), 2);

    // dispatching never switches address spaces back to the kernel's.
    assert_eq!(arch.kernel_loads(), 0);
}

#[test]
fn continues_own_environment() {
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(1)).unwrap();
    let a = kernel.lock().envs_mut().alloc().unwrap();

    let guard = kernel.start_cpu(CPU0);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU0, &arch)), a);
    for runs in 2..5 {
        let guard = kernel.trap_entry(CPU0);
        assert_eq!(expect_run(kernel.prepare_yield(guard, CPU0, &arch)), a);
        assert_eq!(kernel.lock().envs().get(a).unwrap().runs(), runs);
    }
}

#[test]
fn round_robin_through_kernel() {
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(4)).unwrap();
    let ids = {
        let mut state = kernel.lock();
        (0..4)
            .map(|_| state.envs_mut().alloc().unwrap())
            .collect::<Vec<_>>()
    };

    let mut guard = kernel.start_cpu(CPU0);
    let mut order = Vec::new();
    for _ in 0..8 {
        order.push(expect_run(kernel.prepare_yield(guard, CPU0, &arch)));
        guard = kernel.trap_entry(CPU0);
    }
    drop(guard);

    let expected = ids.iter().chain(ids.iter()).copied().collect::<Vec<_>>();
    assert_eq!(order, expected);
}

/// Sets up a machine where core 1 is running `b`, and core 0 was running
/// `a`, which has just blocked. Core 0 is left in the kernel.
fn blocked_on_cpu0<L: RawMutex>(kernel: &Kernel<L>, arch: &MockArch) -> (EnvId, EnvId) {
    let (a, b) = {
        let mut state = kernel.lock();
        let a = state.envs_mut().alloc().unwrap();
        let b = state.envs_mut().alloc().unwrap();
        (a, b)
    };
    let guard = kernel.start_cpu(CPU0);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU0, arch)), a);
    let guard = kernel.start_cpu(CPU1);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU1, arch)), b);

    // a makes a blocking system call.
    let mut guard = kernel.trap_entry(CPU0);
    assert_eq!(guard.set_current_status(CPU0, Status::NotRunnable), Ok(a));
    drop(guard);
    (a, b)
}

#[test]
fn halt_releases_lock_last() {
    let _trace = crate::test_util::trace_init();
    let arch = MockArch::default();
    let (kernel, releases) = tracking_kernel(2);
    let (a, b) = blocked_on_cpu0(&kernel, &arch);

    let guard = kernel.trap_entry(CPU0);
    let released = releases.load(SeqCst);
    let halted = match kernel.prepare_yield(guard, CPU0, &arch) {
        Transfer::Halt(halted) => halted,
        transfer => panic!("expected core 0 to halt, got {transfer:?}"),
    };

    assert_eq!(releases.load(SeqCst), released + 1, "lock released once");
    assert_eq!(halted.cpu(), CPU0);
    assert_eq!(halted.stack_top(), kernel.cpu(CPU0).stack_top());
    assert_eq!(kernel.cpu(CPU0).status(), CpuStatus::Halted);
    assert_eq!(arch.kernel_loads(), 1);

    let state = kernel.try_lock().expect("kernel lock must be released");
    assert_eq!(state.current(CPU0), None);
    assert_eq!(state.current(CPU1), Some(b));
    assert_eq!(state.envs().get(a).unwrap().status(), Status::NotRunnable);
    assert_consistent(&state, 2);
}

#[test]
fn timer_wakes_halted_core() {
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(2)).unwrap();
    let (a, _) = blocked_on_cpu0(&kernel, &arch);

    let guard = kernel.trap_entry(CPU0);
    assert!(matches!(
        kernel.prepare_yield(guard, CPU0, &arch),
        Transfer::Halt(_)
    ));

    // a is woken up by an IPC from core 1, then the timer fires on core 0.
    kernel
        .lock()
        .envs_mut()
        .set_status(a, Status::Runnable)
        .unwrap();
    let guard = kernel.trap_entry(CPU0);
    assert_eq!(kernel.cpu(CPU0).status(), CpuStatus::Active);

    // the scan restarts from slot 0, since core 0 gave up its environment.
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU0, &arch)), a);
}

#[test]
fn diagnostic_keeps_lock() {
    let arch = MockArch::default();
    let (kernel, releases) = tracking_kernel(2);
    let a = kernel.lock().envs_mut().alloc().unwrap();
    kernel
        .lock()
        .envs_mut()
        .set_status(a, Status::NotRunnable)
        .unwrap();

    let guard = kernel.start_cpu(CPU0);
    let released = releases.load(SeqCst);
    let transfer = kernel.prepare_yield(guard, CPU0, &arch);
    assert!(matches!(transfer, Transfer::Diagnostic(_)), "{transfer:?}");
    assert!(kernel.try_lock().is_none(), "monitor must hold the lock");
    assert_eq!(releases.load(SeqCst), released);
    assert_eq!(kernel.cpu(CPU0).status(), CpuStatus::Active);
    assert_eq!(arch.kernel_loads(), 0);

    drop(transfer);
    assert!(kernel.try_lock().is_some());
}

#[test]
fn perform_dispatches() {
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(1)).unwrap();
    let a = kernel.lock().envs_mut().alloc().unwrap();

    let Dispatched(env) = expect_panic(|| {
        let guard = kernel.start_cpu(CPU0);
        kernel.yield_cpu(guard, CPU0, &arch)
    });
    assert_eq!(env, a);
    assert!(kernel.try_lock().is_some());
}

#[test]
fn perform_idles_on_own_stack() {
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(2)).unwrap();
    blocked_on_cpu0(&kernel, &arch);

    let Idled(stack_top) = expect_panic(|| {
        let guard = kernel.trap_entry(CPU0);
        kernel.yield_cpu(guard, CPU0, &arch)
    });
    assert_eq!(stack_top, config(2).stack_top(CPU0));
}

#[test]
fn perform_enters_monitor() {
    let _trace = crate::test_util::trace_init();
    let arch = MockArch::with_input(&["help", "kerninfo", "envs all", "cpus", "bogus"]);
    let kernel = Kernel::new(&config(2)).unwrap();

    let ConsoleClosed = expect_panic(|| {
        let guard = kernel.start_cpu(CPU0);
        kernel.yield_cpu(guard, CPU0, &arch)
    });
    assert!(arch.input.lock().unwrap().is_empty(), "all input consumed");
    // the monitor's guard was dropped while unwinding.
    assert!(kernel.try_lock().is_some());
}

#[test]
fn other_cores_cannot_take_a_running_env() {
    let _trace = crate::test_util::trace_init();
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(2)).unwrap();
    let a = kernel.lock().envs_mut().alloc().unwrap();

    let guard = kernel.start_cpu(CPU1);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU1, &arch)), a);

    // core 0 tries to make core 1's environment runnable, or block it.
    let mut guard = kernel.start_cpu(CPU0);
    for status in [Status::Runnable, Status::NotRunnable] {
        assert_eq!(
            guard.envs_mut().set_status(a, status),
            Err(EnvError::Running { id: a, cpu: CPU1 })
        );
    }
    assert_eq!(
        guard.envs_mut().free(a),
        Err(EnvError::Running { id: a, cpu: CPU1 })
    );
    assert_eq!(
        guard.set_current_status(CPU0, Status::NotRunnable),
        Err(EnvError::NoCurrent(CPU0))
    );

    // so core 0 has nothing to run, and a stays with core 1.
    assert!(matches!(
        kernel.prepare_yield(guard, CPU0, &arch),
        Transfer::Halt(_)
    ));
    let state = kernel.lock();
    assert_eq!(state.current(CPU1), Some(a));
    assert_eq!(state.envs().get(a).unwrap().status(), Status::Running);
    assert_consistent(&state, 2);
}

#[test]
fn running_env_blocks_and_is_woken() {
    let arch = MockArch::default();
    let kernel = Kernel::new(&config(2)).unwrap();
    let (a, b) = blocked_on_cpu0(&kernel, &arch);

    let guard = kernel.trap_entry(CPU0);
    assert!(matches!(
        kernel.prepare_yield(guard, CPU0, &arch),
        Transfer::Halt(_)
    ));

    // b wakes a up over IPC...
    kernel
        .lock()
        .envs_mut()
        .set_status(a, Status::Runnable)
        .unwrap();

    // ...and the next core through the scheduler picks it up.
    let guard = kernel.trap_entry(CPU1);
    assert_eq!(expect_run(kernel.prepare_yield(guard, CPU1, &arch)), a);
    let state = kernel.lock();
    assert_eq!(state.envs().get(b).unwrap().status(), Status::Runnable);
    assert_consistent(&state, 2);
}
