//! Driver-facing surface in the shape of the Linux interrupt API.
//!
//! Status codes follow the kernel convention: 0 on success, a negative errno
//! on failure.

use crate::{
    host::Bus,
    interrupt::IrqFlags,
    registry::IrqRegistry,
    tasklet::{Tasklet, TaskletScheduler},
};
use log::debug;
use nix::errno::Errno;
use std::sync::Arc;

pub const IRQF_SHARED: u64 = crate::interrupt::IRQF_SHARED.bits() as u64;

pub fn register_interrupt<B, T, F>(
    registry: &IrqRegistry<B>,
    irq: u32,
    handler: F,
    flags: u64,
    name: &str,
    dev_id: Arc<T>,
) -> i32
where
    B: Bus,
    T: Send + Sync + 'static,
    F: Fn(u32, &T) -> bool + Send + Sync + 'static,
{
    let flags = IrqFlags::from_bits_truncate(flags as u32);
    match registry.register(irq, handler, flags, name, dev_id) {
        Ok(_) => 0,
        Err(e) => {
            debug!("IRQ: request for irq {irq} ({name}) failed: {e}");
            e.errno()
        }
    }
}

pub fn bind_interrupt_to_cpu<B: Bus>(registry: &IrqRegistry<B>, irq: u32, cpu_id: i32) -> i32 {
    let Ok(cpu) = u32::try_from(cpu_id) else {
        return -(Errno::EINVAL as i32);
    };
    match registry.bind(irq, cpu) {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

/// Best effort: releasing an irq that is not registered does nothing.
pub fn release_interrupt<B: Bus, T>(registry: &IrqRegistry<B>, irq: u32, dev_id: &Arc<T>) {
    if let Err(e) = registry.release(irq, dev_id) {
        debug!("IRQ: nothing to release for irq {irq}: {e}");
    }
}

pub fn tasklet_init(
    scheduler: &TaskletScheduler,
    func: fn(usize),
    data: usize,
) -> Arc<Tasklet> {
    scheduler.tasklet(move || func(data))
}

pub fn tasklet_schedule(t: &Arc<Tasklet>) {
    t.schedule();
}

pub fn tasklet_kill(t: &Tasklet) {
    t.kill();
}

pub fn tasklet_disable(t: &Tasklet) {
    t.disable();
}

pub fn tasklet_enable(t: &Tasklet) {
    t.enable();
}
