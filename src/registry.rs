use crate::{
    device::{Device, DeviceId},
    error::{IrqError, Result},
    host::{Bus, ResourceKind},
    interrupt::{irq_dispatch, IrqAction, IrqEntry, IrqFlags},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Identifies a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqHandle {
    pub irq: u32,
    pub device: DeviceId,
}

/// Bridges driver interrupt requests onto a host [`Bus`].
///
/// Each device's entries are guarded by that device's own lock; register,
/// release and bind for one device are serialized against each other.
/// Dispatch never touches that lock: the host calls [`irq_dispatch`] with the
/// entry's [`IrqAction`] directly.
pub struct IrqRegistry<B: Bus> {
    bus: Arc<B>,
    // Every device that ever held an entry, so shutdown can drain them.
    devices: Mutex<BTreeMap<DeviceId, Arc<Device>>>,
    shut_down: AtomicBool,
}

impl<B: Bus> IrqRegistry<B> {
    pub fn new(bus: Arc<B>) -> IrqRegistry<B> {
        info!("IRQ: registry initialized");
        IrqRegistry {
            bus,
            devices: Mutex::new(BTreeMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    fn locate(&self, irq: u32) -> Result<Arc<Device>> {
        self.bus
            .locate_owning_device(irq)
            .ok_or(IrqError::NoSuchDevice(irq))
    }

    /// Registers `handler` for `irq`, calling it with `dev_id` on every
    /// interrupt until [`release`](Self::release).
    ///
    /// On failure nothing is left behind: no entry and no host resource.
    pub fn register<T, F>(
        &self,
        irq: u32,
        handler: F,
        flags: IrqFlags,
        name: &str,
        dev_id: Arc<T>,
    ) -> Result<IrqHandle>
    where
        T: Send + Sync + 'static,
        F: Fn(u32, &T) -> bool + Send + Sync + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(IrqError::Shutdown);
        }
        let dev = self.locate(irq)?;
        let rid = dev.irq_rid(irq).ok_or(IrqError::NoSuchDevice(irq))?;
        self.devices
            .lock()
            .entry(dev.id())
            .or_insert_with(|| dev.clone());

        let mut irqents = dev.irqents.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(IrqError::Shutdown);
        }
        if irqents.contains_key(&irq) {
            return Err(IrqError::Busy(irq));
        }

        let resource = self
            .bus
            .allocate_resource(&dev, ResourceKind::Irq, rid, flags | IrqFlags::ACTIVE)
            .ok_or(IrqError::ResourceUnavailable(irq))?;

        let action = Arc::new(IrqAction::new(irq, flags, name, dev.id(), handler, dev_id));
        let tag = match self
            .bus
            .install_interrupt(&dev, &resource, irq_dispatch, action.clone())
        {
            Ok(tag) => tag,
            Err(cause) => {
                warn!(
                    "IRQ: installing irq {irq} ({name}) on {} failed: {cause}, rolling back",
                    dev.name()
                );
                self.bus
                    .release_resource(&dev, ResourceKind::Irq, rid, resource);
                return Err(IrqError::SetupFailed { irq, cause });
            }
        };

        irqents.insert(
            irq,
            IrqEntry {
                rid,
                resource,
                tag,
                action,
            },
        );
        debug!(
            "IRQ: registered irq {irq} ({name}) on {} as rid {rid}",
            dev.name()
        );
        Ok(IrqHandle {
            irq,
            device: dev.id(),
        })
    }

    /// Routes `irq` to `cpu`. Host refusals come back as [`IrqError::Host`].
    ///
    /// An irq no device owns has no entry either, so both report `NotFound`.
    pub fn bind(&self, irq: u32, cpu: u32) -> Result<()> {
        let dev = self
            .bus
            .locate_owning_device(irq)
            .ok_or(IrqError::NotFound(irq))?;
        let irqents = dev.irqents.lock();
        let entry = irqents.get(&irq).ok_or(IrqError::NotFound(irq))?;
        self.bus
            .bind_affinity(&dev, &entry.resource, cpu)
            .map_err(|cause| IrqError::Host { irq, cause })?;
        debug!("IRQ: irq {irq} bound to cpu {cpu}");
        Ok(())
    }

    /// Tears down the registration of `irq`.
    ///
    /// Returns `NoSuchDevice` or `NotFound` when there is nothing to release;
    /// the driver-facing wrapper swallows both. A `dev_id` other than the one
    /// used at registration is logged and the entry is released anyway.
    pub fn release<T>(&self, irq: u32, dev_id: &Arc<T>) -> Result<()> {
        let dev = self.locate(irq)?;
        let mut irqents = dev.irqents.lock();
        let entry = irqents.remove(&irq).ok_or(IrqError::NotFound(irq))?;
        if !entry.action.has_dev_id(dev_id) {
            warn!("IRQ: irq {irq} released with a foreign dev_id");
        }
        self.teardown(&dev, entry);
        debug!("IRQ: released irq {irq} on {}", dev.name());
        Ok(())
    }

    fn teardown(&self, dev: &Device, entry: IrqEntry) {
        let IrqEntry {
            rid, resource, tag, ..
        } = entry;
        self.bus.teardown_interrupt(dev, &resource, tag);
        self.bus
            .release_resource(dev, ResourceKind::Irq, rid, resource);
    }

    pub fn is_registered(&self, irq: u32) -> bool {
        match self.bus.locate_owning_device(irq) {
            Some(dev) => dev.irqents.lock().contains_key(&irq),
            None => false,
        }
    }

    /// All registered irq numbers, ascending.
    pub fn registered_irqs(&self) -> Vec<u32> {
        let devices: Vec<Arc<Device>> = self.devices.lock().values().cloned().collect();
        let mut irqs: Vec<u32> = devices.iter().flat_map(|dev| dev.active_irqs()).collect();
        irqs.sort_unstable();
        irqs
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Rejects further registrations and releases every remaining entry.
    /// Returns how many entries were drained.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let devices: Vec<Arc<Device>> = self.devices.lock().values().cloned().collect();
        let mut drained = 0;
        for dev in devices {
            let mut irqents = dev.irqents.lock();
            for (irq, entry) in mem::take(&mut *irqents) {
                warn!("IRQ: irq {irq} still registered on {} at shutdown", dev.name());
                self.teardown(&dev, entry);
                drained += 1;
            }
        }
        info!("IRQ: registry shut down, {drained} entries drained");
        drained
    }
}

impl<B: Bus> Drop for IrqRegistry<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::IrqRegistry;
    use crate::{
        device::Device,
        error::IrqError,
        host::sim::SimBus,
        interrupt::{IrqFlags, IrqReturn},
    };
    use nix::errno::Errno;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    fn setup() -> (Arc<SimBus>, IrqRegistry<SimBus>) {
        let bus = Arc::new(SimBus::new(4));
        bus.add_device(Device::new(0, "nic0", 5, 16, 4));
        let registry = IrqRegistry::new(bus.clone());
        (bus, registry)
    }

    fn count(_irq: u32, hits: &AtomicUsize) -> bool {
        hits.fetch_add(1, Ordering::SeqCst);
        true
    }

    #[test]
    fn test_register_and_dispatch() {
        let (bus, registry) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = registry
            .register(17, count, IrqFlags::empty(), "rx0", hits.clone())
            .unwrap();
        assert_eq!(17, handle.irq);
        assert_eq!(0, handle.device);
        assert!(registry.is_registered(17));
        assert_eq!(Some(IrqReturn::Handled), bus.deliver(17));
        assert_eq!(Some(IrqReturn::Handled), bus.deliver(17));
        assert_eq!(2, hits.load(Ordering::SeqCst));
        assert_eq!(None, bus.deliver(18));
    }

    #[test]
    fn test_register_release_round_trip() {
        let (bus, registry) = setup();
        let ctx = Arc::new(AtomicUsize::new(0));
        let baseline = bus.outstanding();
        for _ in 0..16 {
            registry
                .register(5, count, IrqFlags::empty(), "t", ctx.clone())
                .unwrap();
            assert_eq!(baseline + 1, bus.outstanding());
            registry.release(5, &ctx).unwrap();
        }
        assert_eq!(baseline, bus.outstanding());
        assert_eq!(0, bus.installed());
        assert!(!registry.is_registered(5));
    }

    #[test]
    fn test_install_failure_rolls_back() {
        let (bus, registry) = setup();
        bus.set_fail_install(Some(Errno::EINVAL));
        let err = registry
            .register(16, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap_err();
        assert_eq!(
            IrqError::SetupFailed {
                irq: 16,
                cause: Errno::EINVAL
            },
            err
        );
        assert_eq!(1, bus.alloc_calls());
        assert_eq!(0, bus.outstanding());
        assert!(!registry.is_registered(16));

        bus.set_fail_install(None);
        registry
            .register(16, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap();
    }

    #[test]
    fn test_allocation_failure() {
        let (bus, registry) = setup();
        bus.set_fail_alloc(true);
        let err = registry
            .register(16, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap_err();
        assert_eq!(IrqError::ResourceUnavailable(16), err);
        assert_eq!(0, bus.installed());
        assert!(registry.registered_irqs().is_empty());
    }

    #[test]
    fn test_unknown_device_does_not_allocate() {
        let (bus, registry) = setup();
        let err = registry
            .register(99, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap_err();
        assert_eq!(IrqError::NoSuchDevice(99), err);
        assert_eq!(0, bus.alloc_calls());
    }

    #[test]
    fn test_duplicate_registration() {
        let (bus, registry) = setup();
        let ctx = Arc::new(AtomicUsize::new(0));
        registry
            .register(5, count, IrqFlags::empty(), "t", ctx.clone())
            .unwrap();
        let err = registry
            .register(5, count, IrqFlags::empty(), "t", ctx.clone())
            .unwrap_err();
        assert_eq!(IrqError::Busy(5), err);
        assert_eq!(1, bus.outstanding());
        assert_eq!(1, bus.alloc_calls());
    }

    #[test]
    fn test_bind() {
        let (bus, registry) = setup();
        registry
            .register(18, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap();
        registry.bind(18, 2).unwrap();
        assert_eq!(Some(2), bus.affinity(0, 3));

        let err = registry.bind(18, 9).unwrap_err();
        assert_eq!(
            IrqError::Host {
                irq: 18,
                cause: Errno::EINVAL
            },
            err
        );
        assert_eq!(-(Errno::EINVAL as i32), err.errno());
    }

    #[test]
    fn test_bind_unregistered() {
        let (_bus, registry) = setup();
        assert_eq!(Err(IrqError::NotFound(17)), registry.bind(17, 0));
        assert_eq!(Err(IrqError::NotFound(40)), registry.bind(40, 0));
    }

    #[test]
    fn test_release_missing_reports_not_found() {
        let (bus, registry) = setup();
        let ctx = Arc::new(());
        assert_eq!(Err(IrqError::NotFound(5)), registry.release(5, &ctx));
        assert_eq!(Err(IrqError::NoSuchDevice(77)), registry.release(77, &ctx));
        assert_eq!(0, bus.alloc_calls());
    }

    #[test]
    fn test_release_with_foreign_dev_id() {
        let (bus, registry) = setup();
        registry
            .register(5, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap();
        registry.release(5, &Arc::new(())).unwrap();
        assert_eq!(0, bus.outstanding());
    }

    #[test]
    fn test_release_waits_for_inflight_dispatch() {
        let (bus, registry) = setup();
        let registry = Arc::new(registry);
        let entered = Arc::new(AtomicBool::new(false));
        let proceed = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new((entered.clone(), proceed.clone()));
        registry
            .register(
                17,
                |_, (entered, proceed): &(Arc<AtomicBool>, Arc<AtomicBool>)| {
                    entered.store(true, Ordering::SeqCst);
                    while !proceed.load(Ordering::SeqCst) {
                        std::hint::spin_loop();
                    }
                    true
                },
                IrqFlags::empty(),
                "slow",
                ctx.clone(),
            )
            .unwrap();

        let irq_bus = bus.clone();
        let dispatcher = thread::spawn(move || irq_bus.deliver(17));
        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let released = Arc::new(AtomicBool::new(false));
        let releaser = {
            let registry = registry.clone();
            let released = released.clone();
            let ctx = ctx.clone();
            thread::spawn(move || {
                registry.release(17, &ctx).unwrap();
                released.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));
        proceed.store(true, Ordering::SeqCst);

        assert_eq!(Some(IrqReturn::Handled), dispatcher.join().unwrap());
        releaser.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(0, bus.outstanding());
        assert_eq!(None, bus.deliver(17));
    }

    #[test]
    fn test_concurrent_registration_single_winner() {
        let (bus, registry) = setup();
        let registry = Arc::new(registry);
        let wins = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let wins = wins.clone();
                thread::spawn(move || {
                    let ctx = Arc::new(AtomicUsize::new(0));
                    if registry
                        .register(19, count, IrqFlags::empty(), "t", ctx)
                        .is_ok()
                    {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(1, wins.load(Ordering::SeqCst));
        assert_eq!(1, bus.outstanding());
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let (bus, registry) = setup();
        for irq in [5, 16, 17] {
            registry
                .register(irq, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
                .unwrap();
        }
        assert_eq!(vec![5, 16, 17], registry.registered_irqs());
        assert_eq!(3, registry.shutdown());
        assert!(registry.is_shut_down());
        assert_eq!(0, bus.outstanding());
        assert_eq!(0, bus.installed());

        let calls = bus.alloc_calls();
        let err = registry
            .register(5, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap_err();
        assert_eq!(IrqError::Shutdown, err);
        assert_eq!(calls, bus.alloc_calls());
        assert_eq!(0, registry.shutdown());
    }

    #[test]
    fn test_drop_releases_entries() {
        let (bus, registry) = setup();
        registry
            .register(16, count, IrqFlags::empty(), "t", Arc::new(AtomicUsize::new(0)))
            .unwrap();
        drop(registry);
        assert_eq!(0, bus.outstanding());
    }
}
