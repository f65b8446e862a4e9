//! In-process host bus.
//!
//! Stands in for the host kernel's bus layer: it hands out irq resources,
//! keeps installed trampolines and replays interrupts through them. Counters
//! and fault injection make leaks and rollbacks observable.

use super::{Bus, DispatchFn, InstallTag, Resource, ResourceKind};
use crate::{
    device::{Device, DeviceId},
    interrupt::{IrqAction, IrqFlags, IrqReturn},
};
use log::{debug, error, trace, warn};
use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

struct Allocation {
    device: DeviceId,
    rid: u32,
    shareable: bool,
    cpu: Option<u32>,
}

struct Installation {
    irq: u32,
    resource: u64,
    dispatch: DispatchFn,
    action: Arc<IrqAction>,
}

pub struct SimBus {
    ncpus: u32,
    devices: RwLock<Vec<Arc<Device>>>,
    allocations: Mutex<BTreeMap<u64, Allocation>>,
    // Held for reading across a dispatch, so teardown waits it out.
    installations: RwLock<BTreeMap<u64, Installation>>,
    next_id: AtomicU64,
    alloc_calls: AtomicUsize,
    fail_alloc: AtomicBool,
    fail_install: Mutex<Option<Errno>>,
    delivered: AtomicU64,
}

impl SimBus {
    pub fn new(ncpus: u32) -> SimBus {
        SimBus {
            ncpus: ncpus.max(1),
            devices: RwLock::new(Vec::new()),
            allocations: Mutex::new(BTreeMap::new()),
            installations: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            alloc_calls: AtomicUsize::new(0),
            fail_alloc: AtomicBool::new(false),
            fail_install: Mutex::new(None),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn add_device(&self, device: Device) -> Arc<Device> {
        debug!(
            "SimBus: attached {} (irq {}, msix {}..{})",
            device.name(),
            device.irq(),
            device.msix(),
            device.msix().saturating_add(device.msix_count())
        );
        let device = Arc::new(device);
        self.devices.write().push(device.clone());
        device
    }

    pub fn ncpus(&self) -> u32 {
        self.ncpus
    }

    /// Number of `allocate_resource` calls made so far, failed ones included.
    pub fn alloc_calls(&self) -> usize {
        self.alloc_calls.load(Ordering::SeqCst)
    }

    /// Resources currently held by callers.
    pub fn outstanding(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Trampolines currently installed.
    pub fn installed(&self) -> usize {
        self.installations.read().len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn set_fail_alloc(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_install(&self, cause: Option<Errno>) {
        *self.fail_install.lock() = cause;
    }

    /// CPU the resource behind (`device`, `rid`) is bound to, if any.
    pub fn affinity(&self, device: DeviceId, rid: u32) -> Option<u32> {
        self.allocations
            .lock()
            .values()
            .find(|a| a.device == device && a.rid == rid)
            .and_then(|a| a.cpu)
    }

    /// Raises `irq` the way the host interrupt path would: every trampoline
    /// installed for it runs before this returns.
    ///
    /// Returns `None` for a stray interrupt nobody installed.
    pub fn deliver(&self, irq: u32) -> Option<IrqReturn> {
        let installations = self.installations.read();
        let mut ret = None;
        for inst in installations.values().filter(|inst| inst.irq == irq) {
            let r = (inst.dispatch)(&inst.action);
            if ret != Some(IrqReturn::Handled) {
                ret = Some(r);
            }
        }
        match ret {
            Some(_) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            None => trace!("SimBus: stray irq {irq}"),
        }
        ret
    }
}

impl Bus for SimBus {
    fn locate_owning_device(&self, irq: u32) -> Option<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .find(|dev| dev.owns_irq(irq))
            .cloned()
    }

    fn allocate_resource(
        &self,
        device: &Device,
        kind: ResourceKind,
        rid: u32,
        flags: IrqFlags,
    ) -> Option<Resource> {
        self.alloc_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_alloc.load(Ordering::SeqCst) {
            debug!("SimBus: injected allocation failure for rid {rid}");
            return None;
        }
        if rid > device.msix_count() {
            warn!("SimBus: {} has no irq rid {rid}", device.name());
            return None;
        }

        let shareable = flags.contains(IrqFlags::SHAREABLE);
        let mut allocations = self.allocations.lock();
        let conflict = allocations
            .values()
            .any(|a| a.device == device.id() && a.rid == rid && !(a.shareable && shareable));
        if conflict {
            debug!("SimBus: rid {rid} of {} is busy", device.name());
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        allocations.insert(
            id,
            Allocation {
                device: device.id(),
                rid,
                shareable,
                cpu: None,
            },
        );
        trace!("SimBus: allocated resource {id} (rid {rid}) for {}", device.name());
        Some(Resource { kind, rid, id })
    }

    fn install_interrupt(
        &self,
        device: &Device,
        resource: &Resource,
        dispatch: DispatchFn,
        action: Arc<IrqAction>,
    ) -> Result<InstallTag, Errno> {
        if let Some(cause) = *self.fail_install.lock() {
            debug!("SimBus: injected install failure ({cause}) for irq {}", action.irq);
            return Err(cause);
        }
        if !self.allocations.lock().contains_key(&resource.id) {
            error!(
                "SimBus: {} installs on unknown resource {}",
                device.name(),
                resource.id
            );
            return Err(Errno::EINVAL);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.installations.write().insert(
            id,
            Installation {
                irq: action.irq,
                resource: resource.id,
                dispatch,
                action,
            },
        );
        Ok(InstallTag(id))
    }

    fn teardown_interrupt(&self, device: &Device, resource: &Resource, tag: InstallTag) {
        match self.installations.write().remove(&tag.0) {
            Some(inst) if inst.resource == resource.id => {}
            Some(_) => warn!(
                "SimBus: {} tore down tag {} through the wrong resource",
                device.name(),
                tag.0
            ),
            None => warn!("SimBus: {} tore down unknown tag {}", device.name(), tag.0),
        }
    }

    fn release_resource(&self, device: &Device, _kind: ResourceKind, rid: u32, resource: Resource) {
        match self.allocations.lock().remove(&resource.id) {
            Some(a) if a.rid == rid => {}
            Some(a) => warn!(
                "SimBus: {} released resource {} as rid {rid}, allocated as rid {}",
                device.name(),
                resource.id,
                a.rid
            ),
            None => warn!(
                "SimBus: {} released unknown resource {}",
                device.name(),
                resource.id
            ),
        }
    }

    fn bind_affinity(&self, device: &Device, resource: &Resource, cpu: u32) -> Result<(), Errno> {
        if cpu >= self.ncpus {
            return Err(Errno::EINVAL);
        }
        let mut allocations = self.allocations.lock();
        let allocation = allocations.get_mut(&resource.id).ok_or(Errno::ENOENT)?;
        allocation.cpu = Some(cpu);
        debug!("SimBus: rid {} of {} bound to cpu {cpu}", resource.rid, device.name());
        Ok(())
    }
}
