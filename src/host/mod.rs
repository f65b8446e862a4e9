pub mod sim;

use crate::{
    device::Device,
    interrupt::{IrqAction, IrqFlags, IrqReturn},
};
use nix::errno::Errno;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Irq,
}

/// Exclusive handle to a host interrupt resource.
///
/// Deliberately neither `Clone` nor `Copy`: giving it back to
/// [`Bus::release_resource`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    pub rid: u32,
    pub id: u64,
}

/// Cookie returned by [`Bus::install_interrupt`], consumed on teardown.
#[derive(Debug, PartialEq, Eq)]
pub struct InstallTag(pub u64);

/// Entry point the host calls when an installed interrupt fires.
pub type DispatchFn = fn(&IrqAction) -> IrqReturn;

/// Everything the compatibility layer needs from the host kernel.
///
/// `teardown_interrupt` must not return while a dispatch through the torn
/// down installation is still running.
pub trait Bus: Send + Sync {
    fn locate_owning_device(&self, irq: u32) -> Option<Arc<Device>>;

    fn allocate_resource(
        &self,
        device: &Device,
        kind: ResourceKind,
        rid: u32,
        flags: IrqFlags,
    ) -> Option<Resource>;

    fn install_interrupt(
        &self,
        device: &Device,
        resource: &Resource,
        dispatch: DispatchFn,
        action: Arc<IrqAction>,
    ) -> Result<InstallTag, Errno>;

    fn teardown_interrupt(&self, device: &Device, resource: &Resource, tag: InstallTag);

    fn release_resource(&self, device: &Device, kind: ResourceKind, rid: u32, resource: Resource);

    fn bind_affinity(&self, device: &Device, resource: &Resource, cpu: u32) -> Result<(), Errno>;
}
