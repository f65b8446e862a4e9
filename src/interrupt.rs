use crate::{
    device::DeviceId,
    host::{InstallTag, Resource},
};
use bitflags::bitflags;
use log::trace;
use std::{fmt, sync::Arc};

bitflags! {
    /// Resource flags understood by the host bus.
    pub struct IrqFlags: u32 {
        const ACTIVE    = 0x0002;
        const SHAREABLE = 0x0004;
    }
}

/// Driver-visible flag allowing an interrupt line to be shared.
pub const IRQF_SHARED: IrqFlags = IrqFlags::SHAREABLE;

/// Completion code handed back to the host after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    None,
    Handled,
}

impl From<bool> for IrqReturn {
    fn from(handled: bool) -> Self {
        if handled {
            IrqReturn::Handled
        } else {
            IrqReturn::None
        }
    }
}

impl IrqReturn {
    pub fn is_handled(self) -> bool {
        self == IrqReturn::Handled
    }
}

pub type IrqHandlerFn = dyn Fn(u32) -> bool + Send + Sync;

/// The immutable half of a registration: what the host hands back to the
/// trampoline on every interrupt.
pub struct IrqAction {
    pub irq: u32,
    pub flags: IrqFlags,
    pub name: String,
    pub device: DeviceId,
    handler: Box<IrqHandlerFn>,
    dev_id: usize,
}

impl IrqAction {
    /// Binds `handler` to its context. The context is kept alive for as long
    /// as the host may still dispatch through this action.
    pub fn new<T, F>(
        irq: u32,
        flags: IrqFlags,
        name: &str,
        device: DeviceId,
        handler: F,
        dev_id: Arc<T>,
    ) -> IrqAction
    where
        T: Send + Sync + 'static,
        F: Fn(u32, &T) -> bool + Send + Sync + 'static,
    {
        let cookie = dev_id_cookie(&dev_id);
        IrqAction {
            irq,
            flags,
            name: name.to_string(),
            device,
            handler: Box::new(move |irq| handler(irq, &*dev_id)),
            dev_id: cookie,
        }
    }

    /// Whether `dev_id` is the context this action was registered with.
    pub fn has_dev_id<T>(&self, dev_id: &Arc<T>) -> bool {
        self.dev_id == dev_id_cookie(dev_id)
    }
}

impl fmt::Debug for IrqAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqAction")
            .field("irq", &self.irq)
            .field("flags", &self.flags)
            .field("name", &self.name)
            .field("device", &self.device)
            .finish()
    }
}

fn dev_id_cookie<T>(dev_id: &Arc<T>) -> usize {
    Arc::as_ptr(dev_id) as *const () as usize
}

/// One active registration, owned by its device's entry map.
///
/// The resource and the installation tag are released exactly once, by
/// handing them back to the bus when the entry is torn down.
#[derive(Debug)]
pub struct IrqEntry {
    pub rid: u32,
    pub resource: Resource,
    pub tag: InstallTag,
    pub action: Arc<IrqAction>,
}

/// Trampoline installed with the host for every registration.
///
/// Only reads the action; the registry alone decides when it goes away.
pub fn irq_dispatch(action: &IrqAction) -> IrqReturn {
    let ret = IrqReturn::from((action.handler)(action.irq));
    trace!(
        "IRQ: dispatched irq {} ({}) on device {} -> {:?}",
        action.irq,
        action.name,
        action.device,
        ret
    );
    ret
}

#[cfg(test)]
mod tests {
    use super::{irq_dispatch, IrqAction, IrqFlags, IrqReturn};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn test_dispatch_passes_irq_and_context() {
        let ctx = Arc::new(AtomicU32::new(0));
        let action = IrqAction::new(
            17,
            IrqFlags::empty(),
            "t",
            0,
            |irq, seen: &AtomicU32| {
                seen.store(irq, Ordering::SeqCst);
                true
            },
            ctx.clone(),
        );
        assert_eq!(IrqReturn::Handled, irq_dispatch(&action));
        assert_eq!(17, ctx.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dispatch_maps_unhandled() {
        let action = IrqAction::new(4, IrqFlags::empty(), "t", 0, |_, _: &()| false, Arc::new(()));
        assert_eq!(IrqReturn::None, irq_dispatch(&action));
        assert!(!irq_dispatch(&action).is_handled());
    }

    #[test]
    fn test_dev_id_identity() {
        let ctx = Arc::new(5u8);
        let other = Arc::new(5u8);
        let action = IrqAction::new(4, IrqFlags::empty(), "t", 0, |_, _: &u8| true, ctx.clone());
        assert!(action.has_dev_id(&ctx));
        assert!(!action.has_dev_id(&other));
    }
}
