use crate::interrupt::IrqEntry;
use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt};

pub type DeviceId = u32;

/// A device as seen by the compatibility layer.
///
/// The host owns the device; the layer only keeps the per-device map of
/// active interrupt entries, keyed and ordered by irq number.
pub struct Device {
    id: DeviceId,
    name: String,
    irq: u32,
    msix: u32,
    msix_count: u32,
    pub(crate) irqents: Mutex<BTreeMap<u32, IrqEntry>>,
}

impl Device {
    pub fn new(id: DeviceId, name: &str, irq: u32, msix: u32, msix_count: u32) -> Device {
        Device {
            id,
            name: name.to_string(),
            irq,
            msix,
            msix_count,
            irqents: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary (legacy) interrupt line.
    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// First irq number of the MSI-X vector block.
    pub fn msix(&self) -> u32 {
        self.msix
    }

    pub fn msix_count(&self) -> u32 {
        self.msix_count
    }

    pub fn owns_irq(&self, irq: u32) -> bool {
        irq == self.irq || (irq >= self.msix && irq - self.msix < self.msix_count)
    }

    /// Resource id used to request `irq` from the bus: 0 for the primary
    /// line, 1-based vector index for MSI-X.
    pub fn irq_rid(&self, irq: u32) -> Option<u32> {
        if irq == self.irq {
            return Some(0);
        }
        irq.checked_sub(self.msix).and_then(|v| v.checked_add(1))
    }

    /// Irq numbers currently registered on this device, ascending.
    pub fn active_irqs(&self) -> Vec<u32> {
        self.irqents.lock().keys().copied().collect()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("irq", &self.irq)
            .field("msix", &self.msix)
            .field("msix_count", &self.msix_count)
            .finish()
    }
}
