use irq_compat::{
    host::sim::SimBus, Device, IrqFlags, IrqRegistry, Result, Tasklet, TaskletScheduler,
};
use log::{debug, info, warn};
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

const NIC_IRQ: u32 = 3;
const NIC_MSIX_BASE: u32 = 16;

/// Per-vector receive ring of the simulated NIC.
pub struct RxRing {
    pub vector: u32,
    interrupts: AtomicU64,
    processed: AtomicU64,
    tasklet: OnceLock<Arc<Tasklet>>,
}

impl RxRing {
    fn new(vector: u32) -> RxRing {
        RxRing {
            vector,
            interrupts: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            tasklet: OnceLock::new(),
        }
    }

    fn tasklet(&self) -> Option<&Arc<Tasklet>> {
        self.tasklet.get()
    }
}

/// Top half: acknowledge and defer the ring processing.
fn rx_isr(irq: u32, ring: &RxRing) -> bool {
    ring.interrupts.fetch_add(1, Ordering::Relaxed);
    match ring.tasklet() {
        Some(t) => {
            t.schedule();
            true
        }
        None => {
            warn!("Demo: irq {irq} fired before its tasklet was set up");
            false
        }
    }
}

fn link_isr(irq: u32, link_events: &AtomicU64) -> bool {
    debug!("Demo: link event on irq {irq}");
    link_events.fetch_add(1, Ordering::Relaxed);
    true
}

pub struct DemoSetup {
    pub bus: Arc<SimBus>,
    registry: IrqRegistry<SimBus>,
    scheduler: TaskletScheduler,
    rings: Vec<Arc<RxRing>>,
    link_events: Arc<AtomicU64>,
}

impl DemoSetup {
    pub fn new(workers: usize, vectors: u32) -> io::Result<DemoSetup> {
        let ncpus = std::thread::available_parallelism().map_or(1, |n| n.get() as u32);
        let bus = Arc::new(SimBus::new(ncpus));
        bus.add_device(Device::new(0, "nic0", NIC_IRQ, NIC_MSIX_BASE, vectors));

        let scheduler = TaskletScheduler::new(workers)?;
        let rings = (0..vectors)
            .map(|v| {
                let ring = Arc::new(RxRing::new(NIC_MSIX_BASE + v));
                let bottom = Arc::downgrade(&ring);
                let t = scheduler.tasklet(move || {
                    if let Some(ring) = bottom.upgrade() {
                        ring.processed.fetch_add(1, Ordering::Relaxed);
                    }
                });
                let _ = ring.tasklet.set(t);
                ring
            })
            .collect();

        Ok(DemoSetup {
            registry: IrqRegistry::new(bus.clone()),
            bus,
            scheduler,
            rings,
            link_events: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Irq numbers the device raises, primary line first.
    pub fn irqs(&self) -> Vec<u32> {
        let mut irqs = vec![NIC_IRQ];
        irqs.extend(self.rings.iter().map(|r| r.vector));
        irqs
    }

    pub fn register(&self) -> Result<()> {
        self.registry.register(
            NIC_IRQ,
            link_isr,
            IrqFlags::SHAREABLE,
            "nic0-link",
            self.link_events.clone(),
        )?;
        for (i, ring) in self.rings.iter().enumerate() {
            self.registry.register(
                ring.vector,
                rx_isr,
                IrqFlags::empty(),
                &format!("nic0-rx{i}"),
                ring.clone(),
            )?;
            let ncpus = self.bus.ncpus();
            if let Err(e) = self.registry.bind(ring.vector, i as u32 % ncpus) {
                warn!("Demo: could not bind irq {}: {e}", ring.vector);
            }
        }
        info!("Demo: registered irqs {:?}", self.registry.registered_irqs());
        Ok(())
    }

    /// Interrupt thread entry: play the host's delivery of `irq`.
    pub fn handle_irq(&self, irq: u32) {
        if self.bus.deliver(irq).is_none() {
            warn!("Demo: stray irq {irq}");
        }
    }

    pub fn teardown(mut self) {
        let _ = self.registry.release(NIC_IRQ, &self.link_events);
        for ring in &self.rings {
            if let Err(e) = self.registry.release(ring.vector, ring) {
                warn!("Demo: release of irq {} failed: {e}", ring.vector);
            }
            if let Some(t) = ring.tasklet() {
                t.kill();
            }
        }
        self.registry.shutdown();
        self.scheduler.shutdown();

        info!(
            "Demo: {} interrupts delivered, {} link event(s), {} resource(s) outstanding",
            self.bus.delivered(),
            self.link_events.load(Ordering::Relaxed),
            self.bus.outstanding()
        );
        for ring in &self.rings {
            info!(
                "Demo: irq {}: {} interrupt(s), {} tasklet run(s)",
                ring.vector,
                ring.interrupts.load(Ordering::Relaxed),
                ring.processed.load(Ordering::Relaxed)
            );
        }
    }
}
