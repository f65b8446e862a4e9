//! Interrupt and tasklet compatibility layer.
//!
//! Lets drivers written against the Linux `request_irq` / tasklet API run on
//! top of a host bus that allocates interrupt resources and installs
//! handlers its own way.
//!
//! - [`registry`]: per-device interrupt entries bridged onto a [`host::Bus`],
//!   with [`interrupt::irq_dispatch`] as the trampoline the host calls.
//! - [`tasklet`]: self-serialized, coalescing deferred work drained by a pool
//!   of workers.
//! - [`compat`]: the same operations with errno-style status codes.
//! - [`host::sim`]: an in-process bus used by the demo binary and the tests.

pub mod compat;
pub mod device;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod registry;
pub mod tasklet;

pub use device::{Device, DeviceId};
pub use error::{IrqError, Result};
pub use interrupt::{IrqFlags, IrqReturn, IRQF_SHARED};
pub use registry::{IrqHandle, IrqRegistry};
pub use tasklet::{Tasklet, TaskletScheduler};
