//! Hypervisor capability interface.
//!
//! Everything the manager needs from a hypervisor goes through [`Connection`].
//! Connections are opened by a [`Driver`]; [`DriverRegistry`] picks one by URI
//! scheme. The in-process `test://` driver is always available, real hosts need
//! the `libvirt` feature.

pub mod domain_xml;
pub mod driver;
pub mod error;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod test_driver;
pub mod types;

pub use domain_xml::{Device, DeviceKind, DomainSpec};
pub use driver::{Connection, Driver, DriverRegistry, uri_scheme};
pub use error::{HvError, HvErrorKind, Result};
pub use test_driver::{TestDriver, TestHost};
pub use types::*;
