mod correlator;
mod monitor;

pub use correlator::{DeviceCorrelator, DeviceInfo, ExpectationHandle};
pub use monitor::{DeviceEvent, DeviceMonitor, MonitorConfig};
