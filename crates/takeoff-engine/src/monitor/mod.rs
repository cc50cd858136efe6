//! Background bookkeeping over the run registry: the periodic timeout monitor and the
//! once-per-process recovery sweep

mod recovery;
mod timeout;

pub use recovery::{RecoveryReport, RecoverySweep};
pub use timeout::{MonitorTickReport, TimeoutMonitor};
