// src/lib.rs
//
// CAN bus diagnostic core: receive worker with software filtering, monitor and
// tracer views, transmit table with periodic/RTR/Trigger/scenario scheduling.

// Must come first so `tlog!` is in scope for every module below
#[macro_use]
pub mod logging;

pub mod dbc;
pub mod filter;
pub mod io;
pub mod monitor;
pub mod report;
pub mod session;
pub mod settings;
pub mod tracer;
pub mod transmit;
pub mod worker;

pub use dbc::{DbcNames, NameResolver, NoDatabase};
pub use filter::{passes, DiscreteFilter, FilterError, FilterSet, MaskFilter, RangeFilter};
pub use io::{Frame, FrameError, IoError};
pub use monitor::{MonitorCache, MonitorEntry};
pub use report::ExportFormat;
pub use session::{Session, SessionData};
pub use settings::{AppConfig, ConnectionSettings, DeviceKind, SettingsError, Shared};
pub use tracer::{TracerEntry, TracerLog};
pub use transmit::list::ListError;
pub use transmit::{
    ScheduleError, Scheduler, SlotId, TransmitSlot, TransmitTable, TxMode, ValidationError,
};
pub use worker::{FrameHook, ReceiveWorker, SendHandle, WorkerEvent, WorkerState};
