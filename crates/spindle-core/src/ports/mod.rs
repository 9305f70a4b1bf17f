//! Ports - 外部コラボレータへのインターフェース
//!
//! The core consumes three collaborators: a clock, a transport that moves
//! message bytes between nodes, and a disk subsystem with asynchronous
//! positioned I/O. In-process implementations live in `impls`.

pub mod clock;
pub mod disk;
pub mod transport;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::disk::{DiskCompletion, DiskProvider};
pub use self::transport::{Inbox, Transport};
