//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **IoRuntime**: ネットワーク配送とディスク完了を動かす tokio ランタイム
//! - **LocalNetwork**: プロセス内の Transport
//! - **StdDisk**: std::fs による DiskProvider

pub mod io_runtime;
pub mod local_network;
pub mod std_disk;

pub use self::io_runtime::IoRuntime;
pub use self::local_network::LocalNetwork;
pub use self::std_disk::StdDisk;
