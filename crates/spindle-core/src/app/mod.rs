//! App - サービスの登録とプロセスの起動
//!
//! # 主要コンポーネント
//! - **Config**: JSON の起動パラメータ
//! - **ServiceRegistry**: サービス名 → ファクトリ
//! - **ServiceNode**: アプリ 1 つ分の executor / dispatcher / file engine
//! - **System**: 起動と全体ビュー（config, get_current_app, get_all_apps）

pub mod config;
pub mod node;
pub mod registry;
pub mod system;

pub use self::config::{AppConfig, Config, NetworkConfig};
pub use self::node::ServiceNode;
pub use self::registry::{RegistryError, ServiceApp, ServiceFactory, ServiceRegistry};
pub use self::system::{AppInfo, System};
