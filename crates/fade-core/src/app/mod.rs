//! App - アプリケーション層
//!
//! このモジュールは、ports と index を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **ExpirationSweeper**: 起動時の修復、期限切れの削除、次の期限までの sleep
//! - **SweeperConfig**: sweep 間隔の設定

pub mod config;
pub mod sweeper;

// 主要な型を再エクスポート
pub use self::config::{ConfigError, SweeperConfig};
pub use self::sweeper::{ExpirationSweeper, SweepReport, SweeperHandle};
