//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（端末の DB、時計、UI 通知など）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - メッセージストアが source of truth（正本）
//! - Index はストアのトランザクションに対する読み取り専用のビュー
//! - 時刻は Clock 経由でのみ取得する（テストで差し替え可能）

pub mod clock;
pub mod expiration_sink;
pub mod id_generator;
pub mod message_store;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::expiration_sink::{ExpirationSink, NoopExpirationSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::message_store::{MessageStore, ReadTransaction, WriteTransaction};
