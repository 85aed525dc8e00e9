//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryMessageStore**: スナップショット分離付きのメッセージストア
//!
//! # 本番用実装
//! 端末の DB に載せる実装は別クレートに配置します。
//! `MessageStore` の契約（期限順インデックス、スナップショット読み取り）を満たせばよい。

pub mod memory_store;

// 主要な型を再エクスポート
pub use self::memory_store::InMemoryMessageStore;
