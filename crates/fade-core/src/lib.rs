//! fade-core
//!
//! Disappearing-message expiration index and the sweeper built on it.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, errors）
//! - **ports**: 抽象化レイヤー（MessageStore, Clock, IdGenerator, ExpirationSink）
//! - **index**: 期限切れ / 開始失敗 / 次の期限 の問い合わせ（DisappearingMessagesFinder）
//! - **impls**: 実装（InMemoryMessageStore）
//! - **app**: アプリケーションロジック（ExpirationSweeper, SweeperConfig）

pub mod app;
pub mod domain;
pub mod impls;
pub mod index;
pub mod ports;

pub use index::{DisappearingMessagesFinder, ExpiredMessages};
