//! Errors - トランザクション層のエラー
//!
//! Index 自体は独自のエラー種別を持たない。ストアの失敗はそのまま呼び出し元へ伝播する。
//! 「期限切れなし」「次の期限なし」はエラーではなく、空の結果 / `None` で表す。

use thiserror::Error;

use super::ids::MessageId;

/// StoreError はメッセージストアのトランザクションで発生するエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// ストアが利用できない（ロックの poison なども含む）
    #[error("message store unavailable: {0}")]
    Unavailable(String),

    /// セカンダリインデックスと本体の不整合
    #[error("expiration index corrupted: {0}")]
    CorruptIndex(String),

    #[error("message not found: {0}")]
    NotFound(MessageId),

    #[error("{0}")]
    Other(String),
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
