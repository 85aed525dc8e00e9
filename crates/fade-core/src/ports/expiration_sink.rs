//! ExpirationSink port - 削除済みメッセージの通知先
//!
//! Sweeper が期限切れメッセージを削除して commit した後に呼ばれる。
//! UI の更新や添付ファイルの掃除など、ストア外の後始末はここで行う。
//!
//! # 実装
//! - NoopExpirationSink: 何もしない（デフォルト）

use async_trait::async_trait;

use crate::domain::MessageRecord;

/// ExpirationSink は commit 済みの削除を受け取る
///
/// 呼び出し時点でトランザクションは閉じている。失敗しても削除は巻き戻らないので
/// 戻り値は持たない。
#[async_trait]
pub trait ExpirationSink: Send + Sync {
    async fn messages_expired(&self, records: &[MessageRecord]);
}

/// 何もしない sink
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExpirationSink;

#[async_trait]
impl ExpirationSink for NoopExpirationSink {
    async fn messages_expired(&self, _records: &[MessageRecord]) {}
}
