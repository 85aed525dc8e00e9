//! MessageStore port - メッセージストアの正本（source of truth）
//!
//! ストアはメッセージ本体と、期限切れ処理のためのセカンダリインデックスを管理します：
//! - `expires_at` 昇順のインデックス（カウントダウン開始済みの候補のみ）
//! - カウントダウン未開始の候補の集合
//!
//! # 設計原則
//! - すべての操作は明示的に渡されたトランザクション上で行う（グローバルなストア参照はしない）
//! - 読み取りトランザクションは 1 つのスナップショットを観測する
//! - 書き込みトランザクションは `Ok` で commit、`Err` で全変更を破棄する

use std::sync::Arc;

use crate::domain::{MessageId, MessageRecord, StoreError, TimestampMs};

/// 1 つのスナップショットに対する読み取り専用ビュー
///
/// 借用したレコードの寿命はトランザクションと同じなので、トランザクションの外へは持ち出せない。
pub trait ReadTransaction {
    fn get(&self, id: &MessageId) -> Result<Option<&MessageRecord>, StoreError>;

    /// カウントダウン中で `expires_at <= upper_inclusive` のレコード
    ///
    /// 順序は `(expires_at, unique_id)` の昇順。順序付きインデックスから返すこと:
    /// イテレータは遅延評価で、先頭を取るだけでテーブル全体を走査してはいけない。
    fn scan_by_expires_at(
        &self,
        upper_inclusive: TimestampMs,
    ) -> Result<Box<dyn Iterator<Item = &MessageRecord> + '_>, StoreError>;

    /// `expires_at` インデックスの先頭（最も早い期限）のレコード
    ///
    /// `scan_by_expires_at` の最初の要素と同じものを返す。
    fn first_by_expires_at(&self) -> Result<Option<&MessageRecord>, StoreError> {
        Ok(self.scan_by_expires_at(TimestampMs::MAX)?.next())
    }

    /// カウントダウン未開始の候補（`expires_in_seconds > 0`）。順序は不定。
    fn scan_unstarted(&self) -> Result<Box<dyn Iterator<Item = &MessageRecord> + '_>, StoreError>;

    /// スナップショット内のメッセージ数
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 書き込みトランザクション。インデックスは呼び出しごとに本体と同期する。
pub trait WriteTransaction: ReadTransaction {
    /// レコードを追加または置換し、置き換えたレコードを返す
    fn insert(&mut self, record: MessageRecord) -> Result<Option<MessageRecord>, StoreError>;

    fn remove(&mut self, id: &MessageId) -> Result<Option<MessageRecord>, StoreError>;

    /// カウントダウンを開始する
    ///
    /// 未開始、または既存の開始時刻より早い場合だけ書き換える。
    /// 非候補（TTL 0）や `started_at == 0` は何もしない。
    /// 書き換えたら `true`。存在しない ID は `StoreError::NotFound`。
    fn start_expiration(
        &mut self,
        id: &MessageId,
        started_at: TimestampMs,
    ) -> Result<bool, StoreError>;

    /// 既読にする。存在しない ID は `StoreError::NotFound`。
    fn mark_read(&mut self, id: &MessageId) -> Result<(), StoreError>;
}

/// MessageStore はトランザクションを開く入口
///
/// `read` / `write` はクロージャの実行中だけトランザクションを保持する。
pub trait MessageStore: Send + Sync {
    fn read<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&dyn ReadTransaction) -> Result<R, StoreError>;

    fn write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn WriteTransaction) -> Result<R, StoreError>;
}

impl<S: MessageStore + ?Sized> MessageStore for Arc<S> {
    fn read<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&dyn ReadTransaction) -> Result<R, StoreError>,
    {
        (**self).read(f)
    }

    fn write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn WriteTransaction) -> Result<R, StoreError>,
    {
        (**self).write(f)
    }
}
