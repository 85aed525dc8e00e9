//! Expiration index: read-side queries over a message store transaction.
//!
//! Three views, all computed against the transaction they are handed:
//! - messages whose deadline has passed (soonest-expired first)
//! - messages whose countdown should be running but was never stamped
//! - the soonest pending deadline
//!
//! The finder holds no state besides its clock and never mutates the store.
//! Calling all three with the same transaction gives mutually consistent
//! results.

use std::collections::HashSet;

use tracing::trace;

use crate::domain::{MessageId, MessageRecord, StoreError, TimestampMs};
use crate::ports::{Clock, ReadTransaction};

/// DisappearingMessagesFinder は期限切れ処理のための問い合わせ面
///
/// # 使用例
/// ```ignore
/// let finder = DisappearingMessagesFinder::new(SystemClock);
/// store.read(|tx| {
///     finder.enumerate_expired(tx, |message| expired.push(message.unique_id))?;
///     finder.next_expiration_timestamp(tx)
/// })?;
/// ```
#[derive(Debug, Clone)]
pub struct DisappearingMessagesFinder<C> {
    clock: C,
}

impl<C: Clock> DisappearingMessagesFinder<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// 期限切れのメッセージを `expires_at` 昇順で遅延的に返す
    ///
    /// イテレータはトランザクションを借用するので、閉じる前に使い切ること。
    /// ストアが返したレコードは期限切れかどうかを再確認し、矛盾したものは飛ばす。
    pub fn expired_messages<'tx>(
        &self,
        tx: &'tx dyn ReadTransaction,
    ) -> Result<ExpiredMessages<'tx>, StoreError> {
        let now = self.clock.now_millis();
        Ok(ExpiredMessages {
            now,
            inner: tx.scan_by_expires_at(now)?,
        })
    }

    /// [`expired_messages`](Self::expired_messages) の visitor 版
    pub fn enumerate_expired<F>(
        &self,
        tx: &dyn ReadTransaction,
        mut visit: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(&MessageRecord),
    {
        for message in self.expired_messages(tx)? {
            visit(message);
        }
        Ok(())
    }

    /// カウントダウンが開始されているべきなのに開始時刻がないメッセージの ID
    ///
    /// クラッシュ後のバックログが大きくなりうるので ID だけを返す。
    pub fn fetch_failed_to_start_ids(
        &self,
        tx: &dyn ReadTransaction,
    ) -> Result<HashSet<MessageId>, StoreError> {
        Ok(tx
            .scan_unstarted()?
            .filter(|message| message.failed_to_start_expiring())
            .map(|message| message.unique_id)
            .collect())
    }

    /// カウントダウン中のメッセージのうち最も早い期限
    ///
    /// ストアの `expires_at` インデックスの先頭から取る。カウントダウン中のものがなければ `None`。
    /// インデックスが `(expires_at, unique_id)` 順である限り、同じトランザクションで
    /// 最初に列挙される期限切れメッセージの期限と一致する。
    pub fn next_expiration_timestamp(
        &self,
        tx: &dyn ReadTransaction,
    ) -> Result<Option<TimestampMs>, StoreError> {
        match tx.first_by_expires_at()? {
            None => Ok(None),
            Some(head) => match head.expires_at() {
                Some(at) => Ok(Some(at)),
                None => {
                    // 先頭が壊れているときだけ、期限を持つ最初のレコードまで進む
                    trace!(id = %head.unique_id, "skipping inconsistent expiry record");
                    Ok(tx
                        .scan_by_expires_at(TimestampMs::MAX)?
                        .find_map(MessageRecord::expires_at))
                }
            },
        }
    }
}

/// [`DisappearingMessagesFinder::expired_messages`] が返すイテレータ
pub struct ExpiredMessages<'tx> {
    now: TimestampMs,
    inner: Box<dyn Iterator<Item = &'tx MessageRecord> + 'tx>,
}

impl<'tx> Iterator for ExpiredMessages<'tx> {
    type Item = &'tx MessageRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let message = self.inner.next()?;
            if message.is_expired(self.now) {
                return Some(message);
            }
            trace!(id = %message.unique_id, "skipping inconsistent expiry record");
        }
    }
}
