//! ExpirationSweeper - 期限切れメッセージの削除ループ
//!
//! # フロー
//! 1. 起動時: 開始に失敗したメッセージを探し、`expire_started_at = now` を書き込む
//! 2. 読み取りトランザクションで期限切れを列挙
//! 3. 書き込みトランザクションで削除（トランザクション内で期限切れを再確認）
//! 4. commit 後に ExpirationSink へ通知
//! 5. 次の期限まで sleep（nudge / shutdown で中断）

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::SweeperConfig;
use crate::domain::{MessageId, MessageRecord, StoreError, TimestampMs};
use crate::index::DisappearingMessagesFinder;
use crate::ports::{Clock, ExpirationSink, MessageStore};

/// 1 回の sweep の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub next_expiration: Option<TimestampMs>,
}

/// ExpirationSweeper は Index を使って期限切れを削除する
///
/// `Arc` で共有し、`spawn` でループを起動する。`start_expiration` は
/// ループ実行中でも呼べて、ループを起こす。
pub struct ExpirationSweeper<S, C, K> {
    store: Arc<S>,
    finder: DisappearingMessagesFinder<C>,
    sink: K,
    config: SweeperConfig,
    wake: Arc<Notify>,
}

impl<S, C, K> ExpirationSweeper<S, C, K>
where
    S: MessageStore,
    C: Clock,
    K: ExpirationSink,
{
    pub fn new(store: Arc<S>, clock: C, sink: K, config: SweeperConfig) -> Self {
        Self {
            store,
            finder: DisappearingMessagesFinder::new(clock),
            sink,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// 開始に失敗したメッセージすべてに `now` を開始時刻として書き込む
    ///
    /// 書き込んだ件数を返す。読み取り後に削除・開始された ID は飛ばす。
    pub fn repair_failed_to_start(&self) -> Result<usize, StoreError> {
        let ids = self
            .store
            .read(|tx| self.finder.fetch_failed_to_start_ids(tx))?;
        if ids.is_empty() {
            return Ok(0);
        }

        let now = self.finder.clock().now_millis();
        let repaired = self.store.write(|tx| {
            let mut repaired = 0;
            for id in &ids {
                match tx.start_expiration(id, now) {
                    Ok(true) => repaired += 1,
                    Ok(false) | Err(StoreError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(repaired)
        })?;

        if repaired > 0 {
            warn!(
                repaired,
                found = ids.len(),
                "started expiration for messages that failed to start expiring"
            );
            self.wake.notify_one();
        }
        Ok(repaired)
    }

    /// 1 件のカウントダウンを開始してループを起こす
    pub fn start_expiration(
        &self,
        id: &MessageId,
        started_at: TimestampMs,
    ) -> Result<bool, StoreError> {
        let stamped = self
            .store
            .write(|tx| tx.start_expiration(id, started_at))?;
        if stamped {
            debug!(%id, started_at, "expiration started");
            self.wake.notify_one();
        }
        Ok(stamped)
    }

    /// 期限切れをすべて削除し、次の期限を返す
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let expired: Vec<MessageId> = self.store.read(|tx| {
            Ok(self
                .finder
                .expired_messages(tx)?
                .map(|message| message.unique_id)
                .collect())
        })?;

        let deleted = if expired.is_empty() {
            Vec::new()
        } else {
            self.delete_expired(&expired)?
        };

        if !deleted.is_empty() {
            info!(count = deleted.len(), "deleted expired messages");
            self.sink.messages_expired(&deleted).await;
        }

        let next_expiration = self
            .store
            .read(|tx| self.finder.next_expiration_timestamp(tx))?;

        Ok(SweepReport {
            deleted: deleted.len(),
            next_expiration,
        })
    }

    fn delete_expired(&self, ids: &[MessageId]) -> Result<Vec<MessageRecord>, StoreError> {
        let now = self.finder.clock().now_millis();
        self.store.write(|tx| {
            let mut deleted = Vec::with_capacity(ids.len());
            for id in ids {
                // 読み取り後に開始時刻が書き換わっていることがある
                let still_expired = tx.get(id)?.is_some_and(|m| m.is_expired(now));
                if !still_expired {
                    continue;
                }
                if let Some(record) = tx.remove(id)? {
                    deleted.push(record);
                }
            }
            Ok(deleted)
        })
    }

    /// 次の sweep までの sleep 時間
    ///
    /// `next - now + wake_epsilon` を `[min_interval, fallback_interval]` に収める。
    pub fn next_wake_delay(&self, next_expiration: Option<TimestampMs>) -> Duration {
        let fallback = self.config.fallback_interval();
        let Some(at) = next_expiration else {
            return fallback;
        };

        let now = self.finder.clock().now_millis();
        let wait_ms = at
            .saturating_sub(now)
            .saturating_add(self.config.wake_epsilon_ms);
        Duration::from_millis(wait_ms)
            .max(self.config.min_interval())
            .min(fallback)
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        if self.config.repair_on_start
            && let Err(err) = self.repair_failed_to_start()
        {
            warn!(error = %err, "repair of messages that failed to start expiring failed");
        }

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let delay = match self.sweep_once().await {
                Ok(report) => {
                    debug!(
                        deleted = report.deleted,
                        next_expiration = ?report.next_expiration,
                        "sweep finished"
                    );
                    self.next_wake_delay(report.next_expiration)
                }
                Err(err) => {
                    warn!(error = %err, "expiration sweep failed");
                    self.config.fallback_interval()
                }
            };

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // handle dropped
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("expiration sweeper stopped");
    }
}

impl<S, C, K> ExpirationSweeper<S, C, K>
where
    S: MessageStore + 'static,
    C: Clock + 'static,
    K: ExpirationSink + 'static,
{
    /// 現在の tokio ランタイム上でループを起動する
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wake = Arc::clone(&self.wake);
        let join = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });

        SweeperHandle {
            shutdown_tx,
            wake,
            join,
        }
    }
}

/// Sweeper ループのハンドル
/// - `shutdown_tx` を drop するとループが止まる
/// - `shutdown_and_join()` で終了を待てる
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// タイマーを待たずにすぐ sweep させる
    pub fn nudge(&self) {
        self.wake.notify_one();
    }

    /// 現在の sweep が終わったら止める（実行中の sweep は中断しない）
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            warn!(error = %err, "expiration sweeper task failed");
        }
    }
}
