//! Message record: the expiry-relevant view of a stored message.

use serde::{Deserialize, Serialize};

use super::ids::MessageId;

/// Unix エポックからのミリ秒
pub type TimestampMs = u64;

/// MessageKind はメッセージの種別
///
/// タイマー開始の条件が種別ごとに異なる:
/// - Outgoing: 送信した時点で開始すべき
/// - Incoming: 既読になった時点で開始すべき
/// - Info: タイマー対象外（グループ更新通知など）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Incoming,
    Outgoing,
    Info,
}

/// MessageRecord はメッセージの期限切れに関わる属性（正本はストア）
///
/// Index は読むだけで、変更はすべて `WriteTransaction` を通す。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub unique_id: MessageId,
    pub kind: MessageKind,

    /// 設定された TTL（秒）。0 なら期限なし
    pub expires_in_seconds: u32,

    /// カウントダウンの開始時刻。0 なら未開始
    #[serde(default)]
    pub expire_started_at: TimestampMs,

    /// 既読フラグ
    #[serde(default)]
    pub read: bool,
}

impl MessageRecord {
    pub fn new(unique_id: MessageId, kind: MessageKind, expires_in_seconds: u32) -> Self {
        Self {
            unique_id,
            kind,
            expires_in_seconds,
            expire_started_at: 0,
            read: false,
        }
    }

    pub fn with_expire_started_at(mut self, started_at: TimestampMs) -> Self {
        self.expire_started_at = started_at;
        self
    }

    pub fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    /// 期限切れ処理の対象か（TTL > 0）
    pub fn is_candidate(&self) -> bool {
        self.expires_in_seconds > 0
    }

    pub fn has_started_expiring(&self) -> bool {
        self.expire_started_at > 0
    }

    /// 期限（絶対時刻）
    ///
    /// 非候補、未開始、`u64` に収まらない期限はすべて `None`。
    pub fn expires_at(&self) -> Option<TimestampMs> {
        if !self.is_candidate() || !self.has_started_expiring() {
            return None;
        }
        u64::from(self.expires_in_seconds)
            .checked_mul(1000)
            .and_then(|ttl_ms| self.expire_started_at.checked_add(ttl_ms))
    }

    pub fn is_expired(&self, now: TimestampMs) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// タイマーが開始されているべきか
    ///
    /// 送信メッセージは常に、受信メッセージは既読のときのみ。
    pub fn should_start_expire_timer(&self) -> bool {
        match self.kind {
            MessageKind::Outgoing => true,
            MessageKind::Incoming => self.read,
            MessageKind::Info => false,
        }
    }

    /// タイマーが動いているべきなのに開始時刻が書かれていない
    pub fn failed_to_start_expiring(&self) -> bool {
        self.is_candidate() && self.should_start_expire_timer() && !self.has_started_expiring()
    }
}
