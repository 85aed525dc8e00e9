use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fade_core::DisappearingMessagesFinder;
use fade_core::app::{ExpirationSweeper, SweeperConfig};
use fade_core::domain::{MessageKind, MessageRecord};
use fade_core::impls::InMemoryMessageStore;
use fade_core::ports::{
    Clock, ExpirationSink, IdGenerator, MessageStore, SystemClock, UlidGenerator,
};

/// seed ファイルの 1 エントリ（開始時刻は「何ミリ秒前に開始したか」で指定）
#[derive(Debug, Deserialize)]
struct SeedMessage {
    kind: MessageKind,
    expires_in_seconds: u32,
    #[serde(default)]
    started_ago_ms: Option<u64>,
    #[serde(default)]
    read: bool,
}

/// デフォルトの seed
/// - 1 件目: 2 時間前に開始、TTL 1 時間（期限切れ）
/// - 2 件目: 既読なのに未開始（起動時に修復される）
/// - 3 件目: いま開始、2 秒後に期限
/// - 4 件目: 期限なし
/// - 5 件目: 未読の受信（開始しない）
const DEFAULT_SEED: &str = r#"[
  {"kind": "incoming", "expires_in_seconds": 3600, "started_ago_ms": 7200000, "read": true},
  {"kind": "incoming", "expires_in_seconds": 3, "read": true},
  {"kind": "outgoing", "expires_in_seconds": 2, "started_ago_ms": 0},
  {"kind": "outgoing", "expires_in_seconds": 0},
  {"kind": "incoming", "expires_in_seconds": 5}
]"#;

/// 削除通知をログに出すだけの sink
struct LoggingSink;

#[async_trait]
impl ExpirationSink for LoggingSink {
    async fn messages_expired(&self, records: &[MessageRecord]) {
        for record in records {
            info!(id = %record.unique_id, kind = ?record.kind, "message disappeared");
        }
    }
}

fn seed_store(seed: &[SeedMessage], clock: &SystemClock) -> InMemoryMessageStore {
    let ids = UlidGenerator::new(*clock);
    let now = clock.now_millis();
    InMemoryMessageStore::with_records(seed.iter().map(|s| {
        let started_at = s
            .started_ago_ms
            .map(|ago| now.saturating_sub(ago).max(1))
            .unwrap_or(0);
        MessageRecord::new(ids.generate_message_id(), s.kind, s.expires_in_seconds)
            .with_expire_started_at(started_at)
            .with_read(s.read)
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // usage: fade-cli [config.json] [seed.json]
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SweeperConfig::load(path)?,
        None => SweeperConfig {
            fallback_interval_ms: 2000,
            ..SweeperConfig::default_v1()
        },
    };
    let seed_json = match args.next() {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEFAULT_SEED.to_string(),
    };
    let seed: Vec<SeedMessage> = serde_json::from_str(&seed_json)?;

    // (A) ストアを用意して、起動前の状態を 1 つのスナップショットで確認
    let clock = SystemClock;
    let store = Arc::new(seed_store(&seed, &clock));
    let finder = DisappearingMessagesFinder::new(clock);
    let (expired, failed, next) = store.read(|tx| {
        let mut expired = Vec::new();
        finder.enumerate_expired(tx, |m| expired.push(m.unique_id.to_string()))?;
        Ok((
            expired,
            finder.fetch_failed_to_start_ids(tx)?,
            finder.next_expiration_timestamp(tx)?,
        ))
    })?;
    println!(
        "before: messages={} expired={:?} failed_to_start={} next_expiration={:?}",
        seed.len(),
        expired,
        failed.len(),
        next
    );

    // (B) sweeper を起動（起動時に修復 → sweep → 次の期限まで sleep）
    let sweeper = Arc::new(ExpirationSweeper::new(
        Arc::clone(&store),
        clock,
        LoggingSink,
        config,
    ));
    let handle = Arc::clone(&sweeper).spawn();

    // (C) 期限付きのメッセージがなくなるまでポーリング（Ctrl-C でも抜ける）
    loop {
        let next = store.read(|tx| finder.next_expiration_timestamp(tx))?;
        if next.is_none() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(Duration::from_millis(250)) => {}
        }
    }

    handle.shutdown_and_join().await;
    store.check_integrity()?;

    let remaining = store.read(|tx| Ok(tx.len()))?;
    let report = sweeper.sweep_once().await?;
    println!(
        "after: remaining={} report={}",
        remaining,
        serde_json::to_string(&report)?
    );
    Ok(())
}
