//! InMemoryMessageStore - 開発用・テスト用のメッセージストア
//!
//! # 学習ポイント
//! - `RwLock<Arc<_>>` によるスナップショット分離
//! - 書き込みは複製した state に対して行い、commit でポインタを差し替える
//! - 書き込み同士は専用の `Mutex` で直列化（読み取りは止めない）
//! - `BTreeSet<(expires_at, id)>` による期限順のセカンダリインデックス

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;
use ulid::Ulid;

use crate::domain::{MessageId, MessageRecord, StoreError, TimestampMs};
use crate::ports::{MessageStore, ReadTransaction, WriteTransaction};

/// コミット済みのスナップショット（本体 + 2 つのセカンダリインデックス）
///
/// 書き込みトランザクションの作業用コピーとしてもそのまま使う。
#[derive(Debug, Clone, Default)]
struct StoreState {
    records: HashMap<MessageId, MessageRecord>,

    /// カウントダウン中の候補（期限順）
    by_expires_at: BTreeSet<(TimestampMs, MessageId)>,

    /// カウントダウン未開始の候補
    unstarted: BTreeSet<MessageId>,
}

impl StoreState {
    fn index(&mut self, record: &MessageRecord) {
        if let Some(at) = record.expires_at() {
            self.by_expires_at.insert((at, record.unique_id));
        } else if record.is_candidate() && !record.has_started_expiring() {
            self.unstarted.insert(record.unique_id);
        }
    }

    fn unindex(&mut self, record: &MessageRecord) {
        if let Some(at) = record.expires_at() {
            self.by_expires_at.remove(&(at, record.unique_id));
        }
        self.unstarted.remove(&record.unique_id);
    }

    fn put(&mut self, record: MessageRecord) -> Option<MessageRecord> {
        let previous = self.records.insert(record.unique_id, record.clone());
        if let Some(previous) = &previous {
            self.unindex(previous);
        }
        self.index(&record);
        previous
    }

    fn take(&mut self, id: &MessageId) -> Option<MessageRecord> {
        let removed = self.records.remove(id)?;
        self.unindex(&removed);
        Some(removed)
    }

    fn check_integrity(&self) -> Result<(), StoreError> {
        let mut expected_by_expires_at = BTreeSet::new();
        let mut expected_unstarted = BTreeSet::new();
        for record in self.records.values() {
            if let Some(at) = record.expires_at() {
                expected_by_expires_at.insert((at, record.unique_id));
            } else if record.is_candidate() && !record.has_started_expiring() {
                expected_unstarted.insert(record.unique_id);
            }
        }

        if expected_by_expires_at != self.by_expires_at {
            return Err(StoreError::CorruptIndex(format!(
                "expires_at index has {} entries, records imply {}",
                self.by_expires_at.len(),
                expected_by_expires_at.len()
            )));
        }
        if expected_unstarted != self.unstarted {
            return Err(StoreError::CorruptIndex(format!(
                "unstarted index has {} entries, records imply {}",
                self.unstarted.len(),
                expected_unstarted.len()
            )));
        }
        Ok(())
    }
}

impl ReadTransaction for StoreState {
    fn get(&self, id: &MessageId) -> Result<Option<&MessageRecord>, StoreError> {
        Ok(self.records.get(id))
    }

    fn scan_by_expires_at(
        &self,
        upper_inclusive: TimestampMs,
    ) -> Result<Box<dyn Iterator<Item = &MessageRecord> + '_>, StoreError> {
        let upper = (upper_inclusive, MessageId::from_ulid(Ulid(u128::MAX)));
        Ok(Box::new(
            self.by_expires_at
                .range(..=upper)
                .filter_map(move |(_, id)| self.records.get(id)),
        ))
    }

    fn first_by_expires_at(&self) -> Result<Option<&MessageRecord>, StoreError> {
        Ok(self
            .by_expires_at
            .first()
            .and_then(|(_, id)| self.records.get(id)))
    }

    fn scan_unstarted(&self) -> Result<Box<dyn Iterator<Item = &MessageRecord> + '_>, StoreError> {
        Ok(Box::new(
            self.unstarted
                .iter()
                .filter_map(move |id| self.records.get(id)),
        ))
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

impl WriteTransaction for StoreState {
    fn insert(&mut self, record: MessageRecord) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.put(record))
    }

    fn remove(&mut self, id: &MessageId) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.take(id))
    }

    fn start_expiration(
        &mut self,
        id: &MessageId,
        started_at: TimestampMs,
    ) -> Result<bool, StoreError> {
        let record = self.records.get(id).ok_or(StoreError::NotFound(*id))?;

        let earlier = !record.has_started_expiring() || started_at < record.expire_started_at;
        if !record.is_candidate() || started_at == 0 || !earlier {
            return Ok(false);
        }

        let updated = record.clone().with_expire_started_at(started_at);
        self.put(updated);
        Ok(true)
    }

    fn mark_read(&mut self, id: &MessageId) -> Result<(), StoreError> {
        let record = self.records.get(id).ok_or(StoreError::NotFound(*id))?;
        if record.read {
            return Ok(());
        }
        let updated = record.clone().with_read(true);
        self.put(updated);
        Ok(())
    }
}

/// InMemoryMessageStore はスナップショット分離付きのメッセージストア
///
/// # 実装詳細
/// - コミット済みの状態は `RwLock<Arc<StoreState>>`
/// - 読み取り: Arc を clone してすぐロックを離す。以降の commit の影響を受けない
/// - 書き込み: `writer` で直列化し、最新のスナップショットを複製した作業用の state を更新する。
///   `Ok` のときだけ Arc を差し替える（RwLock の write は差し替えの間だけ）
/// - クロージャが `Err` を返しても panic しても、作業用の state は捨てられるだけ
///
/// `write` のクロージャ内から `read` を呼んでもよい（未 commit の変更は見えない）。
/// `write` の入れ子は `writer` で止まるので不可。
pub struct InMemoryMessageStore {
    writer: Mutex<()>,
    current: RwLock<Arc<StoreState>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::from_state(StoreState::default())
    }

    /// レコードを投入済みのストアを作成
    pub fn with_records(records: impl IntoIterator<Item = MessageRecord>) -> Self {
        let mut state = StoreState::default();
        for record in records {
            state.put(record);
        }
        Self::from_state(state)
    }

    fn from_state(state: StoreState) -> Self {
        Self {
            writer: Mutex::new(()),
            current: RwLock::new(Arc::new(state)),
        }
    }

    fn snapshot(&self) -> Result<Arc<StoreState>, StoreError> {
        Ok(Arc::clone(&*self.current.read()?))
    }

    /// セカンダリインデックスが本体と一致しているか検査する
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        self.snapshot()?.check_integrity()
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn read<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&dyn ReadTransaction) -> Result<R, StoreError>,
    {
        let snapshot = self.snapshot()?;
        f(&*snapshot)
    }

    fn write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn WriteTransaction) -> Result<R, StoreError>,
    {
        // () しか守っていないので poison は無視する
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut draft = StoreState::clone(&*self.snapshot()?);

        match f(&mut draft) {
            Ok(value) => {
                *self.current.write()? = Arc::new(draft);
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, "discarding write transaction");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageKind;
    use std::panic::AssertUnwindSafe;

    fn id() -> MessageId {
        MessageId::from_ulid(Ulid::new())
    }

    fn started(ttl: u32, started_at: TimestampMs) -> MessageRecord {
        MessageRecord::new(id(), MessageKind::Outgoing, ttl).with_expire_started_at(started_at)
    }

    fn expiring_ids(store: &InMemoryMessageStore) -> Vec<MessageId> {
        store
            .read(|tx| {
                Ok(tx
                    .scan_by_expires_at(TimestampMs::MAX)?
                    .map(|r| r.unique_id)
                    .collect())
            })
            .unwrap()
    }

    #[test]
    fn scan_by_expires_at_is_ordered_and_bounded() {
        let late = started(10, 1_000); // 11_000
        let early = started(1, 1_000); // 2_000
        let middle = started(5, 1_000); // 6_000
        let store = InMemoryMessageStore::with_records([late.clone(), early.clone(), middle.clone()]);

        assert_eq!(
            expiring_ids(&store),
            vec![early.unique_id, middle.unique_id, late.unique_id]
        );

        let upto_middle: Vec<MessageId> = store
            .read(|tx| Ok(tx.scan_by_expires_at(6_000)?.map(|r| r.unique_id).collect()))
            .unwrap();
        assert_eq!(upto_middle, vec![early.unique_id, middle.unique_id]);
    }

    #[test]
    fn non_candidates_and_anomalies_are_not_indexed() {
        let plain = MessageRecord::new(id(), MessageKind::Incoming, 0);
        let anomaly = MessageRecord::new(id(), MessageKind::Incoming, 0).with_expire_started_at(5);
        let unstarted = MessageRecord::new(id(), MessageKind::Incoming, 30);
        let store = InMemoryMessageStore::with_records([plain, anomaly, unstarted.clone()]);

        assert!(expiring_ids(&store).is_empty());
        let pending: Vec<MessageId> = store
            .read(|tx| Ok(tx.scan_unstarted()?.map(|r| r.unique_id).collect()))
            .unwrap();
        assert_eq!(pending, vec![unstarted.unique_id]);
        store.check_integrity().unwrap();
    }

    #[test]
    fn start_expiration_moves_record_between_indexes() {
        let record = MessageRecord::new(id(), MessageKind::Outgoing, 60);
        let store = InMemoryMessageStore::with_records([record.clone()]);

        let stamped = store
            .write(|tx| tx.start_expiration(&record.unique_id, 1_000))
            .unwrap();
        assert!(stamped);

        // 既に開始済みで、より遅い開始時刻は無視される
        let again = store
            .write(|tx| tx.start_expiration(&record.unique_id, 2_000))
            .unwrap();
        assert!(!again);

        // より早い開始時刻には書き換わる
        let earlier = store
            .write(|tx| tx.start_expiration(&record.unique_id, 500))
            .unwrap();
        assert!(earlier);

        let current = store
            .read(|tx| Ok(tx.get(&record.unique_id)?.cloned()))
            .unwrap()
            .unwrap();
        assert_eq!(current.expire_started_at, 500);
        assert_eq!(expiring_ids(&store), vec![record.unique_id]);
        store.check_integrity().unwrap();
    }

    #[test]
    fn start_expiration_ignores_non_candidates_and_missing_ids() {
        let plain = MessageRecord::new(id(), MessageKind::Outgoing, 0);
        let store = InMemoryMessageStore::with_records([plain.clone()]);

        assert!(!store.write(|tx| tx.start_expiration(&plain.unique_id, 1)).unwrap());

        let missing = id();
        let err = store.write(|tx| tx.start_expiration(&missing, 1)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(m) if m == missing));
    }

    #[test]
    fn replacing_a_record_reindexes_it() {
        let record = started(10, 1_000);
        let store = InMemoryMessageStore::with_records([record.clone()]);

        let replaced = record.clone().with_expire_started_at(0);
        let previous = store.write(|tx| tx.insert(replaced)).unwrap();
        assert_eq!(previous, Some(record));
        assert!(expiring_ids(&store).is_empty());
        store.check_integrity().unwrap();
    }

    #[test]
    fn failed_write_rolls_back_every_change() {
        let kept = started(10, 1_000);
        let unstarted = MessageRecord::new(id(), MessageKind::Incoming, 10);
        let store = InMemoryMessageStore::with_records([kept.clone(), unstarted.clone()]);

        let result: Result<(), StoreError> = store.write(|tx| {
            tx.remove(&kept.unique_id)?;
            tx.mark_read(&unstarted.unique_id)?;
            tx.start_expiration(&unstarted.unique_id, 3_000)?;
            tx.insert(started(1, 1))?;
            Err(StoreError::Other("boom".to_string()))
        });
        assert!(result.is_err());

        let (len, kept_back, unstarted_back) = store
            .read(|tx| {
                Ok((
                    tx.len(),
                    tx.get(&kept.unique_id)?.cloned(),
                    tx.get(&unstarted.unique_id)?.cloned(),
                ))
            })
            .unwrap();
        assert_eq!(len, 2);
        assert_eq!(kept_back, Some(kept.clone()));
        assert_eq!(unstarted_back, Some(unstarted));
        assert_eq!(expiring_ids(&store), vec![kept.unique_id]);
        store.check_integrity().unwrap();
    }

    #[test]
    fn reader_snapshot_is_isolated_from_later_commits() {
        let record = started(10, 1_000);
        let store = Arc::new(InMemoryMessageStore::with_records([record.clone()]));

        let (tx_to_writer, rx_in_writer) = std::sync::mpsc::channel::<()>();
        let (tx_to_reader, rx_in_reader) = std::sync::mpsc::channel::<()>();

        let writer_store = Arc::clone(&store);
        let id_to_remove = record.unique_id;
        let writer = std::thread::spawn(move || {
            rx_in_writer.recv().unwrap();
            writer_store
                .write(|tx| tx.remove(&id_to_remove).map(|_| ()))
                .unwrap();
            tx_to_reader.send(()).unwrap();
        });

        let seen = store
            .read(|tx| {
                tx_to_writer.send(()).unwrap();
                rx_in_reader.recv().unwrap();
                // commit 済みでも、このスナップショットでは見えたまま
                Ok(tx.get(&record.unique_id)?.is_some())
            })
            .unwrap();
        writer.join().unwrap();

        assert!(seen);
        assert!(store.read(|tx| Ok(tx.is_empty())).unwrap());
        store.check_integrity().unwrap();
    }

    #[test]
    fn first_by_expires_at_is_the_soonest_deadline() {
        let late = started(10, 1_000);
        let early = started(1, 1_000);
        let unstarted = MessageRecord::new(id(), MessageKind::Outgoing, 1);
        let store = InMemoryMessageStore::with_records([late, early.clone(), unstarted]);

        let first = store
            .read(|tx| Ok(tx.first_by_expires_at()?.map(|r| r.unique_id)))
            .unwrap();
        assert_eq!(first, Some(early.unique_id));

        let empty = InMemoryMessageStore::new();
        assert!(empty.read(|tx| Ok(tx.first_by_expires_at()?.is_none())).unwrap());
    }

    #[test]
    fn panicking_write_leaves_store_usable() {
        let record = started(10, 1_000);
        let store = InMemoryMessageStore::with_records([record.clone()]);

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            store.write::<(), _>(|tx| {
                tx.remove(&record.unique_id)?;
                panic!("write closure failed midway");
            })
        }));
        assert!(outcome.is_err());

        // 途中の remove は commit されず、ロックも壊れていない
        let still_there = store
            .read(|tx| Ok(tx.get(&record.unique_id)?.cloned()))
            .unwrap();
        assert_eq!(still_there, Some(record.clone()));
        assert_eq!(expiring_ids(&store), vec![record.unique_id]);

        let removed = store.write(|tx| tx.remove(&record.unique_id)).unwrap();
        assert_eq!(removed, Some(record));
        assert!(store.read(|tx| Ok(tx.is_empty())).unwrap());
        store.check_integrity().unwrap();
    }

    #[test]
    fn reader_is_not_blocked_by_a_stalled_writer() {
        let record = started(10, 1_000);
        let store = Arc::new(InMemoryMessageStore::with_records([record.clone()]));

        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let writer_store = Arc::clone(&store);
        let id_to_remove = record.unique_id;
        let writer = std::thread::spawn(move || {
            writer_store
                .write(|tx| {
                    tx.remove(&id_to_remove)?;
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });

        entered_rx.recv().unwrap();
        // writer はクロージャの中で止まっているが、読み取りは終わる
        let seen = store
            .read(|tx| Ok(tx.get(&record.unique_id)?.is_some()))
            .unwrap();
        assert!(seen);

        release_tx.send(()).unwrap();
        writer.join().unwrap();
        assert!(store.read(|tx| Ok(tx.is_empty())).unwrap());
    }

    #[test]
    fn read_inside_write_sees_last_commit() {
        let record = started(10, 1_000);
        let store = InMemoryMessageStore::with_records([record.clone()]);

        let seen_by_reader = store
            .write(|tx| {
                tx.remove(&record.unique_id)?;
                store.read(|snapshot| Ok(snapshot.get(&record.unique_id)?.is_some()))
            })
            .unwrap();
        assert!(seen_by_reader);
        assert!(store.read(|tx| Ok(tx.is_empty())).unwrap());
    }
}
