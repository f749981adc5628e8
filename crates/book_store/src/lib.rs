use core_types::{BookSnapshot, BookUpdate, Side, TopOfBook};

/// Latest top-of-book per outcome side for the active session.
///
/// Single writer (the orchestrator drains the feed queue into it each tick);
/// readers take value snapshots so both sides are always observed together.
/// A side whose newest quote is older than the staleness threshold reads as
/// absent, which the BOOK gate treats as "no quote".
#[derive(Debug)]
pub struct BookStore {
    session_id: String,
    up: Option<TopOfBook>,
    down: Option<TopOfBook>,
    staleness_ms: i64,
}

impl BookStore {
    pub fn new(session_id: impl Into<String>, staleness_ms: i64) -> Self {
        Self {
            session_id: session_id.into(),
            up: None,
            down: None,
            staleness_ms: staleness_ms.max(1),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Overwrites the slot for the update's side. Updates tagged with a
    /// different session id (late arrivals across a boundary) are dropped.
    pub fn apply(&mut self, update: &BookUpdate) -> bool {
        if update.session_id != self.session_id {
            return false;
        }
        let top = TopOfBook {
            bid: update.bid,
            ask: update.ask,
            last_update_ms: update.server_ts_ms,
        };
        match update.side {
            Side::Up => self.up = Some(top),
            Side::Down => self.down = Some(top),
        }
        true
    }

    pub fn snapshot(&self, now_ms: i64) -> BookSnapshot {
        BookSnapshot {
            up: self.fresh(self.up, now_ms),
            down: self.fresh(self.down, now_ms),
        }
    }

    /// Discards both slots and rebinds the store to a new session.
    pub fn reset_for_session(&mut self, session_id: impl Into<String>) {
        self.session_id = session_id.into();
        self.up = None;
        self.down = None;
    }

    fn fresh(&self, slot: Option<TopOfBook>, now_ms: i64) -> Option<TopOfBook> {
        slot.filter(|top| now_ms.saturating_sub(top.last_update_ms) <= self.staleness_ms)
    }
}
