/// Latch deciding when the viewport is close enough to the oldest loaded
/// bucket to ask for older history. A boundary fires once until data older
/// than it arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillTrigger {
    oldest_known_bucket_start: Option<i64>,
    pending_request_boundary: Option<i64>,
}

impl BackfillTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn oldest_known_bucket_start(&self) -> Option<i64> {
        self.oldest_known_bucket_start
    }

    pub fn pending_request_boundary(&self) -> Option<i64> {
        self.pending_request_boundary
    }

    /// Returns the boundary to backfill from, or `None` when nothing should be
    /// requested (no data yet, viewport far from the edge, or already latched).
    pub fn on_visible_range(&mut self, visible_left_edge_ms: i64, bucket_ms: i64) -> Option<i64> {
        let oldest = self.oldest_known_bucket_start?;
        if visible_left_edge_ms > oldest.saturating_add(bucket_ms) {
            return None;
        }
        if self.pending_request_boundary == Some(oldest) {
            return None;
        }

        self.pending_request_boundary = Some(oldest);
        Some(oldest)
    }

    /// Records the oldest bucket of the series after new data was applied.
    /// Data strictly older than the latched boundary re-arms the trigger.
    pub fn observe_oldest(&mut self, oldest_bucket_start: Option<i64>) {
        let Some(oldest) = oldest_bucket_start else {
            return;
        };

        if let Some(pending) = self.pending_request_boundary {
            if oldest < pending {
                self.pending_request_boundary = None;
            }
        }
        self.oldest_known_bucket_start = Some(oldest);
    }

    /// Clears the latch for `boundary` so the next near-edge report retries it.
    pub fn release(&mut self, boundary: i64) -> bool {
        if self.pending_request_boundary == Some(boundary) {
            self.pending_request_boundary = None;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.oldest_known_bucket_start = None;
        self.pending_request_boundary = None;
    }
}
