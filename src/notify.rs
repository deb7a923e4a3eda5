use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

/// Booking-lifecycle audit actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeAction {
    ExpertBooking,
    ExpertBookingCancel,
    BookingAccepted,
    BookingRejected,
    AvailabilityChanged,
}

impl NoticeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeAction::ExpertBooking => "expert_booking",
            NoticeAction::ExpertBookingCancel => "expert_booking_cancel",
            NoticeAction::BookingAccepted => "booking_accepted",
            NoticeAction::BookingRejected => "booking_rejected",
            NoticeAction::AvailabilityChanged => "availability_changed",
        }
    }
}

/// One audit record. `details` is a free-form JSON mapping; its shape is
/// owned by the producing operation.
#[derive(Debug, Clone)]
pub struct BookingNotice {
    pub expert_id: Ulid,
    pub user_id: Option<Ulid>,
    pub action: NoticeAction,
    pub details: serde_json::Value,
}

/// Best-effort audit hub, one broadcast channel per expert. Delivery is
/// fire-and-forget: no subscriber, a lagged subscriber, or a closed
/// channel never affects the booking operation that produced the notice.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to an expert's booking-lifecycle stream. Creates the
    /// channel if needed.
    pub fn subscribe(&self, expert_id: Ulid) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .channels
            .entry(expert_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Record a notice. Always succeeds from the caller's point of view.
    pub fn record(&self, notice: BookingNotice) {
        tracing::debug!(
            expert = %notice.expert_id,
            action = notice.action.as_str(),
            "audit"
        );
        if let Some(sender) = self.channels.get(&notice.expert_id) {
            let _ = sender.send(notice);
        }
    }

    /// Remove an expert's channel (nothing re-creates it until the next
    /// subscribe).
    #[allow(dead_code)]
    pub fn remove(&self, expert_id: &Ulid) {
        self.channels.remove(expert_id);
    }
}

/// Convenience constructor for the common detail shape.
pub fn booking_details(
    date: chrono::NaiveDate,
    start: chrono::NaiveTime,
    end: chrono::NaiveTime,
    created_at: Option<Ms>,
) -> serde_json::Value {
    let mut details = serde_json::json!({
        "date": date.format("%Y-%m-%d").to_string(),
        "start_time": start.format("%H:%M").to_string(),
        "end_time": end.format("%H:%M").to_string(),
    });
    if let Some(ts) = created_at {
        details["created_at"] = serde_json::json!(ts);
    }
    details
}
